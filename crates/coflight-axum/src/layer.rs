//! The coalescing middleware: leader election in front of the handler
//! chain, result capture on the leader's response, and verbatim replay to
//! followers.
//!
//! The inner service's return value is the single terminal emission of the
//! handler chain, so capture needs no interception of the response object:
//! the leader arm buffers the response once, settles the flight with the
//! captured status/headers/body, and forwards an identical response to the
//! leader's own caller.

use crate::config::CoalesceConfig;
use axum::{body::Body, extract::Request, response::Response};
use coflight::{CapturedResponse, Entry, Error, Fingerprint, Outcome, Registry};
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use http::{HeaderMap, HeaderValue, StatusCode, header};
use std::sync::Arc;
use tower::{Layer, Service};

/// Tower layer that wires request coalescing in front of a service.
///
/// Clones of the layer, and every service it wraps, share one registry: the
/// dedup scope is the layer instance, not the route.
#[derive(Clone)]
pub struct CoalesceLayer {
    registry: Arc<Registry>,
    config: Arc<CoalesceConfig>,
}

impl CoalesceLayer {
    pub fn new(config: CoalesceConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new(config.ttl)),
            config: Arc::new(config),
        }
    }

    /// Registry shared by every service this layer wraps. Exposed for
    /// observability and tests.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl Default for CoalesceLayer {
    fn default() -> Self {
        Self::new(CoalesceConfig::default())
    }
}

impl<S> Layer<S> for CoalesceLayer {
    type Service = Coalesce<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Coalesce {
            inner,
            registry: Arc::clone(&self.registry),
            config: Arc::clone(&self.config),
        }
    }
}

/// Service produced by [`CoalesceLayer`].
#[derive(Clone)]
pub struct Coalesce<S> {
    inner: S,
    registry: Arc<Registry>,
    config: Arc<CoalesceConfig>,
}

impl<S> Service<Request> for Coalesce<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Error: fmt::Display + Send,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // Swap in the clone and run the original, which poll_ready vouched
        // for.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);
        Box::pin(coordinate(inner, registry, config, req))
    }
}

async fn coordinate<S>(
    mut inner: S,
    registry: Arc<Registry>,
    config: Arc<CoalesceConfig>,
    req: Request,
) -> Result<Response, S::Error>
where
    S: Service<Request, Response = Response>,
    S::Error: fmt::Display,
{
    if !config.dedupe_methods.contains(req.method()) {
        return inner.call(req).await;
    }

    // A body beyond the snapshot cap is never buffered: skip coordination
    // rather than consume a stream we could not hand back intact.
    if content_length(req.headers()).is_some_and(|len| len > config.max_body_bytes as u64) {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            limit = config.max_body_bytes,
            "request body exceeds snapshot cap; skipping coalescing",
        );
        return inner.call(req).await;
    }

    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_err) => {
            // The stream broke (or undersold its length) mid-snapshot; the
            // original body cannot be reconstructed for the handler chain.
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_err, "failed to snapshot request body");
            return Ok(failure_response(
                StatusCode::BAD_REQUEST,
                "request body could not be read",
                false,
            ));
        }
    };

    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| parts.uri.path().to_owned());

    let fingerprint = match Fingerprint::derive(parts.method.as_str(), &target, &body_bytes) {
        Ok(fingerprint) => fingerprint,
        Err(_err) if config.fail_open_on_hash_error => {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %_err, "request not canonicalizable; skipping coalescing");
            let req = Request::from_parts(parts, Body::from(body_bytes));
            return inner.call(req).await;
        }
        Err(err) => {
            return Ok(failure_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                &err.to_string(),
                false,
            ));
        }
    };

    match registry.begin(fingerprint) {
        Entry::Leader(leader) => {
            let req = Request::from_parts(parts, Body::from(body_bytes));
            let response = match inner.call(req).await {
                Ok(response) => response,
                Err(err) => {
                    // Followers get an equivalent failure; the leader's own
                    // error path stays untouched.
                    leader.settle(Outcome::Failed(Error::HandlerFailed {
                        reason: err.to_string(),
                    }));
                    return Err(err);
                }
            };

            let (parts, body) = response.into_parts();
            match axum::body::to_bytes(body, usize::MAX).await {
                Ok(body_bytes) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        flight = %fingerprint,
                        status = parts.status.as_u16(),
                        followers = leader.followers(),
                        elapsed_ms = leader.age().as_millis() as u64,
                        "leader settled",
                    );
                    leader.settle(Outcome::Response(CapturedResponse {
                        status: parts.status,
                        headers: parts.headers.clone(),
                        body: body_bytes.clone(),
                    }));
                    Ok(Response::from_parts(parts, Body::from(body_bytes)))
                }
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(flight = %fingerprint, error = %_err, "response body could not be captured");
                    leader.settle(Outcome::Failed(Error::HandlerFailed {
                        reason: "response body could not be captured".to_string(),
                    }));
                    Ok(failure_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "response body could not be captured",
                        false,
                    ))
                }
            }
        }
        Entry::Follower(follower) => {
            let outcome = follower.outcome().await;
            Ok(replay(outcome))
        }
    }
}

/// Builds a follower's outbound response from a settled outcome.
fn replay(outcome: Outcome) -> Response {
    match outcome {
        Outcome::Response(captured) => {
            let mut response = Response::new(Body::from(captured.body));
            *response.status_mut() = captured.status;
            *response.headers_mut() = captured.headers;
            response
        }
        Outcome::Failed(err) => {
            let status = if err.is_retryable() {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            failure_response(status, &err.to_string(), err.is_retryable())
        }
    }
}

/// Failure envelope in the shape of the surrounding API's error responses.
fn failure_response(status: StatusCode, message: &str, retryable: bool) -> Response {
    let body = serde_json::json!({
        "success": false,
        "message": message,
        "retryable": retryable,
    });
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}
