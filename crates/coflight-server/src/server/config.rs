use anyhow::Context;
use clap::{ArgAction, Parser};
use coflight_axum::CoalesceConfig;
use core::time::Duration;
use http::Method;

/// Command-line and environment configuration for the demo server.
#[derive(Debug, Parser)]
#[command(name = "coflight-server", about = "Request-coalescing demo server")]
pub struct CliArgs {
    /// Address to listen on.
    #[arg(long, env = "COFLIGHT_LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    pub listen_addr: String,

    /// Deadline in milliseconds for a leader to settle before followers
    /// are released with a retryable failure.
    #[arg(long, env = "COFLIGHT_TTL_MS", default_value_t = 30_000)]
    pub ttl_ms: u64,

    /// Comma-separated HTTP methods eligible for coalescing.
    #[arg(
        long,
        env = "COFLIGHT_DEDUPE_METHODS",
        default_value = "GET,HEAD",
        value_delimiter = ','
    )]
    pub dedupe_methods: Vec<String>,

    /// Skip coalescing (instead of rejecting) when a body cannot be hashed.
    #[arg(
        long,
        env = "COFLIGHT_FAIL_OPEN",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub fail_open_on_hash_error: bool,

    /// Largest request body, in bytes, buffered for hashing.
    #[arg(long, env = "COFLIGHT_MAX_BODY_BYTES", default_value_t = 1024 * 1024)]
    pub max_body_bytes: usize,
}

/// Validated server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub coalesce: CoalesceConfig,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let mut methods = Vec::with_capacity(args.dedupe_methods.len());
        for name in &args.dedupe_methods {
            let method = Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes())
                .with_context(|| format!("invalid HTTP method in --dedupe-methods: {name:?}"))?;
            methods.push(method);
        }

        let coalesce = CoalesceConfig::new()
            .dedupe_methods(methods)
            .ttl(Duration::from_millis(args.ttl_ms))
            .fail_open_on_hash_error(args.fail_open_on_hash_error)
            .max_body_bytes(args.max_body_bytes);

        Ok(Self {
            listen_addr: args.listen_addr,
            coalesce,
        })
    }
}
