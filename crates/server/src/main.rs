use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::http::{header, HeaderValue, Method};
use clap::Parser;
use sha2::{Digest, Sha256};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use acf_domain::config::{Config, ConfigSeverity, CorsConfig};
use acf_fabric::{ConversationFabric, JsonlAuditSink};
use acf_server::api;
use acf_server::api::inbound::DedupeStore;
use acf_server::brain::EchoBrain;
use acf_server::cli::{self, Cli, Command, ConfigCommand};
use acf_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _config_path) = cli::load_config(cli.config.as_ref())?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cli::load_config(cli.config.as_ref())?;
            if !cli::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = cli::load_config(cli.config.as_ref())?;
            cli::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("acfd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON logging for the `serve` command.  `ACF_LOG` takes
/// precedence, then `RUST_LOG`; the fallback keeps fabric internals at
/// debug so turn lifecycles are traceable out of the box.
fn init_tracing() {
    let directives = std::env::var("ACF_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info,acf_fabric=debug".into());

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(directives))
        .init();
}

/// Start the fabric server with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("acfd starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Audit sink ───────────────────────────────────────────────────
    let audit = Arc::new(
        JsonlAuditSink::new(&config.server.state_path).context("initializing audit sink")?,
    );
    tracing::info!(
        path = %config.server.state_path.display(),
        records = audit.len(),
        "audit sink ready"
    );

    // ── Conversation fabric ──────────────────────────────────────────
    let fabric = Arc::new(ConversationFabric::new(
        &config,
        Arc::new(EchoBrain),
        audit,
    ));
    tracing::info!("conversation fabric ready");

    // ── Replay guard (inbound idempotency, 24h window) ──────────────
    let dedupe = Arc::new(DedupeStore::new(std::time::Duration::from_secs(86_400)));

    // ── API token (hashed once; the raw token is dropped here) ──────
    let api_token_digest = load_api_token_digest(&config.server.api_token_env);

    let state = AppState {
        config: config.clone(),
        fabric,
        dedupe,
        api_token_digest,
        started_at: Instant::now(),
    };

    // ── CORS layer (config-aware) ────────────────────────────────────
    let cors_layer = build_cors_layer(&config.server.cors);

    // ── Concurrency limit (backpressure protection) ─────────────────
    let max_concurrent = std::env::var("ACF_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);
    tracing::info!(max_concurrent, "concurrency limit set");

    // ── Rate-limit layer (per-IP token bucket via governor) ─────────
    let governor_layer = config.server.rate_limit.as_ref().map(|rl| {
        use tower_governor::governor::GovernorConfigBuilder;
        use tower_governor::GovernorLayer;

        let gov_config = GovernorConfigBuilder::default()
            .per_second(rl.requests_per_second)
            .burst_size(rl.burst_size)
            .finish()
            .expect("rate_limit: requests_per_second and burst_size must be > 0");

        tracing::info!(
            requests_per_second = rl.requests_per_second,
            burst_size = rl.burst_size,
            "per-IP rate limiting enabled"
        );

        GovernorLayer {
            config: std::sync::Arc::new(gov_config),
        }
    });
    if governor_layer.is_none() {
        tracing::info!("per-IP rate limiting disabled (no [server.rate_limit] in config)");
    }

    // ── Router ───────────────────────────────────────────────────────
    let router = api::router(state.clone())
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent));
    let app = if let Some(gov) = governor_layer {
        router.layer(gov).with_state(state)
    } else {
        router.with_state(state)
    };

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "acfd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    tracing::info!("acfd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}

/// Read the bearer token from `env_var` and reduce it to its SHA-256
/// digest.  Returns `None` (auth disabled) when the variable is unset
/// or empty.
fn load_api_token_digest(env_var: &str) -> Option<[u8; 32]> {
    match std::env::var(env_var) {
        Ok(token) if !token.is_empty() => {
            tracing::info!(env_var, "API bearer-token auth enabled");
            Some(Sha256::digest(token.as_bytes()).into())
        }
        _ => {
            tracing::warn!(
                env_var,
                "API bearer-token auth DISABLED — set {env_var} to enable"
            );
            None
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CORS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One allowed-origin rule parsed from `server.cors.allowed_origins`.
enum OriginRule {
    /// `*` — every origin.
    Any,
    /// A literal origin.
    Exact(HeaderValue),
    /// `scheme://host:*` — the host on any numeric port.
    AnyPort(String),
}

impl OriginRule {
    fn parse(raw: &str) -> Option<Self> {
        if raw == "*" {
            return Some(Self::Any);
        }
        if let Some(host) = raw.strip_suffix(":*") {
            return Some(Self::AnyPort(format!("{host}:")));
        }
        raw.parse().ok().map(Self::Exact)
    }

    fn permits(&self, origin: &HeaderValue) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(allowed) => allowed == origin,
            Self::AnyPort(prefix) => origin
                .to_str()
                .ok()
                .and_then(|o| o.strip_prefix(prefix.as_str()))
                // The remainder must be a bare port number.
                .is_some_and(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())),
        }
    }
}

/// Build the [`CorsLayer`] from the configured origin rules.
fn build_cors_layer(cors: &CorsConfig) -> CorsLayer {
    let rules: Vec<OriginRule> = cors
        .allowed_origins
        .iter()
        .filter_map(|raw| match OriginRule::parse(raw) {
            Some(rule) => Some(rule),
            None => {
                tracing::warn!(origin = %raw, "unparseable CORS origin, skipping");
                None
            }
        })
        .collect();

    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    if rules.iter().any(|rule| matches!(rule, OriginRule::Any)) {
        tracing::warn!("CORS open to all origins");
        return base.allow_origin(tower_http::cors::Any);
    }

    base.allow_origin(AllowOrigin::predicate(move |origin, _| {
        rules.iter().any(|rule| rule.permits(origin))
    }))
}
