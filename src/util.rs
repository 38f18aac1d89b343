use std::sync::Arc;

use actix_web::HttpResponse;
use http::StatusCode;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::RelayConfig;
use crate::session::ChatRelay;

/// Initialize dotenv and structured tracing based on RUST_LOG.
/// - Supports explicit env file paths via ENV_FILE, DOTENV_PATH
/// - Falls back to .envfile, then default .env discovery
/// - Logs the source used
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }

    if env_source == "none"
        && std::path::Path::new(".envfile").is_file()
        && dotenvy::from_filename(".envfile").is_ok()
    {
        env_source = ".envfile".into();
    }

    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,actix_web=info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Get the bind address for the HTTP server from env or default to 0.0.0.0:8090.
pub fn env_bind_addr() -> String {
    std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8090".into())
}

/// Build an HTTP client honoring proxy and timeout environment variables.
///
/// Environment:
/// - CHATRELAY_NO_PROXY = 1|true|yes|on  -> disable all proxies
/// - CHATRELAY_PROXY_URL = <url>         -> proxy for all schemes
/// - CHATRELAY_HTTP_TIMEOUT_SECONDS      -> overall request timeout (u64)
/// - CHATRELAY_CONNECT_TIMEOUT_SECONDS   -> connect timeout (u64, default 15)
///
/// The overall timeout also bounds streamed sends, so leave it unset unless
/// responses are known to be short.
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    if let Ok(secs) = std::env::var("CHATRELAY_HTTP_TIMEOUT_SECONDS") {
        if let Ok(n) = secs.trim().parse::<u64>() {
            builder = builder.timeout(std::time::Duration::from_secs(n));
        }
    }
    let connect_secs = std::env::var("CHATRELAY_CONNECT_TIMEOUT_SECONDS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(15);
    builder = builder.connect_timeout(std::time::Duration::from_secs(connect_secs));

    if env_flag("CHATRELAY_NO_PROXY") {
        builder = builder.no_proxy();
    } else if let Ok(url) = std::env::var("CHATRELAY_PROXY_URL") {
        let u = url.trim();
        if !u.is_empty() {
            match reqwest::Proxy::all(u) {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => tracing::warn!("Ignoring invalid CHATRELAY_PROXY_URL: {}", e),
            }
        }
    }

    builder = builder.user_agent(format!("chatrelay/{}", env!("CARGO_PKG_VERSION")));

    builder.build().unwrap_or_else(|e| {
        tracing::warn!("Falling back to default HTTP client: {}", e);
        reqwest::Client::new()
    })
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v.trim().to_ascii_lowercase())
        .map(|v| v == "1" || v == "true" || v == "yes" || v == "on")
        .unwrap_or(false)
}

/// Shared application state used by the HTTP server and handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<ChatRelay>,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(relay: Arc<ChatRelay>, config: RelayConfig) -> Self {
        Self {
            relay,
            config: Arc::new(config),
        }
    }

    /// State wired to the HTTP provider described by `config`.
    pub fn from_config(config: RelayConfig) -> Self {
        let http = build_http_client_from_env();
        let relay = ChatRelay::over_http(http, &config);
        Self::new(Arc::new(relay), config)
    }
}

/// Build a JSON error response with the given HTTP status and message.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg } });
    let status = actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(body)
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Option<String> {
    let (scheme, token) = header?.trim().split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Split a comma-joined credential list into its independent credentials.
pub fn split_credentials(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pick one credential for this request.
pub fn select_credential(raw: &str) -> Option<String> {
    split_credentials(raw)
        .choose(&mut rand::thread_rng())
        .cloned()
}

/// Short stable identifier for a credential, safe to log.
pub fn credential_fingerprint(credential: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    format!("rk_{}", &hex::encode(digest)[..12])
}

pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
