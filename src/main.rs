use std::net::SocketAddr;
use std::path::PathBuf;

use axum::extract::{ConnectInfo, State};
use axum::Router;
use clap::Parser;
use http::{Request, Response, StatusCode};
use tokio::signal;
use tower::Service;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use trafficgate::config::{GatewayConfig, LoggingConfig};
use trafficgate::http::{full_body, json_error, Body, BoxError, ClientAddr, HttpService};
use trafficgate::{GatewayError, TrafficControl};

/// Largest request body the demo upstream will buffer.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "trafficgate",
    version,
    about = "Rate limiting and circuit breaking in front of an echo upstream"
)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override server.listen_addr
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = GatewayConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if cli.log_json {
        config.logging.json = true;
    }

    init_tracing(&config.logging);

    info!("Starting trafficgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let traffic = TrafficControl::from_config(&config)?;
    if config.rate_limit.is_none() && config.circuit_breaker.is_none() {
        warn!("No rate_limit or circuit_breaker configured; requests pass straight through");
    }

    let app = Router::new().fallback(dispatch).with_state(traffic);

    let addr = config.server.listen_addr;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(listen_addr = %addr, "HTTP server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| GatewayError::Serve(e.to_string()))?;

    info!("trafficgate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Passes every inbound request through the traffic-control layers to the
/// echo upstream.
async fn dispatch(
    State(traffic): State<TrafficControl>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return json_error(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    };

    let mut req = Request::from_parts(parts, full_body(bytes));
    req.extensions_mut().insert(ClientAddr(remote));

    match forward(&traffic, req).await {
        Ok(resp) => resp,
        Err(e) => {
            error!(error = %e, "Upstream failed");
            json_error(StatusCode::BAD_GATEWAY, "upstream error")
        }
    }
}

/// Calls the guarded upstream through the boxed `Send` future returned by
/// `call`, so the handler future stays `Send`.
async fn forward(
    traffic: &TrafficControl,
    req: Request<Body>,
) -> Result<Response<Body>, BoxError> {
    let mut svc = traffic.wrap(echo_upstream());
    std::future::poll_fn(|cx| svc.poll_ready(cx)).await?;
    svc.call(req).await
}

/// Answers `/status/N` with status `N`, anything else with `200` and a JSON
/// description of the request.
fn echo_upstream() -> HttpService {
    HttpService::new(tower::service_fn(|req: Request<Body>| async move {
        Ok::<_, BoxError>(echo(&req))
    }))
}

fn echo(req: &Request<Body>) -> Response<Body> {
    let status = requested_status(req.uri().path()).unwrap_or(StatusCode::OK);
    let body = serde_json::json!({
        "method": req.method().as_str(),
        "path": req.uri().path(),
        "status": status.as_u16(),
    });

    let mut resp = Response::new(full_body(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    resp
}

fn requested_status(path: &str) -> Option<StatusCode> {
    let code = path.strip_prefix("/status/")?.parse::<u16>().ok()?;
    StatusCode::from_u16(code).ok()
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
