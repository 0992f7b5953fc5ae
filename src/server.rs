use crate::error::{json_error_response, GateErrorCode};
use crate::gate::{Gate, Verdict};
use crate::pages::{Pages, ASSET_PREFIX};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, RETRY_AFTER};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const MISSING_NAME_BODY: &str = "name parameter not provided.";

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// HTTP front of the admission gate
pub struct GateServer {
    bind_addr: SocketAddr,
    gate: Arc<Gate>,
    pages: Arc<Pages>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GateServer {
    pub fn new(
        bind_addr: SocketAddr,
        gate: Arc<Gate>,
        pages: Pages,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            gate,
            pages: Arc::new(pages),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Gate listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gate = Arc::clone(&self.gate);
                            let pages = Arc::clone(&self.pages);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, gate, pages).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gate server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    gate: Arc<Gate>,
    pages: Arc<Pages>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let gate = Arc::clone(&gate);
        let pages = Arc::clone(&pages);
        async move { handle_request(req, addr, gate, pages).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Route one request. Request bodies are never read.
pub async fn handle_request<B>(
    req: Request<B>,
    addr: SocketAddr,
    gate: Arc<Gate>,
    pages: Arc<Pages>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let request_id = Uuid::new_v4();
    let path = req.uri().path();
    let method = req.method();

    debug!(%request_id, %addr, %method, %path, "Request");

    let mut response = match (method, path) {
        (&Method::GET, "/thaw") => thaw(req.uri().query(), &gate, &pages).await,

        (&Method::GET, "/reload") | (&Method::POST, "/reload") => reload(&gate).await,

        (&Method::GET, "/status") => match serde_json::to_string(&gate.status()) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => json_error_response(GateErrorCode::InternalError, e.to_string()),
        },

        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, path) if path.starts_with(ASSET_PREFIX) => {
            match pages.asset(&path[ASSET_PREFIX.len()..]).await {
                Some((body, content_type)) => Response::builder()
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, content_type)
                    .body(Full::new(body))
                    .expect("valid response with static content type"),
                None => json_error_response(GateErrorCode::NotFound, format!("no asset at {}", path)),
            }
        }

        _ => json_error_response(GateErrorCode::NotFound, format!("no route for {} {}", method, path)),
    };

    if let Ok(value) = request_id.to_string().parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    Ok(response)
}

async fn thaw(query: Option<&str>, gate: &Arc<Gate>, pages: &Pages) -> Response<Full<Bytes>> {
    let names = query_values(query.unwrap_or(""), "name");
    if names.is_empty() {
        let code = GateErrorCode::MissingName;
        return Response::builder()
            .status(code.status_code())
            .header("X-Gate-Error", code.as_header_value())
            .body(Full::new(Bytes::from_static(MISSING_NAME_BODY.as_bytes())))
            .expect("valid response with static headers");
    }

    let decision = gate.evaluate(&names).await;
    match decision.verdict {
        Verdict::Admit => response(StatusCode::OK, Bytes::new()),
        Verdict::Blocked => interstitial(pages, None).await,
        Verdict::NoSuchName => {
            warn!(names = ?names, "Thaw requested for unmanaged names");
            interstitial(pages, Some(GateErrorCode::NoSuchName)).await
        }
        Verdict::InvalidConfig => interstitial(pages, Some(GateErrorCode::InvalidConfig)).await,
    }
}

/// 418 with the waiting page; the client polls until it gets a 200
async fn interstitial(pages: &Pages, code: Option<GateErrorCode>) -> Response<Full<Bytes>> {
    let body = pages.interstitial().await;
    let mut builder = Response::builder()
        .status(StatusCode::IM_A_TEAPOT)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .header(RETRY_AFTER, "1");
    if let Some(code) = code {
        builder = builder.header("X-Gate-Error", code.as_header_value());
    }
    builder
        .body(Full::new(body))
        .expect("valid response with static headers")
}

async fn reload(gate: &Gate) -> Response<Full<Bytes>> {
    match gate.reload().await {
        Ok(report) => {
            let mut body = String::from("Configuration reloaded.");
            for skipped in &report.rejected {
                body.push_str(&format!("\nskipped {}: {}", skipped.name, skipped.reason));
            }
            response(StatusCode::OK, body)
        }
        Err(e) => json_error_response(GateErrorCode::ReloadFailed, e.to_string()),
    }
}

/// All non-empty, percent-decoded values of `key` in a query string
pub fn query_values(query: &str, key: &str) -> Vec<String> {
    let decode = |raw: &str| {
        let spaced = raw.replace('+', " ");
        urlencoding::decode(&spaced).map(|s| s.into_owned()).ok()
    };

    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            if decode(k)?.as_str() != key {
                return None;
            }
            match decode(v) {
                Some(value) => Some(value),
                None => {
                    warn!(value = v, "Ignoring query value that is not valid UTF-8");
                    None
                }
            }
        })
        .filter(|value| !value.is_empty())
        .collect()
}
