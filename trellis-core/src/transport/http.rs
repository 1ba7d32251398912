//! The HTTP server.
//!
//! # How It Works
//!
//! One hyper 1.x accept loop serves every route:
//!
//! - `GET /` renders the full page and sets the session cookie.
//! - `GET /ws` upgrades to the primary WebSocket transport. Events read
//!   from the socket are handled serially, so one tab's callbacks never
//!   interleave.
//! - `GET /stream` opens the SSE fallback downstream.
//! - `POST /event` is the fallback upstream: it acknowledges immediately
//!   and dispatches the event in the background, with results delivered
//!   over the SSE channel.
//!
//! The accept loop races against the shutdown signal; when the registry
//! goes idle it stops accepting and `run` returns.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_tungstenite::tungstenite::Message;
use hyper_tungstenite::HyperWebsocket;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::session::{AppSource, Registry, RegistryConfig, Session};
use crate::shutdown::Shutdown;
use crate::Result;

use super::protocol::ClientEvent;
use super::{Transport, TransportKind};

const SID_COOKIE: &str = "trellis_sid";
const WS_KEEPALIVE: Duration = Duration::from_secs(30);

type AppBody = BoxBody<Bytes, Infallible>;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Page title, also used as the log target name.
    pub title: String,
    /// Expose error details to the client and log verbosely.
    pub debug: bool,
    /// Stop the server once the last browser disconnects.
    pub exit_on_idle: bool,
    /// Grace window before an idle interval counts, absorbing reloads.
    pub grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            title: "Trellis".to_string(),
            debug: false,
            exit_on_idle: false,
            grace: Duration::from_millis(500),
        }
    }
}

/// The app server: a registry plus the accept loop.
pub struct Server {
    registry: Arc<Registry>,
    config: ServerConfig,
    shutdown: Shutdown,
}

impl Server {
    pub fn new(source: AppSource, config: ServerConfig) -> Self {
        let shutdown = Shutdown::new();
        let registry = Registry::new(
            source,
            RegistryConfig {
                title: config.title.clone(),
                debug: config.debug,
                exit_on_idle: config.exit_on_idle,
                grace: config.grace,
            },
            shutdown.clone(),
        );
        Self {
            registry,
            config,
            shutdown,
        }
    }

    /// As [`Server::new`], with a hook run once per new session before its
    /// first render.
    pub fn with_session_hook<F>(source: AppSource, config: ServerConfig, hook: F) -> Self
    where
        F: Fn(&Arc<Session>) + Send + Sync + 'static,
    {
        let shutdown = Shutdown::new();
        let registry = Registry::with_hook(
            source,
            RegistryConfig {
                title: config.title.clone(),
                debug: config.debug,
                exit_on_idle: config.exit_on_idle,
                grace: config.grace,
            },
            shutdown.clone(),
            hook,
        );
        Self {
            registry,
            config,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Bind and serve until the shutdown signal fires.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("bad address: {e}"))
            })?;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "listening");

        loop {
            let (stream, peer) = tokio::select! {
                conn = listener.accept() => match conn {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                },
                _ = self.shutdown.wait() => {
                    info!("shutdown requested, stopping accept loop");
                    return Ok(());
                }
            };
            debug!(%peer, "connection accepted");

            let io = TokioIo::new(stream);
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                let service = service_fn(move |req| route(req, Arc::clone(&registry)));
                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!(error = %err, "connection closed");
                }
            });
        }
    }
}

async fn route(
    mut req: Request<Incoming>,
    registry: Arc<Registry>,
) -> std::result::Result<Response<AppBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "request");

    let response = match (method, path.as_str()) {
        (Method::GET, "/") => page(&req, &registry),
        (Method::GET, "/ws") => websocket(&mut req, &registry),
        (Method::GET, "/stream") => stream(&req, &registry),
        (Method::POST, "/event") => event(req, &registry).await,
        (Method::GET, "/favicon.ico") => plain(StatusCode::NO_CONTENT, ""),
        _ => plain(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

/// `GET /`: render the page, minting a session cookie on first visit.
fn page(req: &Request<Incoming>, registry: &Arc<Registry>) -> Response<AppBody> {
    let sid = cookie_sid(req).unwrap_or_else(|| Uuid::new_v4().to_string());
    let session = registry.get_or_create(&sid);

    match session.render_page() {
        Ok(html) => {
            let mut response = html_response(StatusCode::OK, html);
            if let Ok(cookie) =
                header::HeaderValue::from_str(&format!("{SID_COOKIE}={sid}; Path=/"))
            {
                response.headers_mut().insert(header::SET_COOKIE, cookie);
            }
            response
        }
        Err(err) => {
            error!(sid = %session.sid(), error = %err, "initial render failed");
            let body = if session.debug() {
                format!("Initial Render Error\n{err}")
            } else {
                "Initial Render Error".to_string()
            };
            plain(StatusCode::INTERNAL_SERVER_ERROR, &body)
        }
    }
}

/// `GET /ws`: upgrade to the primary transport.
fn websocket(req: &mut Request<Incoming>, registry: &Arc<Registry>) -> Response<AppBody> {
    let Some(sid) = cookie_sid(req) else {
        return plain(StatusCode::BAD_REQUEST, "No session cookie");
    };
    if !hyper_tungstenite::is_upgrade_request(req) {
        return plain(StatusCode::BAD_REQUEST, "Expected WebSocket upgrade");
    }
    let (response, websocket) = match hyper_tungstenite::upgrade(req, None) {
        Ok(upgraded) => upgraded,
        Err(err) => {
            warn!(error = %err, "websocket upgrade failed");
            return plain(StatusCode::BAD_REQUEST, "WebSocket upgrade failed");
        }
    };

    let session = registry.get_or_create(&sid);
    tokio::spawn(serve_websocket(websocket, session));

    let (parts, _body) = response.into_parts();
    Response::from_parts(parts, empty_body())
}

async fn serve_websocket(websocket: HyperWebsocket, session: Arc<Session>) {
    let ws = match websocket.await {
        Ok(ws) => ws,
        Err(err) => {
            warn!(error = %err, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();
    let (transport, mut rx) = Transport::channel(TransportKind::Primary);
    let transport_id = transport.id();
    session.connect(transport);

    let writer = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(WS_KEEPALIVE);
        keepalive.tick().await; // discard the immediate first tick
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = keepalive.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Events are dispatched serially per socket.
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match ClientEvent::parse(&text) {
                Ok(event) => session.handle_event(event, Some(transport_id)).await,
                Err(err) => warn!(sid = %session.sid(), error = %err, "bad event frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(sid = %session.sid(), error = %err, "websocket read failed");
                break;
            }
        }
    }

    session.detach(transport_id);
    writer.abort();
}

/// `GET /stream`: the SSE fallback downstream.
fn stream(req: &Request<Incoming>, registry: &Arc<Registry>) -> Response<AppBody> {
    let Some(sid) = cookie_sid(req) else {
        return plain(StatusCode::BAD_REQUEST, "No session cookie");
    };
    let session = registry.get_or_create(&sid);

    let (transport, rx) = Transport::channel(TransportKind::Fallback);
    let transport_id = transport.id();
    let watcher = transport.clone();
    session.connect(transport);

    // Detach promptly when the client drops the stream.
    let owner = Arc::clone(&session);
    tokio::spawn(async move {
        watcher.closed().await;
        owner.detach(transport_id);
    });

    let frames = UnboundedReceiverStream::new(rx)
        .map(|payload| Ok::<_, Infallible>(Frame::data(Bytes::from(format!("data: {payload}\n\n")))));
    let body = BoxBody::new(StreamBody::new(frames));

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    response
}

/// `POST /event`: the fallback upstream. Acknowledge, then dispatch.
async fn event(req: Request<Incoming>, registry: &Arc<Registry>) -> Response<AppBody> {
    let Some(sid) = cookie_sid(&req) else {
        return plain(StatusCode::BAD_REQUEST, "No session cookie");
    };
    let Some(session) = registry.get(&sid) else {
        return plain(StatusCode::BAD_REQUEST, "Unknown session");
    };

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(error = %err, "event body read failed");
            return plain(StatusCode::BAD_REQUEST, "Bad body");
        }
    };
    let event = match serde_json::from_slice::<ClientEvent>(&body) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "bad event payload");
            return plain(StatusCode::BAD_REQUEST, "Bad event");
        }
    };

    tokio::spawn(async move {
        session.handle_event(event, None).await;
    });

    let mut response = full_response(r#"{"status":"ok"}"#);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

fn cookie_sid<B>(req: &Request<B>) -> Option<String> {
    let cookies = req.headers().get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SID_COOKIE).then(|| value.to_string())
    })
}

fn empty_body() -> AppBody {
    BoxBody::new(Full::new(Bytes::new()))
}

fn full_response(body: impl Into<Bytes>) -> Response<AppBody> {
    Response::new(BoxBody::new(Full::new(body.into())))
}

fn plain(status: StatusCode, body: &str) -> Response<AppBody> {
    let mut response = full_response(body.as_bytes().to_vec());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn html_response(status: StatusCode, body: String) -> Response<AppBody> {
    let mut response = full_response(body.into_bytes());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}
