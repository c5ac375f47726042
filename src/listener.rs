//! HTTP session transport
//!
//! Every HTTP request is one session: the `Host` header (or the request
//! authority, as HTTP/2 sends it) is the requested address, a redirect is a `307` pointing at the backend, and a rejection is
//! a JSON error body.

use crate::error::{json_error_response, RejectReason, SessionError};
use crate::router::Router;
use crate::session::Session;
use async_trait::async_trait;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Maximum hostname length in DNS
const MAX_HOSTNAME_LEN: usize = 253;

type HttpResponse = Response<BoxBody<Bytes, hyper::Error>>;

pub struct Listener {
    bind_addr: SocketAddr,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Listener {
    pub fn new(bind_addr: SocketAddr, router: Arc<Router>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            router,
            shutdown_rx,
        }
    }

    /// Accept connections until shutdown is signalled.
    ///
    /// Sessions already being routed keep running on their own tasks.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Listening for client sessions");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, router: Arc<Router>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { handle_request(req, router, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    router: Arc<Router>,
    client_addr: SocketAddr,
) -> Result<HttpResponse, hyper::Error> {
    let mut session = HttpSession::from_request(&req);
    let outcome = router.route(&mut session).await;
    debug!(
        request_id = %session.request_id(),
        client = %client_addr,
        ?outcome,
        "Session routed"
    );
    Ok(session.into_response())
}

/// Validate a `Host` header value: hostname of at most 253 characters from
/// `[A-Za-z0-9.-]`, optionally followed by a numeric port
fn valid_host(value: &str) -> bool {
    let (hostname, port) = match value.split_once(':') {
        Some((hostname, port)) => (hostname, Some(port)),
        None => (value, None),
    };

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return false;
    }
    port.map_or(true, |p| !p.is_empty() && p.parse::<u16>().is_ok())
}

/// One HTTP request seen as a broker session
pub struct HttpSession {
    host: Option<String>,
    path: String,
    request_id: String,
    response: Option<HttpResponse>,
}

impl HttpSession {
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.trim().to_string())
            .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()));

        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Self {
            host,
            path,
            request_id,
            response: None,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The response to send; a session the router never answered is a failed handshake
    pub fn into_response(self) -> HttpResponse {
        let mut response = self
            .response
            .unwrap_or_else(|| json_error_response(RejectReason::HandshakeFailed));
        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
        response
    }

    fn answer(&mut self, response: HttpResponse) -> Result<(), SessionError> {
        if self.response.is_some() {
            return Err(SessionError::AlreadyAnswered);
        }
        self.response = Some(response);
        Ok(())
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn complete_handshake(&mut self) -> Result<(), SessionError> {
        match self.host.as_deref() {
            None => Err(SessionError::Handshake("missing Host header".to_string())),
            Some(host) if !valid_host(host) => {
                Err(SessionError::Handshake("invalid Host header".to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    fn requested_address(&self) -> &str {
        self.host.as_deref().unwrap_or("")
    }

    async fn send_redirect(&mut self, host: &str, port: u16) -> Result<(), SessionError> {
        let location = format!("http://{}:{}{}", host, port, self.path);
        let body = serde_json::json!({ "host": host, "port": port }).to_string();

        let response = Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(hyper::header::LOCATION, location)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .header("X-Redirect-Host", host)
            .header("X-Redirect-Port", port.to_string())
            .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
            .map_err(|e| SessionError::Handshake(format!("cannot build redirect: {}", e)))?;

        self.answer(response)
    }

    async fn reject(&mut self, reason: RejectReason) -> Result<(), SessionError> {
        self.answer(json_error_response(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(host: Option<&str>, path: &str) -> Request<()> {
        let mut builder = Request::builder().uri(path);
        if let Some(host) = host {
            builder = builder.header(hyper::header::HOST, host);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_valid_host() {
        assert!(valid_host("42.df-mc.dev"));
        assert!(valid_host("42.df-mc.dev:19132"));
        assert!(valid_host("127.0.0.1"));
        assert!(!valid_host(""));
        assert!(!valid_host("42.df-mc.dev:"));
        assert!(!valid_host("42.df-mc.dev:port"));
        assert!(!valid_host("evil host"));
        assert!(!valid_host("a\r\nx"));
        assert!(!valid_host(&"a".repeat(254)));
        assert!(valid_host(&"a".repeat(253)));
    }

    #[tokio::test]
    async fn test_handshake_requires_host() {
        let mut session = HttpSession::from_request(&request(None, "/"));
        assert!(matches!(
            session.complete_handshake().await,
            Err(SessionError::Handshake(_))
        ));
        assert_eq!(session.requested_address(), "");

        let mut session = HttpSession::from_request(&request(Some("42.df-mc.dev:19132"), "/"));
        session.complete_handshake().await.unwrap();
        assert_eq!(session.requested_address(), "42.df-mc.dev:19132");
    }

    #[tokio::test]
    async fn test_authority_is_used_without_host_header() {
        let req = Request::builder()
            .uri("http://42.df-mc.dev:19132/play")
            .version(hyper::Version::HTTP_2)
            .body(())
            .unwrap();
        let mut session = HttpSession::from_request(&req);

        session.complete_handshake().await.unwrap();
        assert_eq!(session.requested_address(), "42.df-mc.dev:19132");

        session.send_redirect("df-mc.dev", 40001).await.unwrap();
        assert_eq!(
            session.into_response().headers().get("location").unwrap(),
            "http://df-mc.dev:40001/play"
        );
    }

    #[tokio::test]
    async fn test_redirect_response() {
        let mut session = HttpSession::from_request(&request(Some("42.df-mc.dev"), "/play?x=1"));
        session.send_redirect("df-mc.dev", 40001).await.unwrap();

        let response = session.into_response();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "http://df-mc.dev:40001/play?x=1"
        );
        assert_eq!(response.headers().get("x-redirect-port").unwrap(), "40001");
        assert!(response.headers().contains_key(X_REQUEST_ID));
    }

    #[tokio::test]
    async fn test_session_answers_once() {
        let mut session = HttpSession::from_request(&request(Some("42.df-mc.dev"), "/"));
        session.reject(RejectReason::UnknownIdentifier).await.unwrap();
        assert!(matches!(
            session.send_redirect("df-mc.dev", 1).await,
            Err(SessionError::AlreadyAnswered)
        ));

        let response = session.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("X-Broker-Error").unwrap(),
            "UNKNOWN_IDENTIFIER"
        );
    }

    #[test]
    fn test_request_id_is_propagated() {
        let req = Request::builder()
            .uri("/")
            .header(hyper::header::HOST, "df-mc.dev")
            .header(X_REQUEST_ID, "abc-123")
            .body(())
            .unwrap();
        let session = HttpSession::from_request(&req);
        assert_eq!(session.request_id(), "abc-123");
        assert_eq!(
            session.into_response().headers().get(X_REQUEST_ID).unwrap(),
            "abc-123"
        );
    }
}
