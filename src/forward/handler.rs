//! Actix Web handler forwarding unmatched requests to the dev server.

use crate::error::{Error, Result};
use crate::forward::{ForwardedDevServer, RouteRegistrar};

use actix_web::{
    HttpRequest, HttpResponse,
    http::StatusCode,
    web::{Bytes, Data, Payload},
};
use async_trait::async_trait;
use futures_lite::StreamExt;
use std::sync::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Headers that only make sense for a single connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest upgrade response head accepted from the dev server
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn is_websocket_upgrade(req: &HttpRequest) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// `X-Forwarded-*` headers describing the original request
fn forwarded_headers(req: &HttpRequest) -> Vec<(&'static str, String)> {
    let connection = req.connection_info().clone();
    let mut headers = vec![
        ("x-forwarded-host", connection.host().to_string()),
        ("x-forwarded-proto", connection.scheme().to_string()),
    ];
    if let Some(remote) = connection.realip_remote_addr() {
        headers.push(("x-forwarded-for", remote.to_string()));
    }
    headers
}

/// Forwarding state shared with [`forward_request`] through `web::Data`.
///
/// The target is installed through [`RouteRegistrar`]; until then every
/// request is answered with 503.
pub struct DevServerProxy {
    /// Current target
    target: RwLock<Option<ForwardedDevServer>>,
    /// Client for upstream requests
    client: reqwest::Client,
}

impl DevServerProxy {
    /// Create a proxy with no target
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| Error::Other(format!("Failed to build forwarding client: {}", e)))?;

        Ok(Self {
            target: RwLock::new(None),
            client,
        })
    }

    /// Current target
    pub fn target(&self) -> Option<ForwardedDevServer> {
        self.target.read().ok().and_then(|target| target.clone())
    }

    fn set_target(&self, target: Option<ForwardedDevServer>) -> Result<()> {
        let mut current = self
            .target
            .write()
            .map_err(|_| Error::Other("Failed to lock forwarding target".to_string()))?;
        *current = target;
        Ok(())
    }
}

#[async_trait]
impl RouteRegistrar for DevServerProxy {
    async fn install(&self, target: &ForwardedDevServer) -> Result<()> {
        tracing::debug!(endpoint = %target.endpoint, websocket = target.websocket, "Installing dev server forwarding");
        self.set_target(Some(target.clone()))
    }

    async fn uninstall(&self) -> Result<()> {
        tracing::debug!("Removing dev server forwarding");
        self.set_target(None)
    }
}

/// Default service forwarding a request to the dev server.
///
/// Hop-by-hop headers are dropped in both directions and `X-Forwarded-*`
/// headers are added upstream. The response body is streamed back as it
/// arrives. WebSocket upgrades are tunnelled to the dev server when the
/// target allows them and answered with 501 otherwise.
pub async fn forward_request(
    req: HttpRequest,
    payload: Payload,
    proxy: Data<DevServerProxy>,
) -> Result<HttpResponse> {
    let target = proxy.target().ok_or(Error::NotRunning)?;

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    if is_websocket_upgrade(&req) {
        if !target.websocket {
            tracing::debug!(%path, "Refusing WebSocket upgrade, forwarding is disabled");
            return Err(Error::Unsupported(format!(
                "WebSocket forwarding to the dev server is disabled ({})",
                path
            )));
        }
        return tunnel_upgrade(&req, payload, &target, &path).await;
    }

    let body = payload
        .to_bytes()
        .await
        .map_err(|e| Error::Forward(format!("Failed to read request body: {}", e)))?;
    let url = target.endpoint.url(&path);

    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|e| Error::Forward(format!("Unsupported method {}: {}", req.method(), e)))?;

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in req.headers() {
        if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("host") {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) else {
            continue;
        };
        headers.append(name, value);
    }
    for (name, value) in forwarded_headers(&req) {
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }

    tracing::trace!(method = %method, %url, "Forwarding request to dev server");

    let mut upstream = proxy
        .client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            tracing::warn!(%url, error = %e, "Dev server did not answer forwarded request");
            Error::Forward(format!("{}: {}", url, e))
        })?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .map_err(|e| Error::Forward(format!("Invalid status from dev server: {}", e)))?;

    let mut response = HttpResponse::build(status);
    for (name, value) in upstream.headers() {
        // actix sets its own framing for the streamed body
        if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("content-length") {
            continue;
        }
        response.append_header((name.as_str(), value.as_bytes()));
    }

    let stream = async_stream::stream! {
        loop {
            match upstream.chunk().await {
                Ok(Some(chunk)) => yield Ok::<_, actix_web::Error>(chunk),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Dev server response body interrupted");
                    yield Err(actix_web::error::ErrorBadGateway(e));
                    break;
                }
            }
        }
    };

    Ok(response.streaming(stream))
}

/// Relay a WebSocket handshake to the dev server and, once it switches
/// protocols, copy raw bytes both ways until either side closes.
async fn tunnel_upgrade(
    req: &HttpRequest,
    payload: Payload,
    target: &ForwardedDevServer,
    path: &str,
) -> Result<HttpResponse> {
    let address = &target.endpoint;
    let mut upstream = TcpStream::connect((address.host.as_str(), address.port))
        .await
        .map_err(|e| {
            tracing::warn!(%address, error = %e, "Dev server refused WebSocket connection");
            Error::Forward(format!("{}: {}", address, e))
        })?;

    let mut head = format!("{} {} HTTP/1.1\r\nhost: {}\r\n", req.method(), path, address);
    for (name, value) in req.headers() {
        if name.as_str().eq_ignore_ascii_case("host") {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    for (name, value) in forwarded_headers(req) {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");

    tracing::trace!(%path, %address, "Forwarding WebSocket upgrade to dev server");
    upstream
        .write_all(head.as_bytes())
        .await
        .map_err(|e| Error::Forward(format!("Failed to send upgrade to {}: {}", address, e)))?;

    let (status, headers, leftover) = read_response_head(&mut upstream).await?;
    if status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::Forward(format!(
            "Dev server answered WebSocket upgrade of {} with {}",
            path, status
        )));
    }

    let mut response = HttpResponse::SwitchingProtocols();
    response.upgrade("websocket");
    for (name, value) in &headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        response.append_header((name.as_str(), value.as_str()));
    }

    let (mut reader, mut writer) = upstream.into_split();

    // The payload of an upgraded request carries the raw client bytes
    actix_web::rt::spawn(async move {
        let mut payload = payload;
        while let Some(chunk) = payload.next().await {
            match chunk {
                Ok(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "WebSocket client stream ended");
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    });

    let stream = async_stream::stream! {
        if !leftover.is_empty() {
            yield Ok::<_, actix_web::Error>(Bytes::from(leftover));
        }
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => yield Ok(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    tracing::debug!(error = %e, "WebSocket dev server stream ended");
                    break;
                }
            }
        }
    };

    Ok(response.streaming(stream))
}

/// Read an HTTP/1.1 response head. Bytes past the head are returned as the
/// leftover so nothing the dev server sent early is lost.
async fn read_response_head(
    upstream: &mut TcpStream,
) -> Result<(StatusCode, Vec<(String, String)>, Vec<u8>)> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let end = loop {
        if let Some(position) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break position;
        }
        if buffer.len() > MAX_UPGRADE_HEAD {
            return Err(Error::Forward("Upgrade response head too large".to_string()));
        }
        let n = upstream
            .read(&mut chunk)
            .await
            .map_err(|e| Error::Forward(format!("Failed to read upgrade response: {}", e)))?;
        if n == 0 {
            return Err(Error::Forward(
                "Dev server closed the connection during the upgrade".to_string(),
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let leftover = buffer.split_off(end + 4);
    let head = String::from_utf8_lossy(&buffer[..end]).to_string();
    let mut lines = head.split("\r\n");

    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| Error::Forward("Malformed upgrade response from dev server".to_string()))?;

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Ok((status, headers, leftover))
}
