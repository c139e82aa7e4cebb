use crate::ingest::mask_credentials;
use crate::overlay::{self, OverlayStream};
use crate::service::VisionService;
use crate::zone::Zone;
use anyhow::{anyhow, Result};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;

pub const DEFAULT_ZONE: [f64; 4] = [0.1, 0.3, 0.9, 0.8];
pub const DEFAULT_WINDOW_SECS: u64 = 600;
pub const DEFAULT_ENTRY_LIMIT: usize = 50;
pub const MAX_ENTRY_LIMIT: usize = 500;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8800".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    service: Arc<VisionService>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, service: Arc<VisionService>) -> Self {
        Self { cfg, service }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let service = self.service;
        let join = std::thread::Builder::new()
            .name("vision-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, service, shutdown_thread) {
                    log::error!("vision api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, service: Arc<VisionService>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    log::warn!("vision api: cannot configure connection: {}", err);
                    continue;
                }
                if let Err(err) = handle_connection(stream, &service) {
                    log::warn!("vision api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, service: &Arc<VisionService>) -> Result<()> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    let query = request.query();
    let reply = match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => Reply::json(200, json!({"status": "ok"})),
        ("POST", "/api/vision/sources") => start_source(service, &query),
        ("DELETE", "/api/vision/sources") => stop_source(service, &query),
        ("PUT", "/api/vision/sources/rois") => update_zones(service, &query),
        ("GET", "/api/vision/summary") => summary(service, &query),
        ("GET", "/api/vision/entries") => entries(service, &query),
        ("GET", "/api/vision/debug") => match debug_stream(service, &query) {
            Ok(stream_body) => {
                spawn_debug_stream(stream, stream_body)?;
                return Ok(());
            }
            Err(reply) => reply,
        },
        (
            _,
            "/health" | "/api/vision/sources" | "/api/vision/sources/rois" | "/api/vision/summary"
            | "/api/vision/entries" | "/api/vision/debug",
        ) => Reply::error(405, "method_not_allowed"),
        _ => Reply::error(404, "not_found"),
    };
    let payload = serde_json::to_vec(&reply.body)?;
    write_response(&mut stream, reply.status, "application/json", &payload)
}

struct Reply {
    status: u16,
    body: serde_json::Value,
}

impl Reply {
    fn json(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, json!({ "error": message }))
    }

    fn internal(err: anyhow::Error) -> Self {
        log::error!("vision api: {:#}", err);
        Self::error(500, "internal_error")
    }
}

fn required_url(query: &HashMap<String, String>) -> std::result::Result<String, Reply> {
    match query.get("url").map(|u| u.trim()) {
        Some(url) if !url.is_empty() => Ok(url.to_string()),
        _ => Err(Reply::error(400, "missing url")),
    }
}

/// Zones from `rois` (JSON list), or a single zone from `x0,y0,x1,y1` with
/// defaults for the missing coordinates.
fn zones_from_query(query: &HashMap<String, String>) -> Result<Vec<Zone>> {
    if let Some(rois) = query.get("rois") {
        return Zone::parse_list(rois);
    }
    let mut coords = DEFAULT_ZONE;
    for (slot, key) in coords.iter_mut().zip(["x0", "y0", "x1", "y1"]) {
        if let Some(raw) = query.get(key) {
            *slot = raw
                .trim()
                .parse::<f64>()
                .map_err(|_| anyhow!("{} is not a number", key))?;
        }
    }
    Ok(vec![Zone::clamped(coords[0], coords[1], coords[2], coords[3])?])
}

fn parse_number<T: std::str::FromStr>(
    query: &HashMap<String, String>,
    key: &str,
    default: T,
) -> std::result::Result<T, Reply> {
    match query.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Reply::error(400, &format!("invalid {}", key))),
    }
}

fn start_source(service: &VisionService, query: &HashMap<String, String>) -> Reply {
    let url = match required_url(query) {
        Ok(url) => url,
        Err(reply) => return reply,
    };
    let zones = match zones_from_query(query) {
        Ok(zones) => zones,
        Err(err) => {
            log::debug!("vision api: rejected zones: {:#}", err);
            return Reply::error(400, "invalid rois");
        }
    };
    match service.start(&url, zones) {
        Ok(outcome) => Reply::json(
            200,
            json!({
                "status": if outcome.already_running { "already_running" } else { "started" },
                "url": outcome.source,
                "rois": outcome.zones,
            }),
        ),
        Err(err) => {
            log::warn!("vision api: start {} failed: {:#}", mask_credentials(&url), err);
            Reply::error(400, &format!("{}", err))
        }
    }
}

fn stop_source(service: &VisionService, query: &HashMap<String, String>) -> Reply {
    let url = match required_url(query) {
        Ok(url) => url,
        Err(reply) => return reply,
    };
    match service.stop(&url) {
        Ok(_) => Reply::json(200, json!({"status": "stopped", "url": url})),
        Err(err) => Reply::internal(err),
    }
}

fn update_zones(service: &VisionService, query: &HashMap<String, String>) -> Reply {
    let url = match required_url(query) {
        Ok(url) => url,
        Err(reply) => return reply,
    };
    let zones = match zones_from_query(query) {
        Ok(zones) => zones,
        Err(_) => return Reply::error(400, "invalid rois"),
    };
    match service.update_zones(&url, zones.clone()) {
        Ok(true) => Reply::json(200, json!({"status": "updated", "url": url, "rois": zones})),
        Ok(false) => Reply::error(404, "source not started"),
        Err(err) => Reply::internal(err),
    }
}

fn summary(service: &VisionService, query: &HashMap<String, String>) -> Reply {
    let window = match parse_number(query, "window_sec", DEFAULT_WINDOW_SECS) {
        Ok(window) => window,
        Err(reply) => return reply,
    };
    match service.summary(window) {
        Ok(summary) => match serde_json::to_value(summary) {
            Ok(body) => Reply::json(200, body),
            Err(err) => Reply::internal(err.into()),
        },
        Err(err) => Reply::internal(err),
    }
}

fn entries(service: &VisionService, query: &HashMap<String, String>) -> Reply {
    let since_sec = match parse_number(query, "since_sec", DEFAULT_WINDOW_SECS) {
        Ok(since) => since.max(1),
        Err(reply) => return reply,
    };
    let limit = match parse_number(query, "limit", DEFAULT_ENTRY_LIMIT) {
        Ok(limit) => limit.clamp(1, MAX_ENTRY_LIMIT),
        Err(reply) => return reply,
    };
    let since = service.clock().now() - since_sec as f64;
    match service.recent_entries(since) {
        Ok(mut items) => {
            items.truncate(limit);
            Reply::json(200, json!({ "items": items }))
        }
        Err(err) => Reply::internal(err),
    }
}

fn debug_stream(
    service: &VisionService,
    query: &HashMap<String, String>,
) -> std::result::Result<OverlayStream, Reply> {
    let url = required_url(query)?;
    let width = parse_number(query, "w", overlay::DEFAULT_MAX_WIDTH)?;
    let quality = parse_number(query, "q", overlay::DEFAULT_QUALITY)?;
    match service.debug_stream(&url, width, quality) {
        Ok(Some(stream)) => Ok(stream),
        Ok(None) => Err(Reply::error(404, "source not started")),
        Err(err) => Err(Reply::internal(err)),
    }
}

/// Stream overlay parts on a dedicated thread until the worker stops or the
/// client goes away.
fn spawn_debug_stream(mut stream: TcpStream, parts: OverlayStream) -> Result<()> {
    std::thread::Builder::new()
        .name("vision-debug".to_string())
        .spawn(move || {
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
                overlay::content_type()
            );
            if stream.write_all(header.as_bytes()).is_err() {
                return;
            }
            for part in parts {
                if stream.write_all(&part).and_then(|_| stream.flush()).is_err() {
                    log::debug!("vision api: debug client disconnected");
                    return;
                }
            }
        })?;
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text.split("\r\n").next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
}

impl HttpRequest {
    /// Decoded query parameters; the last occurrence of a key wins.
    fn query(&self) -> HashMap<String, String> {
        match self.raw_path.split_once('?') {
            Some((_, query)) => url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
            None => HashMap::new(),
        }
    }
}
