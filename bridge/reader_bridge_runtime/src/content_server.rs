//! Loopback HTTP server that hands book bytes to the reading engine.
//!
//! The engine fetches `/?url=<locator>` (any sub-path works) and typically
//! issues `Range` requests to seek inside the archive. Only the designated
//! target and, optionally, files below the asset root are reachable.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::urls;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const ASSET_PREFIX: &str = "/assets/";

/// The resource currently offered to the engine.
#[derive(Debug, Clone)]
pub enum ContentTarget {
    File(PathBuf),
    Bytes { name: String, data: Arc<[u8]> },
}

impl ContentTarget {
    /// The value the engine passes back in the `url` query parameter.
    pub fn locator(&self) -> String {
        match self {
            Self::File(path) => path.to_string_lossy().into_owned(),
            Self::Bytes { name, .. } => name.clone(),
        }
    }

    fn content_type(&self) -> &'static str {
        match self {
            Self::File(path) => content_type_for(path),
            Self::Bytes { name, .. } => content_type_for(Path::new(name)),
        }
    }

    fn open(&self) -> io::Result<Resource> {
        match self {
            Self::File(path) => Resource::open_file(path),
            Self::Bytes { data, .. } => Ok(Resource::Bytes(data.clone())),
        }
    }
}

struct ServeContext {
    target: RwLock<Option<ContentTarget>>,
    asset_root: Option<PathBuf>,
    timeout: Duration,
}

struct Running {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct ContentServer {
    port: u16,
    context: Arc<ServeContext>,
    running: Mutex<Option<Running>>,
}

impl ContentServer {
    pub fn new(config: &ReaderConfig) -> Self {
        Self {
            port: config.content_port,
            context: Arc::new(ServeContext {
                target: RwLock::new(None),
                asset_root: config.asset_root.clone(),
                timeout: config.connection_timeout,
            }),
            running: Mutex::new(None),
        }
    }

    /// Designates `target` as the served resource, binding the listener first
    /// if needed. Returns the origin the engine should fetch from.
    pub fn serve(&self, target: ContentTarget) -> Result<String> {
        let addr = self.ensure_running()?;

        info!("serving {} at {}", target.locator(), origin_for(addr));
        match self.context.target.write() {
            Ok(mut slot) => *slot = Some(target),
            Err(poisoned) => *poisoned.into_inner() = Some(target),
        }

        Ok(origin_for(addr))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .ok()
            .and_then(|running| running.as_ref().map(|running| running.addr))
    }

    pub fn origin(&self) -> Option<String> {
        self.local_addr().map(origin_for)
    }

    pub fn is_running(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Unbinds the listener and forgets the target. Safe to call repeatedly.
    pub fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Ok(mut slot) = self.context.target.write() {
            slot.take();
        }

        let Some(running) = running else {
            return;
        };

        running.shutdown.store(true, Ordering::Release);
        // Wake the blocking accept so the loop can observe the flag.
        if let Err(err) = TcpStream::connect(running.addr) {
            warn!("failed to wake content server accept loop: {err}");
        }

        if running.handle.join().is_err() {
            error!("content server accept thread panicked");
        }
        info!("content server on {} stopped", running.addr);
    }

    fn ensure_running(&self) -> Result<SocketAddr> {
        let mut running = match self.running.lock() {
            Ok(running) => running,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(running) = running.as_ref() {
            return Ok(running.addr);
        }

        let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port));
        let listener =
            TcpListener::bind(bind_addr).map_err(|source| Error::Bind {
                addr: bind_addr,
                source,
            })?;
        let addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let loop_shutdown = shutdown.clone();
        let context = self.context.clone();
        let handle = thread::Builder::new()
            .name("reader-content-accept".to_string())
            .spawn(move || accept_loop(listener, context, loop_shutdown))?;

        info!("content server listening on {addr}");
        *running = Some(Running {
            addr,
            shutdown,
            handle,
        });
        Ok(addr)
    }
}

impl Drop for ContentServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ContentServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentServer")
            .field("port", &self.port)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

// The engine's loader expects a `localhost` origin. The listener only binds
// 127.0.0.1, so a resolver that tries ::1 first takes one refused connect
// before falling back to IPv4.
fn origin_for(addr: SocketAddr) -> String {
    format!("http://localhost:{}/", addr.port())
}

/// The URL under which `locator` is reachable on a server at `origin`.
pub fn resource_url(origin: &str, locator: &str) -> String {
    urls::append_query_param(origin, "url", locator)
}

fn accept_loop(listener: TcpListener, context: Arc<ServeContext>, shutdown: Arc<AtomicBool>) {
    for incoming in listener.incoming() {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let stream = match incoming {
            Ok(stream) => stream,
            Err(err) => {
                warn!("accept error: {err}");
                continue;
            }
        };

        let context = context.clone();
        let spawned = thread::Builder::new()
            .name("reader-content-conn".to_string())
            .spawn(move || {
                let mut stream = stream;
                if let Err(err) = stream.set_read_timeout(Some(context.timeout)) {
                    warn!("set timeout failed: {err}");
                }
                if let Err(err) = handle_connection(&mut stream, &context) {
                    debug!("request error: {err}");
                }
            });

        if let Err(err) = spawned {
            error!("failed to spawn content connection worker: {err}");
        }
    }
}

struct HttpRequest {
    method: String,
    target: String,
    range: Option<String>,
}

fn handle_connection(stream: &mut TcpStream, context: &ServeContext) -> io::Result<()> {
    let request = match read_http_request(stream)? {
        Some(request) => request,
        None => return write_status(stream, 400, "Bad Request", false),
    };

    let status = respond(stream, context, &request)?;
    debug!("{} {} -> {status}", request.method, request.target);
    Ok(())
}

fn respond(stream: &mut TcpStream, context: &ServeContext, request: &HttpRequest) -> io::Result<u16> {
    let head_only = match request.method.as_str() {
        "GET" => false,
        "HEAD" => true,
        "OPTIONS" => {
            write_head(
                stream,
                204,
                "No Content",
                &[
                    ("Access-Control-Allow-Methods", "GET, HEAD, OPTIONS".to_string()),
                    ("Access-Control-Allow-Headers", "Range".to_string()),
                    ("Access-Control-Max-Age", "86400".to_string()),
                    ("Content-Length", "0".to_string()),
                ],
            )?;
            return Ok(204);
        }
        _ => {
            write_status(stream, 405, "Method Not Allowed", false)?;
            return Ok(405);
        }
    };

    let (path, query) = match request.target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (request.target.as_str(), ""),
    };

    if let (Some(root), Some(relative)) = (&context.asset_root, path.strip_prefix(ASSET_PREFIX)) {
        return serve_asset(stream, root, relative, request, head_only);
    }

    let Some(locator) = urls::query_param(query, "url").and_then(urls::decode_component) else {
        write_status(stream, 404, "Not Found", head_only)?;
        return Ok(404);
    };

    let target = match context.target.read() {
        Ok(slot) => slot.clone(),
        Err(_) => None,
    };
    let Some(target) = target.filter(|target| target.locator() == locator) else {
        write_status(stream, 404, "Not Found", head_only)?;
        return Ok(404);
    };

    match target.open() {
        Ok(resource) => serve_resource(
            stream,
            resource,
            target.content_type(),
            request.range.as_deref(),
            head_only,
        ),
        Err(err) => write_open_error(stream, &target.locator(), &err, head_only),
    }
}

fn serve_asset(
    stream: &mut TcpStream,
    root: &Path,
    relative: &str,
    request: &HttpRequest,
    head_only: bool,
) -> io::Result<u16> {
    let Some(relative) = urls::decode_component(relative) else {
        write_status(stream, 400, "Bad Request", head_only)?;
        return Ok(400);
    };

    let relative = Path::new(relative.as_ref());
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        write_status(stream, 403, "Forbidden", head_only)?;
        return Ok(403);
    }

    let path = root.join(relative);
    match Resource::open_file(&path) {
        Ok(resource) => serve_resource(
            stream,
            resource,
            content_type_for(&path),
            request.range.as_deref(),
            head_only,
        ),
        Err(err) => write_open_error(stream, &path.to_string_lossy(), &err, head_only),
    }
}

fn write_open_error(
    stream: &mut TcpStream,
    what: &str,
    err: &io::Error,
    head_only: bool,
) -> io::Result<u16> {
    match err.kind() {
        io::ErrorKind::NotFound => {
            debug!("content not found: {what}");
            write_status(stream, 404, "Not Found", head_only)?;
            Ok(404)
        }
        _ => {
            warn!("failed to open {what}: {err}");
            write_status(stream, 500, "Internal Server Error", head_only)?;
            Ok(500)
        }
    }
}

enum Resource {
    File { file: File, len: u64 },
    Bytes(Arc<[u8]>),
}

impl Resource {
    fn open_file(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if metadata.is_dir() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "is a directory"));
        }
        Ok(Self::File {
            file,
            len: metadata.len(),
        })
    }

    fn len(&self) -> u64 {
        match self {
            Self::File { len, .. } => *len,
            Self::Bytes(data) => data.len() as u64,
        }
    }

    fn copy_range(&mut self, start: u64, len: u64, out: &mut impl Write) -> io::Result<()> {
        match self {
            Self::File { file, .. } => {
                file.seek(SeekFrom::Start(start))?;
                let copied = io::copy(&mut file.take(len), out)?;
                if copied < len {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("file shrank while serving: {copied} of {len} bytes"),
                    ));
                }
                Ok(())
            }
            Self::Bytes(data) => {
                let start = start as usize;
                let end = start + len as usize;
                out.write_all(&data[start..end])
            }
        }
    }
}

fn serve_resource(
    stream: &mut TcpStream,
    mut resource: Resource,
    content_type: &str,
    range: Option<&str>,
    head_only: bool,
) -> io::Result<u16> {
    let total = resource.len();

    let (status, reason, start, len, content_range) = match resolve_range(range, total) {
        Ok(None) => (200, "OK", 0, total, None),
        Ok(Some((first, last))) => (
            206,
            "Partial Content",
            first,
            last - first + 1,
            Some(format!("bytes {first}-{last}/{total}")),
        ),
        Err(Unsatisfiable) => {
            write_head(
                stream,
                416,
                "Range Not Satisfiable",
                &[
                    ("Accept-Ranges", "bytes".to_string()),
                    ("Content-Range", format!("bytes */{total}")),
                    ("Content-Length", "0".to_string()),
                ],
            )?;
            return Ok(416);
        }
    };

    let mut headers = vec![
        ("Accept-Ranges", "bytes".to_string()),
        ("Content-Type", content_type.to_string()),
        ("Content-Length", len.to_string()),
    ];
    if let Some(content_range) = content_range {
        headers.push(("Content-Range", content_range));
    }

    write_head(stream, status, reason, &headers)?;
    if !head_only && len > 0 {
        resource.copy_range(start, len, stream)?;
    }
    stream.flush()?;
    Ok(status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Unsatisfiable;

/// Resolves a `Range` header against a resource of `len` bytes into an
/// inclusive `(first, last)` pair. `Ok(None)` means the whole resource.
/// Only single `bytes` ranges that lie entirely inside the resource are
/// accepted.
pub(crate) fn resolve_range(
    header: Option<&str>,
    len: u64,
) -> std::result::Result<Option<(u64, u64)>, Unsatisfiable> {
    let Some(header) = header else {
        return Ok(None);
    };

    let header = header.trim();
    let ranges = match header.split_once('=') {
        Some((unit, ranges)) if unit.trim().eq_ignore_ascii_case("bytes") => ranges.trim(),
        _ => return Err(Unsatisfiable),
    };

    if ranges.contains(',') || len == 0 {
        return Err(Unsatisfiable);
    }

    let (first, last) = ranges.split_once('-').ok_or(Unsatisfiable)?;
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        let suffix = last.parse::<u64>().map_err(|_| Unsatisfiable)?;
        if suffix == 0 {
            return Err(Unsatisfiable);
        }
        return Ok(Some((len.saturating_sub(suffix), len - 1)));
    }

    let first = first.parse::<u64>().map_err(|_| Unsatisfiable)?;
    let last = if last.is_empty() {
        len - 1
    } else {
        last.parse::<u64>().map_err(|_| Unsatisfiable)?
    };

    if first > last || last >= len {
        return Err(Unsatisfiable);
    }

    Ok(Some((first, last)))
}

fn read_http_request(stream: &mut TcpStream) -> io::Result<Option<HttpRequest>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        if let Some(idx) = find_header_end(&buf) {
            break idx;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Ok(None);
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "incomplete http request",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]);
    let mut lines = header_text.split("\r\n");
    let Some(request_line) = lines.next() else {
        return Ok(None);
    };

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Ok(None);
    };

    let mut range = None;
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("range") {
                range = Some(value.trim().to_string());
            }
        }
    }

    Ok(Some(HttpRequest {
        method: method.to_string(),
        target: target.to_string(),
        range,
    }))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

fn write_status(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    head_only: bool,
) -> io::Result<()> {
    let body = format!("{status} {reason}\n");
    write_head(
        stream,
        status,
        reason,
        &[
            ("Content-Type", "text/plain; charset=utf-8".to_string()),
            ("Content-Length", body.len().to_string()),
        ],
    )?;
    if !head_only {
        stream.write_all(body.as_bytes())?;
    }
    stream.flush()
}

fn write_head(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    headers: &[(&str, String)],
) -> io::Result<()> {
    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("Access-Control-Allow-Origin: *\r\n");
    head.push_str("Access-Control-Expose-Headers: Content-Range, Accept-Ranges, Content-Length\r\n");
    head.push_str("Cache-Control: no-store\r\nConnection: close\r\n\r\n");
    stream.write_all(head.as_bytes())
}

fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("epub") => "application/epub+zip",
        Some("pdf") => "application/pdf",
        Some("mobi" | "azw" | "azw3" | "prc") => "application/x-mobipocket-ebook",
        Some("fb2") => "application/x-fictionbook+xml",
        Some("cbz") => "application/vnd.comicbook+zip",
        Some("zip") => "application/zip",
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("xhtml") => "application/xhtml+xml",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("woff2") => "font/woff2",
        Some("woff") => "font/woff",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        _ => "application/octet-stream",
    }
}
