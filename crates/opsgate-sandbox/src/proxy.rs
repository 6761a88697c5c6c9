//! Ephemeral allowlist-filtering HTTP forward/tunnel proxy.
//!
//! `CONNECT host:port` requests are tunnelled after an allowlist check;
//! absolute-form requests (`GET http://host/path`) are rewritten to origin
//! form and relayed with `Connection: close`. Anything not on the allowlist
//! gets `403` without a connection attempt; an unreachable upstream gets
//! `502`.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use url::Url;

use opsgate_contracts::error::{OpsError, OpsResult};

const HEADER_CAP: usize = 64 * 1024;
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const ACCEPT_IDLE: Duration = Duration::from_millis(25);

// ── Allowlist ────────────────────────────────────────────────────────────────

/// Whether `host` matches any allowlist pattern.
///
/// Patterns are exact hosts or `*.suffix` wildcards matching any host that
/// ends in `.suffix`. Matching is case-insensitive.
pub fn is_host_allowed(host: &str, allowlist: &[String]) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }
    allowlist.iter().any(|pattern| {
        let pattern = pattern.trim().to_ascii_lowercase();
        match pattern.strip_prefix("*.") {
            Some(suffix) => host.ends_with(&format!(".{suffix}")),
            None => host == pattern,
        }
    })
}

/// Reject empty patterns and bare `*.` wildcards.
pub fn validate_allowlist(patterns: &[String]) -> OpsResult<()> {
    for pattern in patterns {
        let p = pattern.trim();
        if p.is_empty() {
            return Err(OpsError::Config {
                reason: "empty pattern in egress allowlist".to_string(),
            });
        }
        let bare_wildcard = p == "*." || p == "*";
        let misplaced_star = p.chars().skip(1).any(|c| c == '*')
            || (p.starts_with('*') && !p.starts_with("*."));
        if bare_wildcard || misplaced_star || p.contains('/') {
            return Err(OpsError::Config {
                reason: format!("invalid egress pattern: {pattern}"),
            });
        }
    }
    Ok(())
}

// ── Proxy lifecycle ──────────────────────────────────────────────────────────

struct Shared {
    allowlist: Vec<String>,
    running: AtomicBool,
    active: AtomicUsize,
    next_id: AtomicU64,
    /// Clones of every in-flight stream, client and upstream, keyed by
    /// connection and force-closed after the drain grace period.
    conns: Mutex<HashMap<u64, Vec<TcpStream>>>,
}

impl Shared {
    /// Register a clone of `stream` so shutdown can close it. Once the
    /// proxy is stopping the stream is closed straight away instead.
    fn track(&self, id: u64, stream: &TcpStream) {
        let Ok(clone) = stream.try_clone() else {
            return;
        };
        let Ok(mut conns) = self.conns.lock() else {
            return;
        };
        if self.running.load(Ordering::SeqCst) {
            conns.entry(id).or_default().push(clone);
        } else {
            let _ = clone.shutdown(Shutdown::Both);
        }
    }
}

/// A running egress proxy. Stops on `shutdown` or drop.
pub struct EgressProxy {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept: Option<JoinHandle<()>>,
}

impl EgressProxy {
    /// Bind `bind` on an ephemeral port and start serving.
    pub fn start(bind: &str, allowlist: Vec<String>) -> OpsResult<Self> {
        let listener = TcpListener::bind((bind, 0)).map_err(|e| OpsError::Config {
            reason: format!("egress proxy bind {bind} failed: {e}"),
        })?;
        let addr = listener.local_addr().map_err(|e| OpsError::Config {
            reason: format!("egress proxy addr failed: {e}"),
        })?;
        listener.set_nonblocking(true).map_err(|e| OpsError::Config {
            reason: format!("egress proxy nonblocking failed: {e}"),
        })?;

        let shared = Arc::new(Shared {
            allowlist,
            running: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            conns: Mutex::new(HashMap::new()),
        });

        let accept_shared = shared.clone();
        let accept = thread::spawn(move || accept_loop(listener, accept_shared));
        info!(addr = %addr, "egress proxy listening");

        Ok(Self {
            addr,
            shared,
            accept: Some(accept),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn active_connections(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Stop accepting, give in-flight connections a short grace period,
    /// then close whatever is left.
    pub fn shutdown(&mut self) {
        let Some(accept) = self.accept.take() else {
            return;
        };
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = accept.join();

        let deadline = Instant::now() + DRAIN_GRACE;
        while self.shared.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(ACCEPT_IDLE);
        }
        if let Ok(mut conns) = self.shared.conns.lock() {
            for stream in conns.drain().flat_map(|(_, streams)| streams) {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        debug!(addr = %self.addr, "egress proxy stopped");
    }
}

impl Drop for EgressProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE);
                continue;
            }
            Err(e) => {
                warn!(error = %e, "egress proxy accept failed");
                thread::sleep(ACCEPT_IDLE);
                continue;
            }
        };
        let _ = stream.set_nonblocking(false);

        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        shared.track(id, &stream);
        shared.active.fetch_add(1, Ordering::SeqCst);

        let conn_shared = shared.clone();
        thread::spawn(move || {
            if let Err(e) = handle_connection(stream, &conn_shared, id) {
                debug!(peer = %peer, error = %e, "egress proxy connection ended with error");
            }
            if let Ok(mut conns) = conn_shared.conns.lock() {
                conns.remove(&id);
            }
            conn_shared.active.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

// ── Request handling ─────────────────────────────────────────────────────────

struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
    /// Bytes read past the end of the header block.
    rest: Vec<u8>,
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(pos + 4);
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
}

fn read_head(stream: &mut TcpStream) -> io::Result<Option<RequestHead>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let end = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() >= HEADER_CAP {
            return Ok(None);
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..end]).into_owned();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let (Some(method), Some(target), Some(version)) =
        (request_line.next(), request_line.next(), request_line.next())
    else {
        return Ok(None);
    };

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    Ok(Some(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        rest: buf[end..].to_vec(),
    }))
}

fn respond(stream: &mut TcpStream, status: &str) -> io::Result<()> {
    let body = format!("{status}\n");
    write!(
        stream,
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )?;
    stream.flush()
}

fn connect_upstream(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = e,
        }
    }
    Err(last)
}

/// Split `host:port`, accepting bracketed IPv6 literals.
fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((authority.to_string(), default_port)),
    }
}

fn handle_connection(mut client: TcpStream, shared: &Shared, id: u64) -> io::Result<()> {
    client.set_read_timeout(Some(HEADER_READ_TIMEOUT))?;
    let Some(head) = read_head(&mut client)? else {
        return respond(&mut client, "400 Bad Request");
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        tunnel(client, head, shared, id)
    } else {
        forward(client, head, shared, id)
    }
}

fn tunnel(mut client: TcpStream, head: RequestHead, shared: &Shared, id: u64) -> io::Result<()> {
    let Some((host, port)) = split_authority(&head.target, 443) else {
        return respond(&mut client, "400 Bad Request");
    };
    if !is_host_allowed(&host, &shared.allowlist) {
        info!(host = %host, "egress denied");
        return respond(&mut client, "403 Forbidden");
    }

    let mut upstream = match connect_upstream(&host, port) {
        Ok(s) => s,
        Err(e) => {
            warn!(host = %host, port, error = %e, "egress upstream unreachable");
            return respond(&mut client, "502 Bad Gateway");
        }
    };
    shared.track(id, &upstream);

    client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")?;
    client.flush()?;
    if !head.rest.is_empty() {
        upstream.write_all(&head.rest)?;
    }
    debug!(host = %host, port, "tunnel established");
    relay(client, upstream)
}

fn forward(mut client: TcpStream, head: RequestHead, shared: &Shared, id: u64) -> io::Result<()> {
    let Ok(url) = Url::parse(&head.target) else {
        return respond(&mut client, "400 Bad Request");
    };
    if url.scheme() != "http" {
        return respond(&mut client, "400 Bad Request");
    }
    let Some(host) = url.host_str().map(|h| h.trim_matches(|c| c == '[' || c == ']').to_string())
    else {
        return respond(&mut client, "400 Bad Request");
    };
    if !is_host_allowed(&host, &shared.allowlist) {
        info!(host = %host, "egress denied");
        return respond(&mut client, "403 Forbidden");
    }
    let port = url.port_or_known_default().unwrap_or(80);

    let mut upstream = match connect_upstream(&host, port) {
        Ok(s) => s,
        Err(e) => {
            warn!(host = %host, port, error = %e, "egress upstream unreachable");
            return respond(&mut client, "502 Bad Gateway");
        }
    };
    shared.track(id, &upstream);

    let mut origin = url.path().to_string();
    if let Some(query) = url.query() {
        origin.push('?');
        origin.push_str(query);
    }

    let mut request = format!("{} {} {}\r\n", head.method, origin, head.version);
    let mut has_host = false;
    for (name, value) in &head.headers {
        let lower = name.to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "connection" | "proxy-connection" | "keep-alive" | "proxy-authorization"
        ) {
            continue;
        }
        has_host |= lower == "host";
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    if !has_host {
        match url.port() {
            Some(p) => request.push_str(&format!("Host: {host}:{p}\r\n")),
            None => request.push_str(&format!("Host: {host}\r\n")),
        }
    }
    request.push_str("Connection: close\r\n\r\n");

    upstream.write_all(request.as_bytes())?;
    if !head.rest.is_empty() {
        upstream.write_all(&head.rest)?;
    }
    debug!(host = %host, method = %head.method, "forwarding request");
    relay(client, upstream)
}

/// Copy bytes both ways until either side closes.
fn relay(client: TcpStream, upstream: TcpStream) -> io::Result<()> {
    client.set_read_timeout(None)?;
    let mut client_read = client.try_clone()?;
    let mut upstream_write = upstream.try_clone()?;

    let outbound = thread::spawn(move || {
        let _ = io::copy(&mut client_read, &mut upstream_write);
        let _ = upstream_write.shutdown(Shutdown::Write);
    });

    let mut upstream_read = upstream;
    let mut client_write = client;
    let _ = io::copy(&mut upstream_read, &mut client_write);
    let _ = client_write.shutdown(Shutdown::Both);
    let _ = upstream_read.shutdown(Shutdown::Both);
    let _ = outbound.join();
    Ok(())
}
