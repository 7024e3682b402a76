//! Outbound call plumbing: upstream resolution, pseudo-header handling and
//! the pending-call table shared by HTTP and gRPC dispatch.
//!
//! Call ids come from one monotonic counter so a guest can never observe the
//! same id on two in-flight calls, whatever their protocol. Completions look
//! their id up before delivering; an id that was cancelled (or already
//! completed) is a silent no-op.

use std::collections::HashMap;

use crate::adaptor::CancelHandle;
use crate::error::WasmError;
use crate::map::ProxyMap;

/// A parsed upstream endpoint, either from the plugin's upstream table or
/// from a literal URI the guest passed to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub scheme: String,
    pub host: String,
    /// Explicit port, when the URI carried one.
    pub port: Option<u16>,
}

impl Upstream {
    /// Parses `scheme://host[:port]`, tolerating a missing scheme (assumed
    /// `http`) and a trailing path. Returns `None` for anything without a
    /// usable host or with a non-numeric port.
    pub fn parse(uri: &str) -> Option<Upstream> {
        let (scheme, rest) = match uri.split_once("://") {
            Some((s, r)) => (s.to_ascii_lowercase(), r),
            None => ("http".to_string(), uri),
        };
        let authority = rest.split('/').next().unwrap_or("");
        if authority.is_empty() {
            return None;
        }
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h, Some(p.parse::<u16>().ok()?)),
            None => (authority, None),
        };
        if host.is_empty() {
            return None;
        }
        Some(Upstream {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    /// Connect port: the explicit one when the URI carried it, otherwise
    /// the default for `scheme` (which for outbound HTTP calls is the
    /// request's `:scheme`, not the upstream's own).
    pub fn port_for(&self, scheme: &str) -> u16 {
        self.port.unwrap_or(match scheme {
            "https" | "grpcs" => 443,
            _ => 80,
        })
    }

    /// Whether traffic to this upstream goes out without TLS.
    pub fn plaintext(&self) -> bool {
        self.scheme != "https" && self.scheme != "grpcs"
    }
}

/// Resolves a guest-supplied upstream name against the plugin's table.
///
/// In strict mode only table entries are reachable. Otherwise an unknown
/// name is parsed as a literal URI, so plugins can dial arbitrary endpoints
/// on servers that allow it.
pub(crate) fn resolve_upstream(
    upstreams: &HashMap<String, Upstream>,
    strict: bool,
    name: &str,
) -> Result<Upstream, WasmError> {
    if let Some(upstream) = upstreams.get(name) {
        return Ok(upstream.clone());
    }
    if strict {
        return Err(WasmError::bad_argument());
    }
    Upstream::parse(name).ok_or_else(WasmError::bad_argument)
}

/// Splits the guest's header map into request line parts and real headers.
///
/// The `:method`, `:path` and `:authority` pseudo headers are mandatory;
/// `:scheme` defaults to `http`. Pseudo headers never reach the wire, and
/// `Host` is set from the authority, replacing any value the guest put there.
pub(crate) struct RequestLine {
    pub method: String,
    pub path: String,
    pub authority: String,
    pub scheme: String,
    pub headers: ProxyMap,
}

pub(crate) fn split_pseudo_headers(headers: &ProxyMap) -> Result<RequestLine, WasmError> {
    let method = headers.get(":method").map(str::to_string);
    let path = headers.get(":path").map(str::to_string);
    let authority = headers.get(":authority").map(str::to_string);
    let scheme = headers
        .get(":scheme")
        .map(str::to_string)
        .unwrap_or_else(|| "http".to_string());

    let (method, path, authority) = match (method, path, authority) {
        (Some(m), Some(p), Some(a)) => (m, p, a),
        _ => return Err(WasmError::bad_argument()),
    };

    let mut plain = ProxyMap::with_capacity(headers.len());
    for (key, value) in headers.entries() {
        if !key.starts_with(':') {
            plain.add(key, value);
        }
    }
    plain.put("Host", &authority);

    Ok(RequestLine {
        method,
        path,
        authority,
        scheme,
        headers: plain,
    })
}

/// Normalizes the request path and checks the full URI the call will carry.
///
/// A relative path gains a leading `/`; a full URI
/// (`scheme://authority + path`) that does not parse, or that contains
/// whitespace or control characters, is a bad argument.
pub(crate) fn normalize_request_path(
    scheme: &str,
    authority: &str,
    path: &str,
) -> Result<String, WasmError> {
    let mut path = path.to_string();
    if !path.is_empty() && !path.starts_with('/') {
        path.insert(0, '/');
    }
    let uri = format!("{}://{}{}", scheme, authority, path);
    if uri.contains(|c: char| c.is_whitespace() || c.is_control())
        || Upstream::parse(&uri).is_none()
    {
        return Err(WasmError::bad_argument());
    }
    Ok(path)
}

/// In-flight outbound calls keyed by their guest-visible id.
///
/// The stored handles cancel the underlying transfer; dropping one without
/// invoking it lets the transfer finish unobserved.
pub(crate) struct PendingCalls {
    next_id: u32,
    http: HashMap<u32, CancelHandle>,
    grpc: HashMap<u32, CancelHandle>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            http: HashMap::new(),
            grpc: HashMap::new(),
        }
    }

    /// Ids start at 1 and never repeat within a plugin instance.
    pub(crate) fn next_id(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.next_id
    }

    pub(crate) fn insert_http(&mut self, id: u32, cancel: CancelHandle) {
        self.http.insert(id, cancel);
    }

    pub(crate) fn remove_http(&mut self, id: u32) -> Option<CancelHandle> {
        self.http.remove(&id)
    }

    pub(crate) fn insert_grpc(&mut self, id: u32, cancel: CancelHandle) {
        self.grpc.insert(id, cancel);
    }

    pub(crate) fn remove_grpc(&mut self, id: u32) -> Option<CancelHandle> {
        self.grpc.remove(&id)
    }

    pub(crate) fn contains_grpc(&self, id: u32) -> bool {
        self.grpc.contains_key(&id)
    }

    /// Cancels everything still in flight. Used when a plugin shuts down.
    pub(crate) fn cancel_all(&mut self) {
        for (_, cancel) in self.http.drain() {
            cancel();
        }
        for (_, cancel) in self.grpc.drain() {
            cancel();
        }
    }
}

/// The effective tick period after clamping against the configured floor.
pub(crate) fn clamp_tick_period(requested_ms: u32, min_ms: u32) -> u64 {
    requested_ms.max(min_ms) as u64
}
