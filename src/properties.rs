//! Well-known property paths guests read via the property host calls.
//!
//! The catalog follows the attribute names Envoy exposes; ports are encoded
//! as 8-byte little-endian integers when served from these paths.

pub const PLUGIN_NAME: &[&str] = &["plugin_name"];
pub const PLUGIN_ROOT_ID: &[&str] = &["plugin_root_id"];
pub const PLUGIN_VM_ID: &[&str] = &["plugin_vm_id"];
pub const VM_ID: &[&str] = &["vm_id"];

// Downstream connection properties.
pub const CONNECTION_ID: &[&str] = &["connection", "id"];
pub const SOURCE_ADDRESS: &[&str] = &["source", "address"];
pub const SOURCE_PORT: &[&str] = &["source", "port"];
pub const DESTINATION_ADDRESS: &[&str] = &["destination", "address"];
pub const DESTINATION_PORT: &[&str] = &["destination", "port"];
pub const CONNECTION_TLS_VERSION: &[&str] = &["connection", "tls_version"];
pub const CONNECTION_REQUESTED_SERVER_NAME: &[&str] = &["connection", "requested_server_name"];
pub const CONNECTION_MTLS: &[&str] = &["connection", "mtls"];

// Upstream connection properties.
pub const UPSTREAM_ADDRESS: &[&str] = &["upstream", "address"];
pub const UPSTREAM_PORT: &[&str] = &["upstream", "port"];

// HTTP request properties.
pub const REQUEST_PROTOCOL: &[&str] = &["request", "protocol"];
pub const REQUEST_TIME: &[&str] = &["request", "time"];
pub const REQUEST_PATH: &[&str] = &["request", "path"];
pub const REQUEST_URL_PATH: &[&str] = &["request", "url_path"];
pub const REQUEST_HOST: &[&str] = &["request", "host"];
pub const REQUEST_SCHEME: &[&str] = &["request", "scheme"];
pub const REQUEST_METHOD: &[&str] = &["request", "method"];
pub const REQUEST_HEADERS: &[&str] = &["request", "headers"];
pub const REQUEST_REFERER: &[&str] = &["request", "referer"];
pub const REQUEST_USERAGENT: &[&str] = &["request", "useragent"];
pub const REQUEST_ID: &[&str] = &["request", "id"];
pub const REQUEST_QUERY: &[&str] = &["request", "query"];
pub const REQUEST_DURATION: &[&str] = &["request", "duration"];
pub const REQUEST_SIZE: &[&str] = &["request", "size"];

// HTTP response properties.
pub const RESPONSE_CODE: &[&str] = &["response", "code"];
pub const RESPONSE_CODE_DETAILS: &[&str] = &["response", "code_details"];
pub const RESPONSE_FLAGS: &[&str] = &["response", "flags"];
pub const RESPONSE_GRPC_STATUS: &[&str] = &["response", "grpc_status"];
pub const RESPONSE_HEADERS: &[&str] = &["response", "headers"];
pub const RESPONSE_TRAILERS: &[&str] = &["response", "trailers"];
pub const RESPONSE_SIZE: &[&str] = &["response", "size"];

/// True when a guest-supplied path names the given well-known property.
pub fn matches(path: &[String], property: &[&str]) -> bool {
    path.len() == property.len() && path.iter().zip(property).all(|(a, b)| a == b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_compares_whole_path() {
        let path = vec!["request".to_string(), "path".to_string()];
        assert!(matches(&path, REQUEST_PATH));
        assert!(!matches(&path, REQUEST_URL_PATH));
        assert!(!matches(&path[..1], REQUEST_PATH));
    }
}
