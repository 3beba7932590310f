use http::header::HeaderName;
use http::Request;

use crate::error::{GatewayError, Result};
use crate::http::{Body, ClientAddr};

/// Key for requests whose caller cannot be identified.
pub(crate) const UNKNOWN: &str = "unknown";

/// Derives the rate-limit key for a request.
///
/// Implemented for any `Fn(&Request<Body>) -> String`, so a closure works
/// wherever an extractor is expected. An empty key is treated as `"unknown"`.
pub trait KeyExtractor: Send + Sync + 'static {
    fn extract(&self, req: &Request<Body>) -> String;
}

impl<F> KeyExtractor for F
where
    F: Fn(&Request<Body>) -> String + Send + Sync + 'static,
{
    fn extract(&self, req: &Request<Body>) -> String {
        self(req)
    }
}

/// Keys requests by the caller's IP address.
///
/// Reads the [`ClientAddr`] extension set by the server; requests without it
/// share the key `"unknown"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteAddr;

impl KeyExtractor for RemoteAddr {
    fn extract(&self, req: &Request<Body>) -> String {
        remote_ip(req)
    }
}

fn remote_ip(req: &Request<Body>) -> String {
    req.extensions()
        .get::<ClientAddr>()
        .map(|ClientAddr(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Keys requests by the value of a header, such as an API key.
///
/// Requests without the header, or with a value that is not visible ASCII,
/// fall back to the caller's IP address.
#[derive(Debug, Clone)]
pub struct HeaderKey {
    name: HeaderName,
}

impl HeaderKey {
    pub fn new(name: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| GatewayError::invalid("header", format!("'{name}': {e}")))?;
        Ok(Self { name })
    }

    pub fn name(&self) -> &HeaderName {
        &self.name
    }
}

impl KeyExtractor for HeaderKey {
    fn extract(&self, req: &Request<Body>) -> String {
        req.headers()
            .get(&self.name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| remote_ip(req))
    }
}

/// One key shared by every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Global;

impl KeyExtractor for Global {
    fn extract(&self, _req: &Request<Body>) -> String {
        "global".to_string()
    }
}
