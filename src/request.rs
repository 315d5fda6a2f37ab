use crate::error::Error;
use crate::extensions;
use std::collections::HashMap;
use std::fmt::Write;
use url::Url;

/// The parsed upgrade request, surfaced to the application before the
/// handshake response goes out so it can inspect URL, query and headers.
/// Header names are stored lowercased, lookups are case-insensitive.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: HashMap<String, String>,
}

impl HttpRequest {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Parses a complete request head (everything up to and including the blank
/// line) into an `HttpRequest`.
pub(crate) fn parse_request(raw: &[u8]) -> Result<HttpRequest, Error> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut header_storage);

    match request.parse(raw)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(Error::IncompleteHTTPRequest),
    }

    // Only "GET <uri> HTTP/1.1" starts a websocket handshake.
    if request.method != Some("GET") || request.version != Some(1) {
        return Err(Error::InvalidHTTPHandshake);
    }

    let mut headers = HashMap::new();
    for header in request.headers.iter() {
        headers.insert(
            header.name.to_ascii_lowercase(),
            String::from_utf8_lossy(header.value).trim().to_string(),
        );
    }

    Ok(HttpRequest {
        method: "GET".to_string(),
        uri: request.path.ok_or(Error::IncompleteHTTPRequest)?.to_string(),
        version: "HTTP/1.1".to_string(),
        headers,
    })
}

/// Everything the dialer needs to know about a `ws://` / `wss://` URL.
pub(crate) struct ParsedUrl {
    /// `host:port`, for the TCP connect.
    pub host_with_port: String,
    /// Bare hostname, for TLS server name verification.
    pub host: String,
    /// Value of the request `Host` header: the port is kept only when it was
    /// spelled out in the URL.
    pub host_header: String,
    /// Path plus query string.
    pub request_path: String,
    pub use_tls: bool,
}

/// Validates the URL scheme and splits the URL into the pieces used by the
/// dialer and the handshake request. Missing ports default to 80 for `ws`
/// and 443 for `wss`; any other scheme is rejected.
pub(crate) fn parse_ws_url(ws_url: &str) -> Result<ParsedUrl, Error> {
    let parsed_url = Url::parse(ws_url)?;

    let (default_port, use_tls) = match parsed_url.scheme() {
        "ws" => (80, false),
        "wss" => (443, true),
        _ => return Err(Error::InvalidSchemeURL),
    };

    let host = parsed_url.host_str().ok_or(Error::URLNoHost)?.to_string();
    let port = parsed_url.port().unwrap_or(default_port);

    let host_header = match parsed_url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.clone(),
    };

    let request_path = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    Ok(ParsedUrl {
        host_with_port: format!("{}:{}", host, port),
        host,
        host_header,
        request_path,
        use_tls,
    })
}

/// Builds the upgrade request a client writes right after connecting.
///
/// Everything is already known at this point, so the request is assembled
/// directly as a string rather than going through an HTTP request type.
pub(crate) fn construct_http_request(
    parsed: &ParsedUrl,
    key: &str,
    offer_deflate: bool,
    extra_headers: &[(String, String)],
) -> String {
    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n",
        parsed.request_path, parsed.host_header, key,
    );

    if offer_deflate {
        let _ = write!(
            request,
            "Sec-WebSocket-Extensions: {}\r\n",
            extensions::offer_header()
        );
    }
    for (name, value) in extra_headers {
        let _ = write!(request, "{}: {}\r\n", name, value);
    }
    request.push_str("\r\n");

    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_valid() {
        let raw = b"GET /chat?room=1 HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.uri, "/chat?room=1");
        assert_eq!(request.header("host"), Some("example.com"));
        // Lookups must not care about the case used on the wire.
        assert_eq!(
            request.header("SEC-WEBSOCKET-KEY"),
            Some("dGhlIHNhbXBsZSBub25jZQ==")
        );
    }

    #[test]
    fn test_parse_request_rejects_non_get() {
        let raw = b"POST / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert!(matches!(
            parse_request(raw),
            Err(Error::InvalidHTTPHandshake)
        ));
    }

    #[test]
    fn test_parse_ws_url() {
        let parsed = parse_ws_url("ws://localhost:8080/chat?x=1").unwrap();
        assert_eq!(parsed.host_with_port, "localhost:8080");
        assert_eq!(parsed.host_header, "localhost:8080");
        assert_eq!(parsed.request_path, "/chat?x=1");
        assert!(!parsed.use_tls);
    }

    #[test]
    fn test_parse_ws_url_default_ports() {
        let ws = parse_ws_url("ws://example.com/").unwrap();
        assert_eq!(ws.host_with_port, "example.com:80");
        assert_eq!(ws.host_header, "example.com");

        let wss = parse_ws_url("wss://example.com/").unwrap();
        assert_eq!(wss.host_with_port, "example.com:443");
        assert!(wss.use_tls);
    }

    #[test]
    fn test_parse_ws_url_rejects_unknown_scheme() {
        assert!(matches!(
            parse_ws_url("ftp://localhost:8080"),
            Err(Error::InvalidSchemeURL)
        ));
    }

    #[test]
    fn test_parse_ws_url_rejects_missing_host() {
        assert!(parse_ws_url("ws://:8080").is_err());
    }

    #[test]
    fn test_construct_http_request() {
        let parsed = parse_ws_url("ws://localhost:8080").unwrap();
        let request = construct_http_request(
            &parsed,
            "dGhlIHNhbXBsZSBub25jZQ==",
            false,
            &[("X-Custom".to_string(), "1".to_string())],
        );
        assert!(request.starts_with("GET / HTTP/1.1\r\n"));
        assert!(request.contains("Host: localhost:8080\r\n"));
        assert!(request.contains("Upgrade: websocket\r\n"));
        assert!(request.contains("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n"));
        assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(request.contains("X-Custom: 1\r\n"));
        assert!(!request.contains("Sec-WebSocket-Extensions"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_construct_http_request_with_deflate_offer() {
        let parsed = parse_ws_url("ws://localhost:8080").unwrap();
        let request = construct_http_request(&parsed, "key", true, &[]);
        assert!(request
            .contains("Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits=15\r\n"));
    }
}
