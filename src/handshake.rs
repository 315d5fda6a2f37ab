use crate::error::Error;
use crate::extensions::{self, Extensions};
use crate::request::HttpRequest;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fmt::Write;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout, Duration};

/// Fixed GUID from RFC 6455; the accept key proves the server actually
/// understood the websocket handshake instead of blindly echoing headers.
pub(crate) const UUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HTTP_HEAD_DELIMITER: &[u8] = b"\r\n\r\n";

/// Limit the maximum amount of header data read to prevent a denial of
/// service attack.
const MAX_HEAD_SIZE: usize = 16 * 1024;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn generate_websocket_accept_value(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(UUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

pub(crate) fn generate_websocket_key() -> String {
    let random_bytes: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(random_bytes)
}

/// Reads from the transport until a complete HTTP head (terminated by a blank
/// line) sits in `buffer`, then splits it off and returns it. Whatever
/// arrived after the terminator stays in `buffer` and is handed to the frame
/// codec untouched.
pub(crate) async fn read_head<R: AsyncRead + Unpin>(
    read: &mut R,
    buffer: &mut BytesMut,
) -> Result<BytesMut, Error> {
    timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            if let Some(pos) = find_delimiter(buffer) {
                return Ok(buffer.split_to(pos + HTTP_HEAD_DELIMITER.len()));
            }
            if buffer.len() > MAX_HEAD_SIZE {
                return Err(Error::IncompleteHTTPRequest);
            }
            // A peer may connect and go silent, or trickle bytes forever;
            // the surrounding timeout drops those cases.
            if read.read_buf(buffer).await? == 0 {
                return Err(Error::IncompleteHTTPRequest);
            }
        }
    })
    .await?
}

fn find_delimiter(buffer: &BytesMut) -> Option<usize> {
    buffer
        .windows(HTTP_HEAD_DELIMITER.len())
        .position(|window| window == HTTP_HEAD_DELIMITER)
}

/// Checks the upgrade request for everything RFC 6455 requires from a client
/// and hands back the `Sec-WebSocket-Key` value on success.
pub(crate) fn validate_upgrade(request: &HttpRequest) -> Result<String, Error> {
    if request.header("host").is_none() {
        return Err(Error::NoHostHeaderPresent);
    }
    match request.header("upgrade") {
        Some(value) if value.to_ascii_lowercase().contains("websocket") => {}
        _ => return Err(Error::NoUpgradeHeaderPresent),
    }
    match request.header("connection") {
        Some(value) if value.to_ascii_lowercase().contains("upgrade") => {}
        _ => return Err(Error::NoConnectionHeaderPresent),
    }
    if request.header("sec-websocket-version").is_none() {
        return Err(Error::NoSecWebsocketVersion);
    }
    request
        .header("sec-websocket-key")
        .map(str::to_string)
        .ok_or(Error::NoSecWebsocketKey)
}

/// Renders the `101 Switching Protocols` response, including the negotiated
/// extension header when permessage-deflate was agreed on.
pub(crate) fn build_accept_response(key: &str, extensions: Option<&Extensions>) -> String {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
        generate_websocket_accept_value(key)
    );
    if let Some(extensions) = extensions {
        let _ = write!(
            response,
            "Sec-WebSocket-Extensions: {}\r\n",
            extensions::response_header(extensions)
        );
    }
    response.push_str("\r\n");
    response
}

/// Client-side check of the server's handshake response: the status must be
/// 101 and the `Sec-WebSocket-Accept` value must match the key we sent.
/// Returns the extension parameters the server accepted, if any.
pub(crate) fn verify_response(head: &[u8], sent_key: &str) -> Result<Option<Extensions>, Error> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut header_storage);

    match response.parse(head)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(Error::IncompleteHTTPRequest),
    }

    if response.version != Some(1) || response.code != Some(101) {
        return Err(Error::NoUpgrade);
    }

    let mut headers = HashMap::new();
    for header in response.headers.iter() {
        headers.insert(
            header.name.to_ascii_lowercase(),
            String::from_utf8_lossy(header.value).trim().to_string(),
        );
    }

    let expected = generate_websocket_accept_value(sent_key);
    match headers.get("sec-websocket-accept") {
        Some(accept) if *accept == expected => {}
        _ => return Err(Error::InvalidAcceptKey),
    }

    Ok(headers
        .get("sec-websocket-extensions")
        .and_then(|value| extensions::parse_extensions(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::negotiate;

    // Key and accept value straight from RFC 6455 section 1.3.
    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const RFC_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    #[test]
    fn test_accept_value_matches_rfc_vector() {
        assert_eq!(generate_websocket_accept_value(RFC_KEY), RFC_ACCEPT);
    }

    #[test]
    fn test_generated_keys_are_16_random_bytes() {
        let key = generate_websocket_key();
        assert_eq!(BASE64_STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_websocket_key());
    }

    #[test]
    fn test_validate_upgrade() {
        let raw = b"GET / HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let request = crate::request::parse_request(raw).unwrap();
        assert_eq!(validate_upgrade(&request).unwrap(), RFC_KEY);
    }

    #[test]
    fn test_validate_upgrade_missing_key() {
        let raw = b"GET / HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let request = crate::request::parse_request(raw).unwrap();
        assert!(matches!(
            validate_upgrade(&request),
            Err(Error::NoSecWebsocketKey)
        ));
    }

    #[test]
    fn test_validate_upgrade_missing_host() {
        let raw = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: x\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let request = crate::request::parse_request(raw).unwrap();
        assert!(matches!(
            validate_upgrade(&request),
            Err(Error::NoHostHeaderPresent)
        ));
    }

    #[test]
    fn test_accept_response_shape() {
        let response = build_accept_response(RFC_KEY, None);
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Upgrade: websocket\r\n"));
        assert!(response.contains("Connection: Upgrade\r\n"));
        assert!(response.contains(&format!("Sec-WebSocket-Accept: {}\r\n", RFC_ACCEPT)));
        assert!(!response.contains("Sec-WebSocket-Extensions"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_accept_response_with_deflate() {
        let extensions = negotiate(Some("permessage-deflate"), true).unwrap();
        let response = build_accept_response(RFC_KEY, Some(&extensions));
        assert!(response.contains(
            "Sec-WebSocket-Extensions: permessage-deflate; server_no_context_takeover; client_max_window_bits=15\r\n"
        ));
    }

    #[test]
    fn test_verify_response() {
        let head = build_accept_response(RFC_KEY, None);
        assert!(verify_response(head.as_bytes(), RFC_KEY).unwrap().is_none());
    }

    #[test]
    fn test_verify_response_deflate_negotiated() {
        let extensions = negotiate(Some("permessage-deflate"), true).unwrap();
        let head = build_accept_response(RFC_KEY, Some(&extensions));
        let negotiated = verify_response(head.as_bytes(), RFC_KEY).unwrap().unwrap();
        assert!(negotiated.server_no_context_takeover);
        assert!(!negotiated.client_no_context_takeover);
    }

    #[test]
    fn test_verify_response_bad_accept_key() {
        let head = build_accept_response("another key", None);
        assert!(matches!(
            verify_response(head.as_bytes(), RFC_KEY),
            Err(Error::InvalidAcceptKey)
        ));
    }

    #[test]
    fn test_verify_response_non_101() {
        let head = b"HTTP/1.1 400 Bad Request\r\n\r\n";
        assert!(matches!(
            verify_response(head, RFC_KEY),
            Err(Error::NoUpgrade)
        ));
    }

    #[tokio::test]
    async fn test_read_head_keeps_leftover_bytes() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n\x81\x02hi";
        let (mut client, mut server) = tokio::io::duplex(256);
        tokio::io::AsyncWriteExt::write_all(&mut client, raw)
            .await
            .unwrap();

        let mut buffer = BytesMut::new();
        let head = read_head(&mut server, &mut buffer).await.unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(&buffer[..], b"\x81\x02hi");
    }
}
