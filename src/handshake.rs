//! HTTP upgrade handshake (RFC 6455 section 4, server side only).
//!
//! The bridge reads the request head itself instead of letting the WebSocket
//! library do it, so it can answer with precise statuses (400/401/404) and
//! authenticate before any frame is exchanged.

use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};
use url::form_urlencoded;

use crate::error::HandshakeError;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const MAX_HANDSHAKE_BYTES: usize = 16 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Parsed request head. Header names are stored lowercased.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub path: String,
    pub query: Option<String>,
    pub version: (u8, u8),
    headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn parse(head: &str) -> Result<Self, HandshakeError> {
        let mut lines = head.split("\r\n");
        let request_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| HandshakeError::Malformed("empty request".into()))?;

        let mut parts = request_line.split(' ').filter(|p| !p.is_empty());
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(HandshakeError::Malformed(format!(
                "bad request line {request_line:?}"
            )));
        };
        let version = parse_version(version)?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(HandshakeError::Malformed(format!("bad header line {line:?}")));
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(HandshakeError::Malformed("empty header name".into()));
            }
            headers.push((name.to_ascii_lowercase(), value.trim().to_string()));
        }

        let (raw_path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (target, None),
        };

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            path: normalize_path(raw_path),
            query,
            version,
            headers,
        })
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// URL-decoded query parameter.
    pub fn query_param(&self, key: &str) -> Option<String> {
        self.query.as_deref().and_then(|raw| {
            form_urlencoded::parse(raw.as_bytes())
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.to_string())
        })
    }

    pub fn version_str(&self) -> String {
        format!("HTTP/{}.{}", self.version.0, self.version.1)
    }
}

fn parse_version(raw: &str) -> Result<(u8, u8), HandshakeError> {
    let bad = || HandshakeError::Malformed(format!("bad http version {raw:?}"));
    let digits = raw.strip_prefix("HTTP/").ok_or_else(bad)?;
    let (major, minor) = digits.split_once('.').unwrap_or((digits, "0"));
    let major = major.parse::<u8>().map_err(|_| bad())?;
    let minor = minor.parse::<u8>().map_err(|_| bad())?;
    Ok((major, minor))
}

/// Drops trailing slashes; the root stays `/`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Validated upgrade parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub key: String,
    pub protocol: Option<String>,
}

pub fn validate_upgrade(req: &HttpRequest) -> Result<UpgradeRequest, HandshakeError> {
    if req.method != "GET" {
        return Err(HandshakeError::Malformed(format!(
            "method {} is not GET",
            req.method
        )));
    }
    if req.version < (1, 1) {
        return Err(HandshakeError::Malformed(format!(
            "{} is older than HTTP/1.1",
            req.version_str()
        )));
    }
    let upgrade_ok = req
        .header("upgrade")
        .map(|v| has_token(v, "websocket"))
        .unwrap_or(false);
    if !upgrade_ok {
        return Err(HandshakeError::Malformed("missing Upgrade: websocket".into()));
    }
    let connection_ok = req
        .header("connection")
        .map(|v| has_token(v, "upgrade"))
        .unwrap_or(false);
    if !connection_ok {
        return Err(HandshakeError::Malformed(
            "Connection header lacks upgrade".into(),
        ));
    }
    let key = req
        .header("sec-websocket-key")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HandshakeError::Malformed("missing Sec-WebSocket-Key".into()))?;
    req.header("sec-websocket-version")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HandshakeError::Malformed("missing Sec-WebSocket-Version".into()))?;

    let protocol = req.header("sec-websocket-protocol").and_then(|v| {
        v.split(',')
            .map(str::trim)
            .find(|p| !p.is_empty())
            .map(str::to_string)
    });

    Ok(UpgradeRequest {
        key: key.to_string(),
        protocol,
    })
}

fn has_token(list: &str, token: &str) -> bool {
    list.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

pub fn check_mount(req: &HttpRequest, mount_path: &str) -> Result<(), HandshakeError> {
    if req.path == normalize_path(mount_path) {
        Ok(())
    } else {
        Err(HandshakeError::NotFound(req.path.clone()))
    }
}

/// `Sec-WebSocket-Accept` for a client key: base64(SHA-1(key + GUID)).
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

pub fn switching_protocols_response(upgrade: &UpgradeRequest) -> String {
    let mut resp = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
        compute_accept_key(&upgrade.key)
    );
    if let Some(protocol) = &upgrade.protocol {
        resp.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    resp.push_str("\r\n");
    resp
}

pub fn error_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

/// Reads until the blank line ending the request head.
///
/// Returns the parsed request together with any bytes that arrived after the
/// terminator; those belong to the WebSocket stream.
pub async fn read_request_head<S>(stream: &mut S) -> Result<(HttpRequest, Vec<u8>), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Eof);
        }
        let search_from = buf.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_terminator(&buf[search_from..]).map(|p| p + search_from) {
            let head_len = pos + HEAD_TERMINATOR.len();
            if head_len > MAX_HANDSHAKE_BYTES {
                return Err(HandshakeError::TooLarge {
                    limit: MAX_HANDSHAKE_BYTES,
                });
            }
            let head = std::str::from_utf8(&buf[..pos])
                .map_err(|_| HandshakeError::Malformed("request head is not utf-8".into()))?;
            let request = HttpRequest::parse(head)?;
            let leftover = buf[head_len..].to_vec();
            return Ok((request, leftover));
        }

        if buf.len() >= MAX_HANDSHAKE_BYTES {
            return Err(HandshakeError::TooLarge {
                limit: MAX_HANDSHAKE_BYTES,
            });
        }
    }
}

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPGRADE: &str = "GET /bridge/?token=abc%20def HTTP/1.1\r\nHost: 127.0.0.1:6400\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Protocol: bridge.v2, bridge.v1\r\n";

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn parses_request_line_and_headers() {
        let req = HttpRequest::parse(UPGRADE).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/bridge");
        assert_eq!(req.version, (1, 1));
        assert_eq!(req.header("UPGRADE"), Some("websocket"));
        assert_eq!(req.query_param("token").as_deref(), Some("abc def"));
    }

    #[test]
    fn validates_upgrade_and_picks_first_protocol() {
        let req = HttpRequest::parse(UPGRADE).unwrap();
        let upgrade = validate_upgrade(&req).unwrap();
        assert_eq!(upgrade.key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(upgrade.protocol.as_deref(), Some("bridge.v2"));

        let resp = switching_protocols_response(&upgrade);
        assert!(resp.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(resp.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(resp.contains("Sec-WebSocket-Protocol: bridge.v2\r\n"));
        assert!(resp.ends_with("\r\n\r\n"));
    }

    #[test]
    fn rejects_non_upgrade_requests() {
        let cases = [
            UPGRADE.replace("GET ", "POST "),
            UPGRADE.replace("HTTP/1.1", "HTTP/1.0"),
            UPGRADE.replace("Upgrade: websocket\r\n", ""),
            UPGRADE.replace("keep-alive, Upgrade", "keep-alive"),
            UPGRADE.replace("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==", "Sec-WebSocket-Key:"),
            UPGRADE.replace("Sec-WebSocket-Version: 13\r\n", ""),
        ];
        for raw in cases {
            let req = HttpRequest::parse(&raw).unwrap();
            let err = validate_upgrade(&req).unwrap_err();
            assert_eq!(err.status(), Some("400 Bad Request"), "{raw}");
        }
    }

    #[test]
    fn newer_http_versions_are_accepted() {
        let req = HttpRequest::parse(&UPGRADE.replace("HTTP/1.1", "HTTP/2")).unwrap();
        assert_eq!(req.version, (2, 0));
        assert!(validate_upgrade(&req).is_ok());
    }

    #[test]
    fn mount_path_is_compared_after_normalizing() {
        let req = HttpRequest::parse(UPGRADE).unwrap();
        assert!(check_mount(&req, "/bridge").is_ok());
        assert!(check_mount(&req, "/bridge/").is_ok());
        let err = check_mount(&req, "/other").unwrap_err();
        assert_eq!(err.status(), Some("404 Not Found"));
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("//"), "/");
    }

    #[test]
    fn garbage_request_line_is_malformed() {
        assert!(matches!(
            HttpRequest::parse("HELLO\r\n"),
            Err(HandshakeError::Malformed(_))
        ));
        assert!(matches!(
            HttpRequest::parse("GET / SPDY/3\r\n"),
            Err(HandshakeError::Malformed(_))
        ));
        assert!(matches!(
            HttpRequest::parse("GET / HTTP/1.1\r\nno-colon-here\r\n"),
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn read_head_keeps_bytes_after_terminator() {
        let mut raw = format!("{UPGRADE}\r\n").into_bytes();
        raw.extend_from_slice(b"\x81\x05hello");
        let mut reader = raw.as_slice();
        let (req, leftover) = read_request_head(&mut reader).await.unwrap();
        assert_eq!(req.path, "/bridge");
        assert_eq!(leftover, b"\x81\x05hello");
    }

    #[tokio::test]
    async fn read_head_enforces_size_limit() {
        let mut raw = String::from("GET /bridge HTTP/1.1\r\n");
        while raw.len() <= MAX_HANDSHAKE_BYTES {
            raw.push_str("X-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        raw.push_str("\r\n");
        let mut reader = raw.as_bytes();
        let err = read_request_head(&mut reader).await.unwrap_err();
        assert!(matches!(err, HandshakeError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn read_head_reports_eof() {
        let mut reader: &[u8] = b"GET /bridge HTTP/1.1\r\nHost: x\r\n";
        let err = read_request_head(&mut reader).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Eof));
    }
}
