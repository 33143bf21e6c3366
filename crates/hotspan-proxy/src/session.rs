//! Per-connection proxy session.
//!
//! A session owns one accepted client connection and walks it through
//! parsing, the URL fixer pipeline, upstream connect, and the counted relay.
//! Every path that reaches the relay submits exactly one byte report to the
//! client registry before the session closes, including forced closes during
//! proxy shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;

use hotspan_core::{ByteTransferReport, ClientIdentity, ClientRegistry, FixerPipeline};

use crate::error::SessionError;
use crate::relay::{relay, RelayEnd};

const MAX_HEAD_SIZE: usize = 8192;
const MAX_HEADERS: usize = 32;

const RESPONSE_CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\r\n";

const RESPONSE_403: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\r\n";

const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\r\n";

/// What a completed session relayed and for whom.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// The identity the report was recorded under.
    pub identity: ClientIdentity,
    /// Bytes moved in both directions.
    pub report: ByteTransferReport,
}

/// One accepted connection, handled end to end.
pub struct ProxySession {
    stream: TcpStream,
    peer: SocketAddr,
    registry: ClientRegistry,
    fixers: Arc<FixerPipeline>,
    connect_timeout: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl ProxySession {
    /// Creates a session for an accepted connection.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        registry: ClientRegistry,
        fixers: Arc<FixerPipeline>,
        connect_timeout: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            stream,
            peer,
            registry,
            fixers,
            connect_timeout,
            shutdown,
        }
    }

    /// Runs the session to completion.
    ///
    /// Rejection paths (malformed request, blocked client, unreachable
    /// upstream) answer the client with a terse HTTP error and never touch
    /// the registry; only sessions that reached the relay are recorded.
    pub async fn run(mut self) -> std::result::Result<SessionSummary, SessionError> {
        let identity = ClientIdentity::Ip(self.peer.ip());

        let head = match self.read_request_head().await {
            Ok(head) => head,
            Err(err) => {
                if matches!(err, SessionError::MalformedRequest(_)) {
                    let _ = self.stream.write_all(RESPONSE_400).await;
                }
                return Err(err);
            }
        };

        let mut request = match parse_request(&head) {
            Ok(request) => request,
            Err(err) => {
                let _ = self.stream.write_all(RESPONSE_400).await;
                return Err(err);
            }
        };

        if self.registry.is_blocked(&identity) {
            let _ = self.stream.write_all(RESPONSE_403).await;
            return Err(SessionError::ClientBlocked(identity));
        }

        // The fixed target is what gets connected to and what the rebuilt
        // request line carries upstream.
        request.target = self.fixers.apply(&request.target);
        let (host, port) = match split_authority(&request.target, request.default_port) {
            Some(authority) => authority,
            None => {
                let _ = self.stream.write_all(RESPONSE_400).await;
                return Err(SessionError::MalformedRequest(format!(
                    "unparseable target {:?}",
                    request.target
                )));
            }
        };

        let upstream = match timeout(
            self.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(source)) => {
                let _ = self.stream.write_all(RESPONSE_502).await;
                return Err(SessionError::UpstreamUnreachable {
                    target: request.target,
                    source,
                });
            }
            Err(_) => {
                let _ = self.stream.write_all(RESPONSE_502).await;
                return Err(SessionError::UpstreamUnreachable {
                    target: request.target,
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ),
                });
            }
        };

        self.relay_to(upstream, identity, &request, &head).await
    }

    /// Confirms the request to the client, replays buffered bytes, and runs
    /// the relay. Submits the byte report on every exit path.
    async fn relay_to(
        mut self,
        mut upstream: TcpStream,
        identity: ClientIdentity,
        request: &ParsedRequest,
        head: &[u8],
    ) -> std::result::Result<SessionSummary, SessionError> {
        // Bytes written upstream before the relay proper starts; counted as
        // proxy-to-internet traffic.
        let mut preamble = 0u64;

        if request.is_connect {
            self.stream.write_all(RESPONSE_CONNECT_ESTABLISHED).await?;
            // Anything the client sent after its CONNECT head already
            // belongs to the tunnel.
            let buffered = &head[request.head_len..];
            if !buffered.is_empty() {
                upstream.write_all(buffered).await?;
                preamble += buffered.len() as u64;
            }
        } else {
            let outbound = rebuild_head(head, request);
            upstream.write_all(&outbound).await?;
            preamble += outbound.len() as u64;
        }

        let (totals, end) = relay(self.stream, upstream, &mut self.shutdown).await;
        let report = ByteTransferReport::new(
            totals.upstream_to_client,
            totals.client_to_upstream + preamble,
        );
        self.registry.record_session(&identity, &report, None);

        match end {
            RelayEnd::Completed => Ok(SessionSummary { identity, report }),
            RelayEnd::Failed(err) => Err(SessionError::RelayIo(err)),
            RelayEnd::Cancelled => Err(SessionError::Cancelled),
        }
    }

    /// Reads until the request head terminator, the size cap, or shutdown.
    async fn read_request_head(&mut self) -> std::result::Result<Vec<u8>, SessionError> {
        let mut head = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];
        loop {
            if contains_head_terminator(&head) {
                return Ok(head);
            }
            if head.len() >= MAX_HEAD_SIZE {
                return Err(SessionError::MalformedRequest(
                    "request head exceeds size cap".into(),
                ));
            }
            tokio::select! {
                read = self.stream.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        return Err(SessionError::MalformedRequest(
                            "connection closed before request head".into(),
                        ));
                    }
                    head.extend_from_slice(&chunk[..n]);
                }
                _ = self.shutdown.recv() => return Err(SessionError::Cancelled),
            }
        }
    }
}

fn contains_head_terminator(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

/// The parts of a parsed request head the session acts on.
#[derive(Debug)]
struct ParsedRequest {
    method: String,
    /// Raw request target before the fixer pipeline runs.
    target: String,
    version_minor: u8,
    is_connect: bool,
    default_port: u16,
    /// Offset where the head ends and buffered payload bytes begin.
    head_len: usize,
}

/// Parses the buffered head into the request the session will serve.
///
/// The request line is parsed by hand rather than with httparse: known-buggy
/// clients embed spaces and other junk in the target, and those requests
/// must survive parsing so the fixer pipeline can repair them. The header
/// block itself is still parsed strictly.
fn parse_request(head: &[u8]) -> std::result::Result<ParsedRequest, SessionError> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| SessionError::MalformedRequest("missing request line".into()))?;
    let line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| SessionError::MalformedRequest("request line is not UTF-8".into()))?;

    // Method runs to the first space, the protocol version from the last;
    // everything between is the target, spaces and all.
    let (method, rest) = line
        .split_once(' ')
        .ok_or_else(|| SessionError::MalformedRequest("missing request target".into()))?;
    let (target, version) = rest
        .rsplit_once(' ')
        .ok_or_else(|| SessionError::MalformedRequest("missing protocol version".into()))?;
    let method = method.trim();
    let target = target.trim();
    if method.is_empty() || target.is_empty() {
        return Err(SessionError::MalformedRequest("empty request line".into()));
    }
    let version_minor = match version.trim() {
        "HTTP/1.0" => 0,
        "HTTP/1.1" => 1,
        other => {
            return Err(SessionError::MalformedRequest(format!(
                "unsupported protocol {other:?}"
            )))
        }
    };

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let status = httparse::parse_headers(&head[line_end + 2..], &mut headers)
        .map_err(|e| SessionError::MalformedRequest(e.to_string()))?;
    let (headers_len, parsed_headers) = match status {
        httparse::Status::Complete(done) => done,
        httparse::Status::Partial => {
            return Err(SessionError::MalformedRequest("incomplete head".into()))
        }
    };
    let head_len = line_end + 2 + headers_len;

    if method.eq_ignore_ascii_case("CONNECT") {
        return Ok(ParsedRequest {
            method: method.to_string(),
            target: target.to_string(),
            version_minor,
            is_connect: true,
            default_port: 443,
            head_len,
        });
    }

    let (target, default_port) = if target.starts_with("http://") {
        (target.to_string(), 80)
    } else if target.starts_with("https://") {
        (target.to_string(), 443)
    } else {
        // Origin-form request: the Host header names the upstream.
        let host = parsed_headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("Host"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| SessionError::MalformedRequest("missing Host header".into()))?;
        (format!("http://{host}{target}"), 80)
    };

    Ok(ParsedRequest {
        method: method.to_string(),
        target,
        version_minor,
        is_connect: false,
        default_port,
        head_len,
    })
}

/// Splits a fixed target into host and port, honoring a scheme prefix and
/// bracketed IPv6 hosts.
fn split_authority(target: &str, default_port: u16) -> Option<(String, u16)> {
    let rest = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target);
    let authority = rest.split(['/', '?']).next()?;
    if authority.is_empty() {
        return None;
    }

    if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, remainder) = bracketed.split_once(']')?;
        let port = match remainder.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None => default_port,
        };
        return Some((format!("[{host}]"), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().ok()?;
            Some((host.to_string(), port))
        }
        _ => Some((authority.to_string(), default_port)),
    }
}

/// Rebuilds the forwarded head with the fixed target in the request line.
/// Headers and any buffered body bytes pass through untouched.
fn rebuild_head(head: &[u8], request: &ParsedRequest) -> Vec<u8> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let mut outbound = Vec::with_capacity(head.len() + 32);
    outbound.extend_from_slice(request.method.as_bytes());
    outbound.push(b' ');
    outbound.extend_from_slice(request.target.as_bytes());
    outbound.extend_from_slice(
        format!(" HTTP/1.{}", request.version_minor).as_bytes(),
    );
    outbound.extend_from_slice(&head[line_end..]);
    outbound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_connect_request() {
        let head = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let request = parse_request(head).unwrap();
        assert!(request.is_connect);
        assert_eq!(request.target, "example.com:443");
        assert_eq!(request.default_port, 443);
        assert_eq!(request.head_len, head.len());
    }

    #[test]
    fn parse_absolute_form_request() {
        let head = b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let request = parse_request(head).unwrap();
        assert!(!request.is_connect);
        assert_eq!(request.target, "http://example.com/index.html");
        assert_eq!(request.default_port, 80);
    }

    #[test]
    fn parse_origin_form_uses_host_header() {
        let head = b"GET /index.html HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        let request = parse_request(head).unwrap();
        assert_eq!(request.target, "http://example.com:8080/index.html");
    }

    #[test]
    fn parse_origin_form_without_host_is_malformed() {
        let head = b"GET /index.html HTTP/1.1\r\nAccept: */*\r\n\r\n";
        assert!(matches!(
            parse_request(head),
            Err(SessionError::MalformedRequest(_))
        ));
    }

    #[test]
    fn parse_garbage_is_malformed() {
        assert!(matches!(
            parse_request(b"\x01\x02\x03\r\n\r\n"),
            Err(SessionError::MalformedRequest(_))
        ));
        assert!(matches!(
            parse_request(b"NOT A REQUEST\r\n\r\n"),
            Err(SessionError::MalformedRequest(_))
        ));
    }

    #[test]
    fn parse_keeps_spaces_in_target_for_the_fixers() {
        let head = b"GET http://store.example.com/cool game HTTP/1.1\r\nHost: store.example.com\r\n\r\n";
        let request = parse_request(head).unwrap();
        assert_eq!(request.target, "http://store.example.com/cool game");
        assert_eq!(request.head_len, head.len());
    }

    #[test]
    fn split_authority_host_port() {
        assert_eq!(
            split_authority("example.com:8443", 443),
            Some(("example.com".to_string(), 8443))
        );
    }

    #[test]
    fn split_authority_defaults_port() {
        assert_eq!(
            split_authority("example.com", 443),
            Some(("example.com".to_string(), 443))
        );
    }

    #[test]
    fn split_authority_url_with_path() {
        assert_eq!(
            split_authority("http://example.com:8080/path/x", 80),
            Some(("example.com".to_string(), 8080))
        );
        assert_eq!(
            split_authority("http://example.com/path", 80),
            Some(("example.com".to_string(), 80))
        );
    }

    #[test]
    fn split_authority_ipv6() {
        assert_eq!(
            split_authority("[::1]:8228", 80),
            Some(("[::1]".to_string(), 8228))
        );
        assert_eq!(split_authority("[::1]", 80), Some(("[::1]".to_string(), 80)));
    }

    #[test]
    fn split_authority_rejects_empty() {
        assert_eq!(split_authority("http://", 80), None);
        assert_eq!(split_authority("", 80), None);
    }

    #[test]
    fn rebuild_head_swaps_request_line_only() {
        let head = b"GET http://a/b c HTTP/1.1\r\nHost: a\r\n\r\nBODY";
        let request = ParsedRequest {
            method: "GET".into(),
            target: "http://a/b%20c".into(),
            version_minor: 1,
            is_connect: false,
            default_port: 80,
            head_len: head.len() - 4,
        };
        let outbound = rebuild_head(head, &request);
        assert_eq!(
            outbound,
            b"GET http://a/b%20c HTTP/1.1\r\nHost: a\r\n\r\nBODY"
        );
    }

    #[test]
    fn head_terminator_detection() {
        assert!(contains_head_terminator(b"GET / HTTP/1.1\r\n\r\n"));
        assert!(!contains_head_terminator(b"GET / HTTP/1.1\r\n"));
    }
}
