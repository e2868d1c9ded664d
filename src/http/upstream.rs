//! HTTP/1.1 backend protocol.
//!
//! # Responsibilities
//! - Serialize the downstream request for the peer
//! - Recognize the response header and derive body framing
//! - Report idempotency for failover decisions
//!
//! # Design Decisions
//! - Hop-by-hop headers are dropped and `Connection` is rewritten per attempt
//! - The request body is fully known up front and sent with `Content-Length`
//! - The response header is relayed exactly as received

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, Uri, Version};

use crate::upstream::framing::BodyFraming;
use crate::upstream::{BufferChain, HeaderParse, ParsedHeader, UpstreamError, UpstreamProtocol};

const MAX_RESPONSE_HEADERS: usize = 64;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Proxies one downstream request over HTTP/1.1.
#[derive(Debug)]
pub struct Http1Protocol {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    store: bool,
    attempts: u32,
    finalized: Option<StatusCode>,
}

impl Http1Protocol {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            store: false,
            attempts: 0,
            finalized: None,
        }
    }

    /// Keep reading the response after the client goes away.
    pub fn with_store(mut self, store: bool) -> Self {
        self.store = store;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Requests built so far, retries included.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Status the session finished with.
    pub fn final_status(&self) -> Option<StatusCode> {
        self.finalized
    }

    fn request_line(&self, out: &mut BytesMut) {
        let target = self.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        out.put_slice(self.method.as_str().as_bytes());
        out.put_u8(b' ');
        out.put_slice(target.as_bytes());
        out.put_slice(b" HTTP/1.1\r\n");
    }

    fn sends_length(&self) -> bool {
        !self.body.is_empty() || matches!(self.method, Method::POST | Method::PUT | Method::PATCH)
    }
}

impl UpstreamProtocol for Http1Protocol {
    fn create_request(&mut self, keepalive: bool) -> Result<BufferChain, UpstreamError> {
        self.attempts += 1;
        let mut head = BytesMut::with_capacity(512);
        self.request_line(&mut head);

        if !self.headers.contains_key(http::header::HOST) {
            let authority = self
                .uri
                .authority()
                .ok_or_else(|| UpstreamError::Request("request has no Host header".into()))?;
            head.put_slice(b"Host: ");
            head.put_slice(authority.as_str().as_bytes());
            head.put_slice(b"\r\n");
        }

        for (name, value) in &self.headers {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            head.put_slice(name.as_str().as_bytes());
            head.put_slice(b": ");
            head.put_slice(value.as_bytes());
            head.put_slice(b"\r\n");
        }

        if self.sends_length() {
            head.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        head.put_slice(if keepalive {
            b"Connection: keep-alive\r\n\r\n".as_slice()
        } else {
            b"Connection: close\r\n\r\n".as_slice()
        });

        Ok(BufferChain::from_segments([head.freeze(), self.body.clone()]))
    }

    fn process_header(&mut self, buf: &[u8]) -> HeaderParse {
        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let header_len = match response.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return HeaderParse::NeedMore,
            Err(e) => return HeaderParse::Invalid(e.to_string()),
        };

        let Some(code) = response.code else {
            return HeaderParse::Invalid("missing status code".into());
        };
        let status = match StatusCode::from_u16(code) {
            Ok(status) => status,
            Err(_) => return HeaderParse::Invalid(format!("bad status {code}")),
        };
        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            return HeaderParse::Interim(header_len);
        }

        let version = if response.version == Some(0) {
            Version::HTTP_10
        } else {
            Version::HTTP_11
        };

        let mut chunked = false;
        let mut length = None;
        let mut close = false;
        let mut keep_alive = false;
        let mut buffering = None;
        let mut cacheable = true;

        for header in response.headers.iter() {
            let value = String::from_utf8_lossy(header.value);
            let value = value.trim();
            if header.name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value
                    .rsplit(',')
                    .next()
                    .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
            } else if header.name.eq_ignore_ascii_case("content-length") {
                match value.parse::<u64>() {
                    Ok(n) if length.is_none_or(|prev| prev == n) => length = Some(n),
                    _ => return HeaderParse::Invalid(format!("invalid Content-Length \"{value}\"")),
                }
            } else if header.name.eq_ignore_ascii_case("connection") {
                for token in value.split(',').map(str::trim) {
                    close |= token.eq_ignore_ascii_case("close");
                    keep_alive |= token.eq_ignore_ascii_case("keep-alive");
                }
            } else if header.name.eq_ignore_ascii_case("x-accel-buffering") {
                if value.eq_ignore_ascii_case("yes") {
                    buffering = Some(true);
                } else if value.eq_ignore_ascii_case("no") {
                    buffering = Some(false);
                }
            } else if header.name.eq_ignore_ascii_case("cache-control") {
                let lower = value.to_ascii_lowercase();
                if lower.contains("no-store") || lower.contains("private") {
                    cacheable = false;
                }
            }
        }

        let framing = if self.method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            BodyFraming::Empty
        } else if chunked {
            BodyFraming::Chunked
        } else if let Some(n) = length {
            BodyFraming::Length(n)
        } else {
            BodyFraming::UntilClose
        };

        let keep_alive = match version {
            Version::HTTP_10 => keep_alive && !close,
            _ => !close,
        } && framing != BodyFraming::UntilClose;

        HeaderParse::Parsed(ParsedHeader {
            status,
            header_len,
            framing,
            keep_alive,
            buffering,
            cacheable,
        })
    }

    fn reinit_request(&mut self) {
        tracing::debug!(method = %self.method, uri = %self.uri, "Reinitializing request for retry");
    }

    fn abort_request(&mut self) {
        tracing::debug!(method = %self.method, uri = %self.uri, "Request aborted");
    }

    fn finalize_request(&mut self, status: StatusCode) {
        self.finalized = Some(status);
    }

    fn is_idempotent(&self) -> bool {
        !matches!(self.method, Method::POST | Method::PATCH) && self.method.as_str() != "LOCK"
    }

    fn store_response(&self) -> bool {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn protocol(method: Method, body: &'static [u8]) -> Http1Protocol {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("example.com"));
        headers.insert("connection", HeaderValue::from_static("upgrade"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        Http1Protocol::new(method, "/items?page=2".parse().unwrap(), headers, Bytes::from_static(body))
    }

    fn serialize(chain: &BufferChain) -> String {
        String::from_utf8(chain.to_vec()).unwrap()
    }

    fn parsed(p: &mut Http1Protocol, raw: &[u8]) -> ParsedHeader {
        match p.process_header(raw) {
            HeaderParse::Parsed(h) => h,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn request_drops_hop_by_hop_headers() {
        let mut p = protocol(Method::POST, b"hello");
        let text = serialize(&p.create_request(true).unwrap());

        assert!(text.starts_with("POST /items?page=2 HTTP/1.1\r\n"));
        assert!(text.contains("host: example.com\r\n"));
        assert!(text.contains("x-trace: abc\r\n"));
        assert!(!text.contains("upgrade"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("Connection: keep-alive\r\n\r\nhello"));

        let text = serialize(&p.create_request(false).unwrap());
        assert!(text.contains("Connection: close\r\n\r\n"));
        assert_eq!(p.attempts(), 2);
    }

    #[test]
    fn host_comes_from_header_or_authority() {
        let mut p = Http1Protocol::new(Method::GET, "/".parse().unwrap(), HeaderMap::new(), Bytes::new());
        assert!(matches!(p.create_request(false), Err(UpstreamError::Request(_))));

        let uri = "http://origin.test:8080/a".parse().unwrap();
        let mut p = Http1Protocol::new(Method::GET, uri, HeaderMap::new(), Bytes::new());
        let text = serialize(&p.create_request(false).unwrap());
        assert!(text.starts_with("GET /a HTTP/1.1\r\nHost: origin.test:8080\r\n"));
    }

    #[test]
    fn bodiless_get_has_no_length() {
        let mut p = protocol(Method::GET, b"");
        let text = serialize(&p.create_request(false).unwrap());
        assert!(!text.to_ascii_lowercase().contains("content-length"));
    }

    #[test]
    fn framing_from_headers() {
        let mut p = protocol(Method::GET, b"");
        let h = parsed(&mut p, b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\nbody");
        assert_eq!(h.framing, BodyFraming::Length(12));
        assert_eq!(h.header_len, 39);
        assert!(h.keep_alive);

        let h = parsed(&mut p, b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n");
        assert_eq!(h.framing, BodyFraming::Chunked);

        let h = parsed(&mut p, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(h.framing, BodyFraming::UntilClose);
        assert!(!h.keep_alive);

        let h = parsed(&mut p, b"HTTP/1.1 204 No Content\r\nContent-Length: 7\r\n\r\n");
        assert_eq!(h.framing, BodyFraming::Empty);

        let mut head = protocol(Method::HEAD, b"");
        let h = parsed(&mut head, b"HTTP/1.1 200 OK\r\nContent-Length: 99\r\n\r\n");
        assert_eq!(h.framing, BodyFraming::Empty);
    }

    #[test]
    fn keep_alive_by_version() {
        let mut p = protocol(Method::GET, b"");
        assert!(!parsed(&mut p, b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n").keep_alive);
        assert!(!parsed(&mut p, b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n").keep_alive);
        assert!(parsed(&mut p, b"HTTP/1.0 200 OK\r\nConnection: Keep-Alive\r\nContent-Length: 0\r\n\r\n").keep_alive);
    }

    #[test]
    fn hints_and_cacheability() {
        let mut p = protocol(Method::GET, b"");
        let h = parsed(
            &mut p,
            b"HTTP/1.1 200 OK\r\nX-Accel-Buffering: no\r\nCache-Control: private, max-age=0\r\nContent-Length: 0\r\n\r\n",
        );
        assert_eq!(h.buffering, Some(false));
        assert!(!h.cacheable);

        let h = parsed(&mut p, b"HTTP/1.1 200 OK\r\nX-Accel-Buffering: yes\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(h.buffering, Some(true));
        assert!(h.cacheable);
    }

    #[test]
    fn partial_interim_and_invalid() {
        let mut p = protocol(Method::GET, b"");
        assert_eq!(p.process_header(b"HTTP/1.1 200 OK\r\nContent-"), HeaderParse::NeedMore);
        assert_eq!(p.process_header(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200"), HeaderParse::Interim(25));
        assert!(matches!(p.process_header(b"garbage\r\n\r\n"), HeaderParse::Invalid(_)));
        assert!(matches!(
            p.process_header(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n"),
            HeaderParse::Invalid(_)
        ));
    }

    #[test]
    fn idempotency_by_method() {
        assert!(protocol(Method::GET, b"").is_idempotent());
        assert!(protocol(Method::PUT, b"").is_idempotent());
        assert!(!protocol(Method::POST, b"").is_idempotent());
        assert!(!protocol(Method::PATCH, b"").is_idempotent());
        assert!(!protocol(Method::from_bytes(b"LOCK").unwrap(), b"").is_idempotent());
    }
}
