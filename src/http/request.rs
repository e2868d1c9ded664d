//! Downstream request reader.
//!
//! # Responsibilities
//! - Read and parse the request head from the client
//! - Enforce header and body size limits
//! - Read a `Content-Length` body in full
//!
//! # Design Decisions
//! - Header size limits enforced before the body is read
//! - Chunked request bodies are refused with 411; the upstream request is
//!   always sent with a known length

use std::io;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::ListenerConfig;
use crate::http::upstream::Http1Protocol;

const MAX_REQUEST_HEADERS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("client closed connection before sending a request")]
    Closed,

    #[error("request header too large")]
    HeaderTooLarge,

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("request body without Content-Length")]
    LengthRequired,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("I/O error reading request: {0}")]
    Io(#[from] io::Error),
}

impl RequestError {
    /// Status to answer with, or `None` when the client is gone.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RequestError::Closed | RequestError::Io(_) => None,
            RequestError::HeaderTooLarge => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            RequestError::BodyTooLarge(_) => Some(StatusCode::PAYLOAD_TOO_LARGE),
            RequestError::LengthRequired => Some(StatusCode::LENGTH_REQUIRED),
            RequestError::Malformed(_) => Some(StatusCode::BAD_REQUEST),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    pub max_header_size: usize,
    pub max_body_size: usize,
}

impl RequestLimits {
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self {
            max_header_size: config.max_request_header_size,
            max_body_size: config.max_request_body_size,
        }
    }
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self::from_config(&ListenerConfig::default())
    }
}

/// A fully read downstream request.
#[derive(Debug, Clone)]
pub struct DownstreamRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl DownstreamRequest {
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| self.uri.host())
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn into_protocol(self) -> Http1Protocol {
        Http1Protocol::new(self.method, self.uri, self.headers, self.body)
    }
}

struct Head {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    len: usize,
}

fn malformed(e: impl ToString) -> RequestError {
    RequestError::Malformed(e.to_string())
}

fn parse_head(buf: &[u8]) -> Result<Option<Head>, RequestError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_REQUEST_HEADERS];
    let mut request = httparse::Request::new(&mut raw);
    let len = match request.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(RequestError::HeaderTooLarge),
        Err(e) => return Err(malformed(e)),
    };

    let method = Method::from_bytes(request.method.unwrap_or_default().as_bytes()).map_err(malformed)?;
    let uri: Uri = request.path.unwrap_or_default().parse().map_err(malformed)?;

    let mut headers = HeaderMap::with_capacity(request.headers.len());
    for header in request.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(malformed)?;
        let value = HeaderValue::from_bytes(header.value).map_err(malformed)?;
        headers.append(name, value);
    }

    Ok(Some(Head {
        method,
        uri,
        headers,
        len,
    }))
}

fn body_length(headers: &HeaderMap, limits: &RequestLimits) -> Result<usize, RequestError> {
    if headers.contains_key(http::header::TRANSFER_ENCODING) {
        return Err(RequestError::LengthRequired);
    }
    let Some(value) = headers.get(http::header::CONTENT_LENGTH) else {
        return Ok(0);
    };
    let len: u64 = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| malformed("invalid Content-Length"))?;
    if len > limits.max_body_size as u64 {
        return Err(RequestError::BodyTooLarge(limits.max_body_size));
    }
    Ok(len as usize)
}

/// Read one request from `io`.
pub async fn read_request<R>(io: &mut R, limits: &RequestLimits) -> Result<DownstreamRequest, RequestError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(limits.max_header_size.min(4096));
    let head = loop {
        if let Some(head) = parse_head(&buf)? {
            break head;
        }
        if buf.len() >= limits.max_header_size {
            return Err(RequestError::HeaderTooLarge);
        }
        if io.read_buf(&mut buf).await? == 0 {
            return Err(if buf.is_empty() {
                RequestError::Closed
            } else {
                malformed("connection closed inside request header")
            });
        }
    };
    if head.len > limits.max_header_size {
        return Err(RequestError::HeaderTooLarge);
    }

    let length = body_length(&head.headers, limits)?;
    let mut body = buf.split_off(head.len);
    while body.len() < length {
        body.reserve(length - body.len());
        if io.read_buf(&mut body).await? == 0 {
            return Err(RequestError::Closed);
        }
    }
    body.truncate(length);

    Ok(DownstreamRequest {
        method: head.method,
        uri: head.uri,
        headers: head.headers,
        body: body.freeze(),
    })
}
