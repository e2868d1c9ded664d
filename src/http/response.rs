//! Responses synthesized by the proxy itself.
//!
//! Only used when nothing from an upstream reached the client: routing
//! misses, request limit violations and sessions that finalized with an
//! error status. Relayed responses are never touched.

use bytes::{BufMut, Bytes, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::observability::tracing::REQUEST_ID_HEADER;

/// A complete `Connection: close` response for `status`.
pub fn error_response(status: StatusCode, request_id: Option<Uuid>) -> Bytes {
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let body = format!("{} {}\n", status.as_u16(), reason);

    let mut out = BytesMut::with_capacity(160 + body.len());
    out.put_slice(format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason).as_bytes());
    out.put_slice(b"Content-Type: text/plain\r\n");
    out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    if let Some(id) = request_id {
        out.put_slice(format!("{REQUEST_ID_HEADER}: {id}\r\n").as_bytes());
    }
    out.put_slice(b"Connection: close\r\n\r\n");
    out.put_slice(body.as_bytes());
    out.freeze()
}

/// Write an error response, ignoring a client that already left.
pub async fn write_error<W>(io: &mut W, status: StatusCode, request_id: Option<Uuid>)
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if let Err(e) = io.write_all(&error_response(status, request_id)).await {
        tracing::debug!(status = status.as_u16(), error = %e, "Client gone before error response");
        return;
    }
    let _ = io.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_status_and_length() {
        let id = Uuid::new_v4();
        let raw = error_response(StatusCode::GATEWAY_TIMEOUT, Some(id));
        let text = std::str::from_utf8(&raw).unwrap();

        assert!(text.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"));
        assert!(text.contains(&format!("x-request-id: {id}\r\n")));
        assert!(text.contains("Content-Length: 20\r\n"));
        assert!(text.ends_with("\r\n\r\n504 Gateway Timeout\n"));
    }

    #[test]
    fn client_closed_status_has_fallback_reason() {
        let status = StatusCode::from_u16(499).unwrap();
        let raw = error_response(status, None);
        assert!(raw.starts_with(b"HTTP/1.1 499 Unknown\r\n"));
    }
}
