//! Per-session outcome log.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::load_balancer::SelectedPeer;
use crate::upstream::relay::RelayMode;

/// One attempt against one peer.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub peer: String,
    pub addr: SocketAddr,
    pub backup: bool,
    /// The connection came from the keepalive pool.
    pub reused: bool,
    /// Status of the response header, when one was received.
    pub status: Option<u16>,
    /// Failure kind that ended the attempt (`timeout`, `http_502`, ...).
    pub failure: Option<String>,
    pub relay_mode: Option<RelayMode>,
    /// Largest in-memory footprint of the body relay.
    pub peak_memory: Option<usize>,
    /// Body bytes that went through a temporary file.
    pub spilled: u64,
    pub connect_ms: u64,
    pub header_ms: Option<u64>,
    pub total_ms: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl AttemptRecord {
    pub(crate) fn new(peer: &SelectedPeer) -> Self {
        Self {
            peer: peer.name().to_string(),
            addr: peer.addr(),
            backup: peer.id().backup,
            reused: false,
            status: None,
            failure: None,
            relay_mode: None,
            peak_memory: None,
            spilled: 0,
            connect_ms: 0,
            header_ms: None,
            total_ms: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Everything a session did, in order.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub id: Uuid,
    pub upstream: String,
    /// Final status: the relayed response's status, or the status the
    /// failure maps to when nothing was relayed.
    pub status: u16,
    pub attempts: Vec<AttemptRecord>,
    /// At least one response byte reached the downstream.
    pub header_delivered: bool,
    /// The response was cut short after delivery started.
    pub truncated: bool,
    pub cancelled: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bytes_downstream: u64,
    pub elapsed_ms: u64,
}

impl SessionReport {
    pub(crate) fn new(id: Uuid, upstream: &str) -> Self {
        Self {
            id,
            upstream: upstream.to_string(),
            status: 0,
            attempts: Vec::new(),
            header_delivered: false,
            truncated: false,
            cancelled: false,
            bytes_sent: 0,
            bytes_received: 0,
            bytes_downstream: 0,
            elapsed_ms: 0,
        }
    }

    pub(crate) fn push(&mut self, attempt: AttemptRecord) {
        self.bytes_sent += attempt.bytes_sent;
        self.bytes_received += attempt.bytes_received;
        self.attempts.push(attempt);
    }

    pub(crate) fn finish(&mut self, status: u16, elapsed: Duration) {
        self.status = status;
        self.elapsed_ms = millis(elapsed);
    }

    /// The response completed without truncation or cancellation.
    pub fn is_complete(&self) -> bool {
        self.header_delivered && !self.truncated && !self.cancelled
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
