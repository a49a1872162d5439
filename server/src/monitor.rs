//! Passive connection and traffic counters for operational visibility.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the accept loop and the per-connection tasks
///
/// Every counter is a relaxed atomic: readers get a consistent-enough view
/// for logs and dashboards, and writers never contend on a lock. Nothing in
/// game logic reads these values.
#[derive(Debug, Default)]
pub struct NetworkMonitor {
    accepted: AtomicU64,
    rejected: AtomicU64,
    active: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    malformed: AtomicU64,
    unknown_types: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSnapshot {
    /// Connections admitted since startup
    pub accepted: u64,
    /// Connections refused because the server was full
    pub rejected: u64,
    /// Connections currently being served
    pub active: u64,
    /// Complete frames read from clients
    pub frames_in: u64,
    /// Frames written to clients
    pub frames_out: u64,
    /// Inbound bytes, headers included
    pub bytes_in: u64,
    /// Outbound bytes, headers included
    pub bytes_out: u64,
    /// Frames that closed their connection
    pub malformed: u64,
    /// Frames dropped for an unregistered type id
    pub unknown_types: u64,
}

impl NetworkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: a close without a matching open must not wrap.
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn connection_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self, bytes: usize) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, bytes: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn malformed_frame(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_type(&self) {
        self.unknown_types.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies every counter into a plain value
    ///
    /// Counters are read one at a time, so a snapshot taken under load may
    /// mix values from slightly different instants.
    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unknown_types: self.unknown_types.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for MonitorSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "conn active={} accepted={} rejected={} | in {} frames/{} B | out {} frames/{} B | malformed={} unknown={}",
            self.active,
            self.accepted,
            self.rejected,
            self.frames_in,
            self.bytes_in,
            self.frames_out,
            self.bytes_out,
            self.malformed,
            self.unknown_types
        )
    }
}
