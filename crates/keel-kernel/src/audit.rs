//! Kernel audit log
//!
//! Records security-relevant kernel decisions: thread lifecycle, capability
//! delegation, IPC and cancellation, interrupt forwarding and faults. This is
//! separate from the `log` facade output; the audit log is structured and can
//! be queried or serialized by a supervisor.

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use keel_kernel_core::{Badge, CapId, DomainId, JobId, Priority};

/// Monotonic audit event number
pub type EventId = u64;

/// One audited kernel decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID (monotonic)
    pub id: EventId,
    /// Time of the core that caused the event (microseconds)
    pub timestamp: u64,
    pub kind: AuditKind,
}

/// What happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    DomainCreated {
        domain: DomainId,
        quota_ceiling: u64,
    },
    ThreadCreated {
        job: JobId,
        domain: DomainId,
        priority: Priority,
        quota: u64,
    },
    ThreadKilled {
        job: JobId,
    },
    Scheduled {
        cpu: usize,
        job: JobId,
        quota: u64,
    },
    AffinityChanged {
        job: JobId,
        from: usize,
        to: usize,
    },
    IpcCall {
        client: JobId,
        server: JobId,
    },
    IpcRequest {
        server: JobId,
        badge: Badge,
    },
    IpcReply {
        server: JobId,
        client: JobId,
    },
    /// A blocked operation was cancelled
    IpcCancelled {
        job: JobId,
    },
    CapDelegated {
        from: DomainId,
        to: DomainId,
        id: CapId,
    },
    /// A capability could not be placed in the receiving space
    CapRejected {
        domain: DomainId,
        id: CapId,
    },
    MetadataUpgraded {
        domain: DomainId,
        slots: usize,
    },
    IrqForwarded {
        irq: u32,
        handler: JobId,
    },
    Exception {
        job: JobId,
        ip: u64,
        handler: Option<JobId>,
    },
    VmExit {
        vcpu: JobId,
        resumed: bool,
    },
}

/// Maximum number of events kept in memory
pub const MAX_AUDIT_EVENTS: usize = 4096;

/// Append-only audit log with bounded memory.
pub struct AuditLog {
    events: Vec<AuditEvent>,
    next_id: EventId,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            next_id: 0,
        }
    }

    /// Record an event, returning its ID.
    pub fn record(&mut self, timestamp: u64, kind: AuditKind) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        self.events.push(AuditEvent {
            id,
            timestamp,
            kind,
        });
        self.trim_if_needed();
        id
    }

    /// Get all retained events.
    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    /// Get the most recent N events, newest first.
    pub fn recent(&self, count: usize) -> Vec<&AuditEvent> {
        self.events.iter().rev().take(count).collect()
    }

    /// Retained events matching `pred`, oldest first.
    pub fn filter(&self, pred: impl Fn(&AuditKind) -> bool) -> Vec<&AuditEvent> {
        self.events.iter().filter(|e| pred(&e.kind)).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn next_id(&self) -> EventId {
        self.next_id
    }

    fn trim_if_needed(&mut self) {
        if self.events.len() > MAX_AUDIT_EVENTS {
            let drain_count = self.events.len() - MAX_AUDIT_EVENTS;
            self.events.drain(0..drain_count);
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_log_creation() {
        let log = AuditLog::new();
        assert!(log.is_empty());
        assert_eq!(log.next_id(), 0);
    }

    #[test]
    fn test_audit_ids_are_monotonic() {
        let mut log = AuditLog::new();
        let a = log.record(10, AuditKind::ThreadKilled { job: JobId(1) });
        let b = log.record(20, AuditKind::IpcCancelled { job: JobId(2) });
        assert_eq!((a, b), (0, 1));
        assert_eq!(log.recent(1)[0].kind, AuditKind::IpcCancelled { job: JobId(2) });
    }

    #[test]
    fn test_audit_trim() {
        let mut log = AuditLog::new();
        for i in 0..(MAX_AUDIT_EVENTS as u64 + 10) {
            log.record(i, AuditKind::ThreadKilled { job: JobId(i) });
        }
        assert_eq!(log.len(), MAX_AUDIT_EVENTS);
        // Oldest events were dropped
        assert_eq!(log.events()[0].id, 10);
    }

    #[test]
    fn test_audit_filter() {
        let mut log = AuditLog::new();
        log.record(0, AuditKind::ThreadKilled { job: JobId(1) });
        log.record(0, AuditKind::IpcCancelled { job: JobId(1) });
        log.record(0, AuditKind::ThreadKilled { job: JobId(2) });
        let kills = log.filter(|k| matches!(k, AuditKind::ThreadKilled { .. }));
        assert_eq!(kills.len(), 2);
    }

    #[test]
    fn test_audit_event_serializes() {
        let mut log = AuditLog::new();
        log.record(
            5,
            AuditKind::IpcRequest {
                server: JobId(3),
                badge: Badge(9),
            },
        );
        let json = serde_json::to_string(&log.events()[0]).unwrap();
        assert!(json.contains("IpcRequest"));
        let back: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, log.events()[0]);
    }
}
