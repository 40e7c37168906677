//! Asynchronous trace events.

use ptflow_codec::ExecMode;

/// Kind and payload of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Tracing has been enabled at `ip`
    Enabled { ip: u64 },
    /// Tracing has been disabled; `ip` is the last IP in the traced range
    Disabled { ip: u64 },
    /// Tracing has been disabled asynchronously at `at`
    AsyncDisabled { at: u64, ip: u64 },
    /// An asynchronous branch, e.g. an interrupt, from `from` to `to`
    AsyncBranch { from: u64, to: u64 },
    /// A synchronous paging change to `cr3`
    Paging { cr3: u64 },
    /// An asynchronous paging change to `cr3` at `ip`
    AsyncPaging { cr3: u64, ip: u64 },
    /// The trace overflowed; decoding resumes at `ip`
    Overflow { ip: u64 },
    /// The execution mode changed to `mode`, effective at `ip`
    ExecMode { mode: ExecMode, ip: u64 },
    /// The transaction state changed at `ip`
    Tsx {
        ip: u64,
        /// Executing transactionally
        speculative: bool,
        /// The transaction aborted
        aborted: bool,
    },
}

/// A trace event together with its delivery flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// The event describes decoder state at a synchronization point, not
    /// a state transition.
    pub status_update: bool,
    /// The event's IP payload has been suppressed and is not valid.
    pub ip_suppressed: bool,
    /// The timestamp at which the event became available, when a TSC was
    /// known.
    pub tsc: Option<u64>,
}

impl Event {
    #[must_use]
    pub(crate) const fn new(kind: EventKind) -> Self {
        Self {
            kind,
            status_update: false,
            ip_suppressed: false,
            tsc: None,
        }
    }

    #[must_use]
    pub(crate) const fn status_update(kind: EventKind) -> Self {
        Self {
            kind,
            status_update: true,
            ip_suppressed: false,
            tsc: None,
        }
    }
}
