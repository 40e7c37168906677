//! Streaming query decoder over an Intel PT packet stream.
//!
//! The query decoder is the middle layer of the decoding pipeline. It
//! consumes packets from a [`ptflow_codec::PacketDecoder`] and answers
//! the three questions an instruction-flow reconstruction needs:
//!
//! * was the next conditional branch taken ([`QueryDecoder::cond_branch`]),
//! * where did the next indirect branch go
//!   ([`QueryDecoder::indirect_branch`]),
//! * what asynchronous events occurred ([`QueryDecoder::event`]).
//!
//! Internally it maintains the compressed last-IP register, a cache of
//! taken/not-taken bits, and per-binding queues of pending events that
//! are completed by the packet their binding names.

#![cfg_attr(not(test), no_std)]

mod decoder;
mod event;
mod evq;
mod last_ip;
mod tnt;

pub use decoder::{Checkpoint, QueryDecoder, Status};
pub use event::{Event, EventKind};
pub use last_ip::LastIp;
pub use tnt::TntCache;
