//! Instruction-flow decoder for Intel PT traces.
//!
//! The top layer of the decoding pipeline: given a trace buffer and a
//! traced memory [`Image`], [`InsnDecoder`] emits one [`Insn`] record
//! per executed instruction, with trace events attached to the
//! instruction boundaries they belong to.

mod classify;
mod decoder;
mod image;
mod retstack;

pub use classify::InsnClass;
pub use decoder::{Insn, InsnDecoder, MAX_INSN_LEN};
pub use image::{Asid, Image, LoadCr3, NO_CR3, ReadMemory};
