//! Bit-exact codec and packet-level decoder for the Intel PT wire format.
//!
//! This crate is the bottom layer of the decoding pipeline. It knows the
//! packet grammar and nothing else: [`PacketDecoder`] turns a raw trace
//! buffer into a stream of [`Packet`] values, [`Encoder`] writes packets
//! back out byte-for-byte, and the synchronization routines locate packet
//! stream boundaries so decoding can start anywhere inside a capture.
//!
//! Higher layers build on this one: the query decoder interprets the
//! packet stream, the instruction-flow decoder reconstructs executed
//! instructions against a traced memory image.

#![cfg_attr(not(test), no_std)]

mod config;
mod decoder;
pub mod error;
pub mod packet;
mod sync;
mod version;

pub use config::{Config, Cpu, CpuVendor, DecodeUnknown, Errata, NoUnknown};
pub use decoder::{Checkpoint, PacketDecoder};
pub use error::{Error, Result};
pub use packet::{
    Cbr, Encoder, ExecMode, IpCompression, ModeExec, ModeTsx, PSB_MAGIC, Packet, Pip, TargetIp,
    Tnt, Tsc, Unknown, sign_extend_48,
};
pub use version::{Version, version};
