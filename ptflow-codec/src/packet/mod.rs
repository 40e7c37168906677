//! Packet representation of the trace wire format.
//!
//! Every packet kind of the supported grammar has one variant in
//! [`Packet`]. Decoding and encoding are bit-exact inverses: any legal
//! packet round-trips byte-for-byte.

use derive_more::Display;

use crate::error::{Error, Result};

pub(crate) mod decode;
mod encode;

pub use encode::Encoder;

pub(crate) mod opcode {
    //! First-level opcodes and second-level (`0x02`-escaped) opcodes.

    pub const PAD: u8 = 0x00;
    pub const EXT: u8 = 0x02;
    pub const TSC: u8 = 0x19;
    pub const MODE: u8 = 0x99;

    /// Mask selecting the opcode bits of the TIP packet family; the upper
    /// three bits carry the IP compression.
    pub const IP_MASK: u8 = 0x1f;
    pub const TIP: u8 = 0x0d;
    pub const TIP_PGE: u8 = 0x11;
    pub const TIP_PGD: u8 = 0x01;
    pub const FUP: u8 = 0x1d;

    pub const EXT_PSB: u8 = 0x82;
    pub const EXT_PSBEND: u8 = 0x23;
    pub const EXT_OVF: u8 = 0xf3;
    pub const EXT_CBR: u8 = 0x03;
    pub const EXT_PIP: u8 = 0x43;
    pub const EXT_TNT64: u8 = 0xa3;
}

/// Encoded packet sizes in bytes, header included.
///
/// TIP-family packets add the payload width of their IP compression to
/// [`size::IP_HEAD`].
pub mod size {
    pub const PAD: usize = 1;
    pub const TNT8: usize = 1;
    pub const IP_HEAD: usize = 1;
    pub const MODE: usize = 2;
    pub const TSC: usize = 8;
    pub const PSB: usize = 16;
    pub const PSBEND: usize = 2;
    pub const OVF: usize = 2;
    pub const PIP: usize = 8;
    pub const TNT64: usize = 8;
    pub const CBR: usize = 4;
}

/// The 16-byte packet stream boundary pattern.
pub const PSB_MAGIC: [u8; size::PSB] = [
    0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82,
];

/// Sign-extends a 48-bit value to a full 64-bit.
#[must_use]
pub const fn sign_extend_48(value: u64) -> u64 {
    ((value << 16) as i64 >> 16) as u64
}

/// IP compression of a TIP-family packet.
///
/// The compression is carried in the upper three opcode bits and dictates
/// the payload width and the last-IP update rule.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum IpCompression {
    /// No payload, the IP is out of context
    Suppressed,
    /// Payload\[15:0\] replaces the low 16 bits of the last IP
    Update16,
    /// Payload\[31:0\] replaces the low 32 bits of the last IP
    Update32,
    /// Payload\[47:0\], sign-extended, replaces the last IP entirely
    Sext48,
}

impl IpCompression {
    #[must_use]
    pub(crate) const fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0b000 => Self::Suppressed,
            0b001 => Self::Update16,
            0b010 => Self::Update32,
            0b011 => Self::Sext48,
            _ => return None,
        })
    }

    #[must_use]
    pub(crate) const fn bits(self) -> u8 {
        match self {
            Self::Suppressed => 0b000,
            Self::Update16 => 0b001,
            Self::Update32 => 0b010,
            Self::Sext48 => 0b011,
        }
    }

    /// Payload width in bytes.
    #[must_use]
    pub const fn payload_len(self) -> usize {
        match self {
            Self::Suppressed => 0,
            Self::Update16 => 2,
            Self::Update32 => 4,
            Self::Sext48 => 6,
        }
    }
}

/// Payload of the TIP packet family (TIP, TIP.PGE, TIP.PGD, FUP).
///
/// `ip` holds the raw, right-zero-extended payload; the full 64-bit IP
/// only exists after [`apply`][Self::apply]-ing the compression to a
/// prior last IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetIp {
    pub compression: IpCompression,
    pub ip: u64,
}

impl TargetIp {
    #[must_use]
    pub const fn suppressed() -> Self {
        Self {
            compression: IpCompression::Suppressed,
            ip: 0,
        }
    }

    /// Apply the compression to the prior IP `last`.
    ///
    /// Returns `None` when the compression is [`IpCompression::Suppressed`],
    /// the prior IP is then left untouched by the caller.
    #[must_use]
    pub const fn apply(&self, last: u64) -> Option<u64> {
        Some(match self.compression {
            IpCompression::Suppressed => return None,
            IpCompression::Update16 => (last & 0xffff_ffff_ffff_0000) | (self.ip & 0xffff),
            IpCompression::Update32 => (last & 0xffff_ffff_0000_0000) | (self.ip & 0xffff_ffff),
            IpCompression::Sext48 => sign_extend_48(self.ip),
        })
    }

    /// The narrowest compression that reconstructs `ip` from `last`.
    ///
    /// [`Error::BadPacket`] when `ip` cannot be represented, i.e. when it
    /// is not the sign extension of a 48-bit address and differs from
    /// `last` above bit 31.
    pub fn narrowest(ip: u64, last: u64) -> Result<Self> {
        let packet = if (last & 0xffff_ffff_ffff_0000) | (ip & 0xffff) == ip {
            Self {
                compression: IpCompression::Update16,
                ip: ip & 0xffff,
            }
        } else if (last & 0xffff_ffff_0000_0000) | (ip & 0xffff_ffff) == ip {
            Self {
                compression: IpCompression::Update32,
                ip: ip & 0xffff_ffff,
            }
        } else if sign_extend_48(ip & 0xffff_ffff_ffff) == ip {
            Self {
                compression: IpCompression::Sext48,
                ip: ip & 0xffff_ffff_ffff,
            }
        } else {
            return Err(Error::BadPacket);
        };
        Ok(packet)
    }

    /// Check that the raw payload fits the compression's width.
    pub(crate) const fn check(&self) -> Result<()> {
        let width = self.compression.payload_len() * 8;
        if width < 64 && self.ip >> width != 0 {
            return Err(Error::BadPacket);
        }
        Ok(())
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        size::IP_HEAD + self.compression.payload_len()
    }
}

/// Taken/not-taken payload with the stop bit stripped.
///
/// Bit `count - 1` of `bits` is the oldest outcome. Short TNT packets
/// carry up to 6 outcomes, long ones up to 47.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tnt {
    pub bits: u64,
    pub count: u8,
}

impl Tnt {
    pub const MAX_SHORT: u8 = 6;
    pub const MAX_LONG: u8 = 47;

    /// Split a stop-bit-delimited field into payload and count.
    ///
    /// `field` must be non-zero; the topmost set bit is the stop bit.
    pub(crate) const fn from_field(field: u64) -> Self {
        debug_assert!(field != 0);
        let count = 63 - field.leading_zeros() as u8;
        Self {
            bits: field & !(1 << count),
            count,
        }
    }

    /// The payload with the stop bit reinserted above the outcomes.
    pub(crate) const fn to_field(self) -> u64 {
        (1 << self.count) | self.bits
    }

    pub(crate) const fn check(&self, max: u8) -> Result<()> {
        if self.count == 0 || self.count > max || self.bits >> self.count != 0 {
            return Err(Error::BadPacket);
        }
        Ok(())
    }
}

/// Execution mode of the traced program
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// 16-bit mode
    Mode16,
    /// 32-bit mode
    Mode32,
    /// 64-bit mode
    Mode64,
    /// The mode has not been determined yet
    Unknown,
}

impl ExecMode {
    /// Get the bitness of the execution mode; unknown defaults to 64-bit.
    #[must_use]
    pub const fn bitness(self) -> u32 {
        match self {
            Self::Mode16 => 16,
            Self::Mode32 => 32,
            Self::Mode64 | Self::Unknown => 64,
        }
    }
}

/// MODE.Exec leaf: the CS.L and CS.D bits at the time of the mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeExec {
    pub csl: bool,
    pub csd: bool,
}

impl ModeExec {
    #[must_use]
    pub const fn from_mode(mode: ExecMode) -> Self {
        match mode {
            ExecMode::Mode64 => Self {
                csl: true,
                csd: false,
            },
            ExecMode::Mode32 => Self {
                csl: false,
                csd: true,
            },
            ExecMode::Mode16 | ExecMode::Unknown => Self {
                csl: false,
                csd: false,
            },
        }
    }

    #[must_use]
    pub const fn exec_mode(&self) -> ExecMode {
        match (self.csl, self.csd) {
            (false, false) => ExecMode::Mode16,
            (true, false) => ExecMode::Mode64,
            (false, true) => ExecMode::Mode32,
            (true, true) => ExecMode::Unknown,
        }
    }
}

/// MODE.TSX leaf: transaction state at the time of the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTsx {
    /// Executing transactionally
    pub intx: bool,
    /// The transaction aborted
    pub abrt: bool,
}

/// Paging information: the new CR3 with the low five bits clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pip {
    pub cr3: u64,
}

/// Timestamp counter, low seven bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tsc {
    pub tsc: u64,
}

/// Core:bus ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cbr {
    pub ratio: u8,
}

/// A packet outside the known grammar, sized by the configured
/// unknown-packet decoder. The bytes borrow the trace buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unknown<'a> {
    pub bytes: &'a [u8],
}

/// One decoded trace packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Packet<'a> {
    Pad,
    /// Short taken/not-taken packet, up to 6 outcomes
    Tnt8(Tnt),
    /// Long taken/not-taken packet, up to 47 outcomes
    Tnt64(Tnt),
    /// Target IP of an indirect branch
    Tip(TargetIp),
    /// Packet generation enable
    TipPge(TargetIp),
    /// Packet generation disable
    TipPgd(TargetIp),
    /// Flow update, the source IP of an asynchronous event
    Fup(TargetIp),
    ModeExec(ModeExec),
    ModeTsx(ModeTsx),
    Pip(Pip),
    Tsc(Tsc),
    Cbr(Cbr),
    /// Packet stream boundary
    Psb,
    PsbEnd,
    /// Internal buffer overflow, packets were lost
    Ovf,
    Unknown(Unknown<'a>),
}

impl Packet<'_> {
    /// The encoded size of this packet in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            Packet::Pad => size::PAD,
            Packet::Tnt8(_) => size::TNT8,
            Packet::Tnt64(_) => size::TNT64,
            Packet::Tip(ip) | Packet::TipPge(ip) | Packet::TipPgd(ip) | Packet::Fup(ip) => {
                ip.size()
            }
            Packet::ModeExec(_) | Packet::ModeTsx(_) => size::MODE,
            Packet::Pip(_) => size::PIP,
            Packet::Tsc(_) => size::TSC,
            Packet::Cbr(_) => size::CBR,
            Packet::Psb => size::PSB,
            Packet::PsbEnd => size::PSBEND,
            Packet::Ovf => size::OVF,
            Packet::Unknown(unknown) => unknown.bytes.len(),
        }
    }
}
