//! Wire-format parsing of single packets.
//!
//! Opcodes come in two levels: most packets are selected by their first
//! byte, the extension escape `0x02` selects a second table keyed by the
//! following byte.

use crate::{
    error::{Error, Result},
    packet::{
        Cbr, IpCompression, ModeExec, ModeTsx, Packet, Pip, PSB_MAGIC, TargetIp, Tnt, Tsc, opcode,
        size,
    },
};

/// Parse one packet at `buf[pos]`.
///
/// Unknown opcodes surface as [`Error::BadOpc`]; the packet-level decoder
/// may recover them through the configured unknown-packet decoder.
/// Payloads reaching past the end of the buffer are [`Error::Eos`].
pub(crate) fn parse(buf: &[u8], pos: usize) -> Result<Packet<'_>> {
    let slice = buf.get(pos..).ok_or(Error::Eos)?;
    match slice {
        [] => Err(Error::Eos),
        [opcode::PAD, ..] => Ok(Packet::Pad),
        [opcode::EXT, ..] => parse_ext(slice),
        // Short TNT packets always end in a zero bit and carry a stop bit
        // at bit 2 or higher, so their first byte is even and >= 4.
        [head, ..] if head & 0x01 == 0 && *head >= 0x04 => {
            Ok(Packet::Tnt8(Tnt::from_field(u64::from(head >> 1))))
        }
        [head, rest @ ..] if head & opcode::IP_MASK == opcode::TIP => {
            Ok(Packet::Tip(parse_target_ip(*head, rest)?))
        }
        [head, rest @ ..] if head & opcode::IP_MASK == opcode::TIP_PGE => {
            Ok(Packet::TipPge(parse_target_ip(*head, rest)?))
        }
        [head, rest @ ..] if head & opcode::IP_MASK == opcode::TIP_PGD => {
            Ok(Packet::TipPgd(parse_target_ip(*head, rest)?))
        }
        [head, rest @ ..] if head & opcode::IP_MASK == opcode::FUP => {
            Ok(Packet::Fup(parse_target_ip(*head, rest)?))
        }
        [opcode::MODE] | [opcode::TSC] => Err(Error::Eos),
        [opcode::MODE, leaf, ..] => parse_mode(*leaf),
        [opcode::TSC, rest @ ..] => {
            let Some([b0, b1, b2, b3, b4, b5, b6]) = rest.first_chunk::<7>() else {
                return Err(Error::Eos);
            };
            let tsc = u64::from_le_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, 0]);
            Ok(Packet::Tsc(Tsc { tsc }))
        }
        _ => Err(Error::BadOpc),
    }
}

fn parse_ext(slice: &[u8]) -> Result<Packet<'_>> {
    match slice {
        [_] => Err(Error::Eos),
        [_, opcode::EXT_PSBEND, ..] => Ok(Packet::PsbEnd),
        [_, opcode::EXT_OVF, ..] => Ok(Packet::Ovf),
        [_, opcode::EXT_PSB, ..] => {
            let Some(magic) = slice.first_chunk::<{ size::PSB }>() else {
                return Err(Error::Eos);
            };
            if *magic != PSB_MAGIC {
                return Err(Error::BadPacket);
            }
            Ok(Packet::Psb)
        }
        [_, opcode::EXT_CBR, ..] => {
            if slice.len() < size::CBR {
                return Err(Error::Eos);
            }
            Ok(Packet::Cbr(Cbr { ratio: slice[2] }))
        }
        [_, opcode::EXT_PIP, b2, b3, b4, b5, b6, b7, ..] => {
            let payload = u64::from_le_bytes([*b2, *b3, *b4, *b5, *b6, *b7, 0, 0]);
            Ok(Packet::Pip(Pip {
                cr3: (payload >> 1) << 5,
            }))
        }
        [_, opcode::EXT_TNT64, b2, b3, b4, b5, b6, b7, ..] => {
            let field = u64::from_le_bytes([*b2, *b3, *b4, *b5, *b6, *b7, 0, 0]);
            if field == 0 {
                // A TNT payload must contain a stop bit.
                return Err(Error::BadPacket);
            }
            Ok(Packet::Tnt64(Tnt::from_field(field)))
        }
        [_, opcode::EXT_PIP | opcode::EXT_TNT64, ..] => Err(Error::Eos),
        _ => Err(Error::BadOpc),
    }
}

fn parse_target_ip(head: u8, rest: &[u8]) -> Result<TargetIp> {
    let Some(compression) = IpCompression::from_bits(head >> 5) else {
        return Err(Error::BadPacket);
    };
    let ip = match compression {
        IpCompression::Suppressed => 0,
        IpCompression::Update16 => {
            let bytes = rest.first_chunk::<2>().ok_or(Error::Eos)?;
            u64::from(u16::from_le_bytes(*bytes))
        }
        IpCompression::Update32 => {
            let bytes = rest.first_chunk::<4>().ok_or(Error::Eos)?;
            u64::from(u32::from_le_bytes(*bytes))
        }
        IpCompression::Sext48 => {
            let [b0, b1, b2, b3, b4, b5] = rest.first_chunk::<6>().ok_or(Error::Eos)?;
            u64::from_le_bytes([*b0, *b1, *b2, *b3, *b4, *b5, 0, 0])
        }
    };
    Ok(TargetIp { compression, ip })
}

fn parse_mode(leaf: u8) -> Result<Packet<'static>> {
    match leaf >> 5 {
        0b000 => Ok(Packet::ModeExec(ModeExec {
            csl: leaf & 0x01 != 0,
            csd: leaf & 0x02 != 0,
        })),
        0b001 => Ok(Packet::ModeTsx(ModeTsx {
            intx: leaf & 0x01 != 0,
            abrt: leaf & 0x02 != 0,
        })),
        _ => Err(Error::BadPacket),
    }
}
