//! Bit-exact serialization of packets at a byte cursor.

use crate::{
    error::{Error, Result},
    packet::{IpCompression, ModeExec, ModeTsx, Packet, PSB_MAGIC, TargetIp, Tnt, opcode},
};

/// Packet encoder over a mutable trace buffer.
///
/// `next` serializes one packet at the cursor and advances it by the
/// encoded size. The cursor can be hard-positioned with
/// [`sync_set`][Self::sync_set]; unlike the decoder, no packet stream
/// boundary is required at the target offset.
#[derive(Debug)]
pub struct Encoder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Encoder<'a> {
    #[must_use]
    pub const fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Hard-position the cursor at `offset`.
    pub const fn sync_set(&mut self, offset: usize) -> Result<()> {
        if offset > self.buf.len() {
            return Err(Error::Eos);
        }
        self.pos = offset;
        Ok(())
    }

    #[must_use]
    pub const fn offset(&self) -> usize {
        self.pos
    }

    /// Serialize `packet` at the cursor.
    ///
    /// On success, returns the number of bytes written and advances the
    /// cursor. [`Error::BadOpc`] for packets that have no encoding
    /// (unknown packets), [`Error::BadPacket`] for payloads violating
    /// their packet's shape, [`Error::Eos`] when the packet does not fit
    /// the remaining buffer. Failure leaves the cursor and buffer
    /// untouched.
    pub fn next(&mut self, packet: &Packet<'_>) -> Result<usize> {
        let size = packet.size();
        let Some(out) = self
            .buf
            .get_mut(self.pos..)
            .and_then(|rest| rest.get_mut(..size))
        else {
            return Err(Error::Eos);
        };

        match packet {
            Packet::Pad => out[0] = opcode::PAD,
            Packet::Tnt8(tnt) => {
                tnt.check(Tnt::MAX_SHORT)?;
                out[0] = (tnt.to_field() << 1) as u8;
            }
            Packet::Tnt64(tnt) => {
                tnt.check(Tnt::MAX_LONG)?;
                out[0] = opcode::EXT;
                out[1] = opcode::EXT_TNT64;
                out[2..8].copy_from_slice(&tnt.to_field().to_le_bytes()[..6]);
            }
            Packet::Tip(ip) => encode_target_ip(out, opcode::TIP, ip)?,
            Packet::TipPge(ip) => encode_target_ip(out, opcode::TIP_PGE, ip)?,
            Packet::TipPgd(ip) => encode_target_ip(out, opcode::TIP_PGD, ip)?,
            Packet::Fup(ip) => encode_target_ip(out, opcode::FUP, ip)?,
            Packet::ModeExec(mode) => {
                out[0] = opcode::MODE;
                out[1] = encode_mode_exec(mode);
            }
            Packet::ModeTsx(mode) => {
                out[0] = opcode::MODE;
                out[1] = encode_mode_tsx(mode);
            }
            Packet::Pip(pip) => {
                if pip.cr3 & 0x1f != 0 || (pip.cr3 >> 5) >> 47 != 0 {
                    return Err(Error::BadPacket);
                }
                let payload = (pip.cr3 >> 5) << 1;
                out[0] = opcode::EXT;
                out[1] = opcode::EXT_PIP;
                out[2..8].copy_from_slice(&payload.to_le_bytes()[..6]);
            }
            Packet::Tsc(tsc) => {
                if tsc.tsc >> 56 != 0 {
                    return Err(Error::BadPacket);
                }
                out[0] = opcode::TSC;
                out[1..8].copy_from_slice(&tsc.tsc.to_le_bytes()[..7]);
            }
            Packet::Cbr(cbr) => {
                out[0] = opcode::EXT;
                out[1] = opcode::EXT_CBR;
                out[2] = cbr.ratio;
                out[3] = 0;
            }
            Packet::Psb => out.copy_from_slice(&PSB_MAGIC),
            Packet::PsbEnd => {
                out[0] = opcode::EXT;
                out[1] = opcode::EXT_PSBEND;
            }
            Packet::Ovf => {
                out[0] = opcode::EXT;
                out[1] = opcode::EXT_OVF;
            }
            Packet::Unknown(_) => return Err(Error::BadOpc),
        }

        self.pos += size;
        Ok(size)
    }
}

fn encode_target_ip(out: &mut [u8], op: u8, ip: &TargetIp) -> Result<()> {
    ip.check()?;
    out[0] = op | (ip.compression.bits() << 5);
    let payload = ip.ip.to_le_bytes();
    match ip.compression {
        IpCompression::Suppressed => {}
        IpCompression::Update16 => out[1..3].copy_from_slice(&payload[..2]),
        IpCompression::Update32 => out[1..5].copy_from_slice(&payload[..4]),
        IpCompression::Sext48 => out[1..7].copy_from_slice(&payload[..6]),
    }
    Ok(())
}

const fn encode_mode_exec(mode: &ModeExec) -> u8 {
    (mode.csl as u8) | ((mode.csd as u8) << 1)
}

const fn encode_mode_tsx(mode: &ModeTsx) -> u8 {
    0b0010_0000 | (mode.intx as u8) | ((mode.abrt as u8) << 1)
}
