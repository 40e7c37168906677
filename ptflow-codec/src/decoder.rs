//! Cursor-based sequential packet reader with boundary synchronization.

use crate::{
    config::{Config, DecodeUnknown, NoUnknown},
    error::{Error, Result},
    packet::{self, Packet, Unknown, size},
    sync,
};

/// Saved cursor state of a [`PacketDecoder`].
///
/// Lets embedding decoders make a sequence of reads transactional:
/// take a checkpoint, read ahead, and restore on failure.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    pos: usize,
    sync: Option<usize>,
}

/// Sequential packet decoder over a configuration's trace buffer.
///
/// The decoder must be synchronized onto a packet stream boundary before
/// packets can be read. Failed reads leave the cursor unchanged.
#[derive(Debug)]
pub struct PacketDecoder<'a, U = NoUnknown> {
    config: Config<'a, U>,
    /// Cursor into the trace buffer
    pos: usize,
    /// Offset of the last synchronization point
    sync: Option<usize>,
    /// Packet decoded at `pos`, kept until the cursor moves
    peeked: Option<(usize, Packet<'a>)>,
}

impl<'a, U: DecodeUnknown> PacketDecoder<'a, U> {
    #[must_use]
    pub fn new(config: Config<'a, U>) -> Self {
        Self {
            config,
            pos: 0,
            sync: None,
            peeked: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config<'a, U> {
        &self.config
    }

    /// The current cursor offset.
    pub fn offset(&self) -> Result<u64> {
        if self.sync.is_none() {
            return Err(Error::Nosync);
        }
        Ok(self.pos as u64)
    }

    /// The offset of the last synchronization point.
    pub fn sync_offset(&self) -> Result<u64> {
        self.sync.map(|sync| sync as u64).ok_or(Error::Nosync)
    }

    /// Synchronize onto the next packet stream boundary.
    ///
    /// The search starts at the beginning of the trace buffer when the
    /// decoder has not been synchronized yet, and behind the previous
    /// synchronization point otherwise. [`Error::Eos`] when no further
    /// boundary exists.
    pub fn sync_forward(&mut self) -> Result<u64> {
        let buf = self.config.buffer();
        let (from, floor) = match self.sync {
            Some(sync) => {
                let behind = sync + size::PSB;
                (self.pos.max(behind), behind)
            }
            None => (0, 0),
        };
        let found = sync::find_forward(buf, from, floor).ok_or(Error::Eos)?;
        self.resync(found);
        Ok(found as u64)
    }

    /// Synchronize onto the previous packet stream boundary.
    pub fn sync_backward(&mut self) -> Result<u64> {
        let buf = self.config.buffer();
        let limit = self.sync.unwrap_or(buf.len().saturating_add(1));
        let found = sync::find_backward(buf, limit).ok_or(Error::Eos)?;
        self.resync(found);
        Ok(found as u64)
    }

    /// Synchronize onto the packet stream boundary at `offset`.
    ///
    /// [`Error::Eos`] when `offset` lies outside the trace buffer,
    /// [`Error::Nosync`] when there is no boundary at `offset`.
    pub fn sync_set(&mut self, offset: u64) -> Result<()> {
        let buf = self.config.buffer();
        let offset = usize::try_from(offset).map_err(|_| Error::Eos)?;
        if offset > buf.len() {
            return Err(Error::Eos);
        }
        if buf.get(offset..offset + size::PSB) != Some(&packet::PSB_MAGIC) {
            return Err(Error::Nosync);
        }
        self.resync(offset);
        Ok(())
    }

    fn resync(&mut self, offset: usize) {
        self.pos = offset;
        self.sync = Some(offset);
        self.peeked = None;
    }

    /// Decode the packet at the cursor without consuming it.
    pub fn peek(&mut self) -> Result<Packet<'a>> {
        if self.sync.is_none() {
            return Err(Error::Nosync);
        }
        if let Some((at, packet)) = self.peeked
            && at == self.pos
        {
            return Ok(packet);
        }
        let packet = match packet::decode::parse(self.config.buffer(), self.pos) {
            Ok(packet) => packet,
            // Unknown opcodes may be recovered by the configured decoder.
            Err(Error::BadOpc) => {
                let pos = self.pos;
                let unknown_size = self.config.decode_unknown(pos)?;
                Packet::Unknown(Unknown {
                    bytes: &self.config.buffer()[pos..pos + unknown_size],
                })
            }
            Err(error) => return Err(error),
        };
        self.peeked = Some((self.pos, packet));
        Ok(packet)
    }

    /// Advance the cursor over a packet returned by
    /// [`peek`][Self::peek].
    pub fn consume(&mut self, packet: &Packet<'a>) {
        log::trace!("packet at {:#x}: {packet:x?}", self.pos);
        if matches!(packet, Packet::Psb) {
            self.sync = Some(self.pos);
        }
        self.pos += packet.size();
        self.peeked = None;
    }

    /// Decode one packet at the cursor and advance behind it.
    ///
    /// Failure leaves the cursor unchanged.
    pub fn next(&mut self) -> Result<Packet<'a>> {
        let packet = self.peek()?;
        self.consume(&packet);
        Ok(packet)
    }

    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            pos: self.pos,
            sync: self.sync,
        }
    }

    pub fn restore(&mut self, checkpoint: Checkpoint) {
        if self.pos != checkpoint.pos {
            self.peeked = None;
        }
        self.pos = checkpoint.pos;
        self.sync = checkpoint.sync;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PSB_MAGIC, Tnt};

    fn psb_trace(tail: &[u8]) -> Vec<u8> {
        let mut buf = PSB_MAGIC.to_vec();
        buf.extend_from_slice(&[0x02, 0x23]);
        buf.extend_from_slice(tail);
        buf
    }

    #[test]
    fn empty_trace_has_no_sync_point() {
        let mut decoder = PacketDecoder::new(Config::new(&[]));
        assert_eq!(decoder.sync_forward(), Err(Error::Eos));
        assert_eq!(decoder.next(), Err(Error::Nosync));
    }

    #[test]
    fn reads_psb_and_psbend_in_order() {
        let buf = psb_trace(&[]);
        let mut decoder = PacketDecoder::new(Config::new(&buf));
        assert_eq!(decoder.sync_forward(), Ok(0));
        assert_eq!(decoder.next(), Ok(Packet::Psb));
        assert_eq!(decoder.next(), Ok(Packet::PsbEnd));
        assert_eq!(decoder.next(), Err(Error::Eos));
        // The failed read did not move the cursor.
        assert_eq!(decoder.offset(), Ok(buf.len() as u64));
    }

    #[test]
    fn sync_set_requires_a_boundary() {
        let mut buf = vec![0u8; 4];
        buf.extend_from_slice(&PSB_MAGIC);
        let mut decoder = PacketDecoder::new(Config::new(&buf));
        assert_eq!(decoder.sync_set(0), Err(Error::Nosync));
        assert_eq!(decoder.sync_set(100), Err(Error::Eos));
        assert_eq!(decoder.sync_set(4), Ok(()));
        assert_eq!(decoder.sync_offset(), Ok(4));
        assert_eq!(decoder.next(), Ok(Packet::Psb));
    }

    #[test]
    fn forward_sync_makes_progress() {
        let mut buf = psb_trace(&[0x00]);
        buf.extend_from_slice(&psb_trace(&[]));
        let mut decoder = PacketDecoder::new(Config::new(&buf));
        assert_eq!(decoder.sync_forward(), Ok(0));
        assert_eq!(decoder.sync_forward(), Ok(19));
        assert_eq!(decoder.sync_forward(), Err(Error::Eos));
    }

    #[test]
    fn backward_sync_finds_previous_boundary() {
        let mut buf = psb_trace(&[0x00]);
        buf.extend_from_slice(&psb_trace(&[]));
        let mut decoder = PacketDecoder::new(Config::new(&buf));
        assert_eq!(decoder.sync_backward(), Ok(19));
        assert_eq!(decoder.sync_backward(), Ok(0));
        assert_eq!(decoder.sync_backward(), Err(Error::Eos));
    }

    #[test]
    fn mid_stream_psb_updates_sync_offset() {
        let mut buf = psb_trace(&[0x00]);
        let second = buf.len();
        buf.extend_from_slice(&psb_trace(&[]));
        let mut decoder = PacketDecoder::new(Config::new(&buf));
        decoder.sync_forward().unwrap();
        for _ in 0..3 {
            decoder.next().unwrap();
        }
        assert_eq!(decoder.next(), Ok(Packet::Psb));
        assert_eq!(decoder.sync_offset(), Ok(second as u64));
    }

    #[test]
    fn unknown_opcode_without_decoder() {
        let buf = psb_trace(&[0xd9, 0x00, 0x00]);
        let mut decoder = PacketDecoder::new(Config::new(&buf));
        decoder.sync_forward().unwrap();
        decoder.next().unwrap();
        decoder.next().unwrap();
        assert_eq!(decoder.next(), Err(Error::BadOpc));
    }

    #[test]
    fn unknown_opcode_with_decoder() {
        struct SkipThree;
        impl DecodeUnknown for SkipThree {
            fn decode_unknown(&mut self, _buf: &[u8], _pos: usize) -> Result<usize> {
                Ok(3)
            }
        }

        let buf = psb_trace(&[0xd9, 0xaa, 0xbb, 0x00]);
        let config = Config::new(&buf).with_unknown_decoder(SkipThree);
        let mut decoder = PacketDecoder::new(config);
        decoder.sync_forward().unwrap();
        decoder.next().unwrap();
        decoder.next().unwrap();
        let packet = decoder.next().unwrap();
        assert!(
            matches!(packet, Packet::Unknown(unknown) if unknown.bytes == [0xd9, 0xaa, 0xbb])
        );
        assert_eq!(decoder.next(), Ok(Packet::Pad));
    }

    #[test]
    fn unknown_decoder_size_is_validated() {
        struct TooFar;
        impl DecodeUnknown for TooFar {
            fn decode_unknown(&mut self, _buf: &[u8], _pos: usize) -> Result<usize> {
                Ok(100)
            }
        }

        let buf = psb_trace(&[0xd9]);
        let config = Config::new(&buf).with_unknown_decoder(TooFar);
        let mut decoder = PacketDecoder::new(config);
        decoder.sync_forward().unwrap();
        decoder.next().unwrap();
        decoder.next().unwrap();
        assert_eq!(decoder.next(), Err(Error::BadPacket));
    }

    #[test]
    fn decoded_sizes_match_the_size_table() {
        let tnt = Packet::Tnt8(Tnt {
            bits: 0b101,
            count: 3,
        });
        let expectations = [
            (Packet::Pad, size::PAD),
            (tnt, size::TNT8),
            (Packet::Psb, size::PSB),
            (Packet::PsbEnd, size::PSBEND),
            (Packet::Ovf, size::OVF),
        ];
        for (packet, expected) in expectations {
            assert_eq!(packet.size(), expected);
        }
    }
}
