//! Decoder configuration: the trace buffer, the CPU the trace was
//! recorded on, and the errata workarounds derived from it.

use crate::error::{Error, Result};

/// Processor vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CpuVendor {
    Intel,
    Unknown,
}

/// Identity of the processor the trace was recorded on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cpu {
    pub vendor: CpuVendor,
    pub family: u16,
    pub model: u8,
    pub stepping: u8,
}

impl Cpu {
    #[must_use]
    pub const fn new(vendor: CpuVendor, family: u16, model: u8, stepping: u8) -> Self {
        Self {
            vendor,
            family,
            model,
            stepping,
        }
    }

    /// Errata workarounds that apply to this processor.
    ///
    /// The model list follows Intel's specification updates. Unknown
    /// models get an empty set, decoding then trusts the stream as-is.
    #[must_use]
    pub const fn errata(&self) -> Errata {
        let mut errata = Errata::none();

        if matches!(self.vendor, CpuVendor::Intel) && self.family == 0x6 {
            match self.model {
                // Broadwell
                0x3d | 0x47 | 0x4f | 0x56 => {
                    errata.bdm70 = true;
                    errata.bdm64 = true;
                }
                // Skylake, Kaby Lake, Comet Lake
                0x4e | 0x5e | 0x8e | 0x9e | 0xa5 | 0xa6 => {
                    errata.bdm70 = true;
                }
                // Skylake-X, Ice Lake-SP
                0x55 | 0x6a | 0x6c => {
                    errata.bdm70 = true;
                }
                // Ice Lake, Tiger Lake, Rocket Lake
                0x66 | 0x7d | 0x7e | 0x8c | 0x8d | 0xa7 | 0xa8 => {
                    errata.bdm70 = true;
                }
                _ => {}
            }
        }

        errata
    }
}

/// Single-bit errata workaround flags.
///
/// The flags are normally derived from [`Cpu::errata`], but can be set
/// directly for traces recorded on unlisted steppings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Errata {
    /// BDM70: PSB+ packets may contain unexpected packets.
    ///
    /// A TIP.PGE may be preceded by a PSB+ that incorrectly includes FUP
    /// and MODE.Exec packets even though tracing is disabled.
    pub bdm70: bool,
    /// BDM64: an incorrect packet may be recorded following a
    /// transactional abort.
    ///
    /// An abort immediately after a branch may log a bogus branch target
    /// before the packet produced by the abort itself.
    pub bdm64: bool,
}

impl Errata {
    #[must_use]
    pub const fn none() -> Self {
        Self {
            bdm70: false,
            bdm64: false,
        }
    }
}

/// Decoder for packets with opcodes outside the known grammar.
///
/// Installed on a [`Config`], the decoder is consulted whenever a packet
/// with an unknown opcode is met, at any layer. It reports how many bytes
/// the packet occupies so decoding can continue behind it; the bytes are
/// then surfaced as a [`Packet::Unknown`][crate::packet::Packet::Unknown].
///
/// Implementors hold whatever state they need; the trait replaces the
/// callback-plus-context-pointer pair of C decoder libraries.
pub trait DecodeUnknown {
    /// Decode the unknown packet starting at `buf[pos]`.
    ///
    /// On success, returns the packet size in bytes. A size of zero or one
    /// reaching past the end of `buf` is rejected by the caller.
    fn decode_unknown(&mut self, buf: &[u8], pos: usize) -> Result<usize>;
}

/// Placeholder for configurations without an unknown-packet decoder.
///
/// This type is uninhabited; a `Config<'a>` using it never invokes the
/// callback path.
#[derive(Debug, Clone, Copy)]
pub enum NoUnknown {}

impl DecodeUnknown for NoUnknown {
    fn decode_unknown(&mut self, _buf: &[u8], _pos: usize) -> Result<usize> {
        match *self {}
    }
}

/// Decoder configuration.
///
/// Immutable once a decoder has been constructed from it. The trace
/// buffer is borrowed for the lifetime of the configuration; an empty
/// buffer is legal.
#[derive(Debug, Clone)]
pub struct Config<'a, U = NoUnknown> {
    buffer: &'a [u8],
    cpu: Option<Cpu>,
    errata: Errata,
    unknown: Option<U>,
}

impl<'a> Config<'a> {
    #[must_use]
    pub const fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            cpu: None,
            errata: Errata::none(),
            unknown: None,
        }
    }
}

impl<'a, U: DecodeUnknown> Config<'a, U> {
    /// Record the CPU the trace comes from and enable its errata
    /// workarounds.
    #[must_use]
    pub const fn with_cpu(mut self, cpu: Cpu) -> Self {
        self.cpu = Some(cpu);
        self.errata = cpu.errata();
        self
    }

    /// Override the errata workaround flags.
    #[must_use]
    pub const fn with_errata(mut self, errata: Errata) -> Self {
        self.errata = errata;
        self
    }

    /// Install a decoder for packets with unknown opcodes.
    #[must_use]
    pub fn with_unknown_decoder<V: DecodeUnknown>(self, unknown: V) -> Config<'a, V> {
        Config {
            buffer: self.buffer,
            cpu: self.cpu,
            errata: self.errata,
            unknown: Some(unknown),
        }
    }

    #[must_use]
    pub const fn buffer(&self) -> &'a [u8] {
        self.buffer
    }

    #[must_use]
    pub const fn cpu(&self) -> Option<Cpu> {
        self.cpu
    }

    #[must_use]
    pub const fn errata(&self) -> Errata {
        self.errata
    }

    /// Run the unknown-packet decoder for the packet at `pos`.
    ///
    /// Returns the packet size. [`Error::BadOpc`] when no decoder is
    /// installed or the installed decoder fails; [`Error::BadPacket`]
    /// when the reported size is zero or reaches past the buffer.
    pub(crate) fn decode_unknown(&mut self, pos: usize) -> Result<usize> {
        let Some(unknown) = self.unknown.as_mut() else {
            return Err(Error::BadOpc);
        };
        // A failing recovery surfaces the original error.
        let Ok(size) = unknown.decode_unknown(self.buffer, pos) else {
            return Err(Error::BadOpc);
        };
        if size == 0 || pos.checked_add(size).is_none_or(|end| end > self.buffer.len()) {
            return Err(Error::BadPacket);
        }
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadwell_carries_both_errata() {
        let cpu = Cpu::new(CpuVendor::Intel, 0x6, 0x3d, 4);
        let errata = cpu.errata();
        assert!(errata.bdm70);
        assert!(errata.bdm64);
    }

    #[test]
    fn skylake_carries_bdm70_only() {
        let cpu = Cpu::new(CpuVendor::Intel, 0x6, 0x5e, 3);
        let errata = cpu.errata();
        assert!(errata.bdm70);
        assert!(!errata.bdm64);
    }

    #[test]
    fn unknown_vendor_has_no_errata() {
        let cpu = Cpu::new(CpuVendor::Unknown, 0x6, 0x3d, 4);
        assert_eq!(cpu.errata(), Errata::none());
    }

    #[test]
    fn config_derives_errata_from_cpu() {
        let config =
            Config::new(&[]).with_cpu(Cpu::new(CpuVendor::Intel, 0x6, 0x3d, 4));
        assert!(config.errata().bdm64);
    }
}
