//! The last-IP register.

use ptflow_codec::{Error, Result, TargetIp};

/// Compressed-IP tracking register.
///
/// TIP-family packets update the register through their IP compression;
/// the register stays untouched for suppressed IPs and is invalid until
/// the first update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LastIp {
    ip: u64,
    have_ip: bool,
}

impl LastIp {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ip: 0,
            have_ip: false,
        }
    }

    /// Follow the packet's IP compression to update the register.
    ///
    /// Returns the reconstructed IP, or `None` for a suppressed IP. When
    /// this returns `None` the target is out of context and the register
    /// is left untouched.
    pub const fn update(&mut self, packet: &TargetIp) -> Option<u64> {
        let Some(ip) = packet.apply(self.ip) else {
            return None;
        };
        self.ip = ip;
        self.have_ip = true;
        Some(ip)
    }

    /// The current IP; [`Error::Noip`] before the first update.
    pub const fn query(&self) -> Result<u64> {
        if self.have_ip {
            Ok(self.ip)
        } else {
            Err(Error::Noip)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptflow_codec::IpCompression;

    #[test]
    fn starts_invalid() {
        assert_eq!(LastIp::new().query(), Err(Error::Noip));
    }

    #[test]
    fn sext48_replaces_the_register() {
        let mut last = LastIp::new();
        let ip = last.update(&TargetIp {
            compression: IpCompression::Sext48,
            ip: 0xffff_8000_0000,
        });
        assert_eq!(ip, Some(0xffff_ffff_8000_0000));
        assert_eq!(last.query(), Ok(0xffff_ffff_8000_0000));
    }

    #[test]
    fn narrow_updates_keep_upper_bits() {
        let mut last = LastIp::new();
        last.update(&TargetIp {
            compression: IpCompression::Sext48,
            ip: 0xffff_8000,
        });
        let ip = last.update(&TargetIp {
            compression: IpCompression::Update16,
            ip: 0x1234,
        });
        assert_eq!(ip, Some(0xffff_1234));
    }

    #[test]
    fn suppressed_leaves_the_register() {
        let mut last = LastIp::new();
        last.update(&TargetIp {
            compression: IpCompression::Sext48,
            ip: 0x40_0000,
        });
        assert_eq!(last.update(&TargetIp::suppressed()), None);
        assert_eq!(last.query(), Ok(0x40_0000));
    }
}
