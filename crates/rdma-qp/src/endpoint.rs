//! Collaborators on the Ethernet side of the data mover: the MAC/PHY link and the endpoint
//! table the IP encapsulator uses to resolve a destination IP to a MAC pair.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{Clock, Deadline};

/// Bytes per endpoint slot in the lookup BRAM.
pub const ENDPOINT_SLOT_SIZE: u64 = 32;
pub const ENDPOINT_SLOT_WORDS: usize = 8;
pub const ENDPOINT_VALID: u32 = 0x8000_0000;

/// MAC BRAM consumed by the TX encapsulator.
pub const MAC_SRC_LO: u64 = 0x00;
pub const MAC_SRC_HI: u64 = 0x04;
pub const MAC_DST_LO: u64 = 0x08;
pub const MAC_DST_HI: u64 = 0x0c;

const LINK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link rejected MAC {mac}: {reason}")]
    Rejected { mac: MacAddress, reason: String },
    #[error("link still down after {waited:?}")]
    Down { waited: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("endpoint slot {index} word {word}: wrote 0x{wrote:08x}, read back 0x{read:08x}")]
    ReadbackMismatch {
        index: u8,
        word: usize,
        wrote: u32,
        read: u32,
    },
    #[error("MAC BRAM offset 0x{offset:02x}: wrote 0x{wrote:08x}, read back 0x{read:08x}")]
    MacReadbackMismatch { offset: u64, wrote: u32, read: u32 },
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// From the low 48 bits of `value`, most significant byte first.
    pub fn from_u64(value: u64) -> Self {
        let b = value.to_be_bytes();
        Self([b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    pub fn to_u64(self) -> u64 {
        let m = self.0;
        u64::from_be_bytes([0, 0, m[0], m[1], m[2], m[3], m[4], m[5]])
    }

    /// Bits 31:0.
    pub fn low_word(self) -> u32 {
        self.to_u64() as u32
    }

    /// Bits 47:32.
    pub fn high_word(self) -> u32 {
        (self.to_u64() >> 32) as u32
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid MAC address {0:?}")]
pub struct ParseMacError(pub String);

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in out.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_owned()))?;
            if part.len() != 2 {
                return Err(ParseMacError(s.to_owned()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_owned()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_owned()));
        }
        Ok(Self(out))
    }
}

/// The Ethernet MAC + PHY in front of the encapsulator.
pub trait LinkLayer {
    fn configure(&mut self, mac: MacAddress) -> Result<(), LinkError>;
    fn link_is_up(&mut self) -> bool;
}

/// Destination-IP keyed table read by the encapsulator on every outgoing frame.
pub trait EndpointTable {
    fn write_entry(
        &mut self,
        dst_ip: Ipv4Addr,
        dst_mac: MacAddress,
        src_mac: MacAddress,
    ) -> Result<(), EndpointError>;
}

/// 32-bit word access to a BRAM window, by byte offset.
pub trait WordBus {
    fn read_word(&mut self, offset: u64) -> u32;
    fn write_word(&mut self, offset: u64, value: u32);
}

impl<T: WordBus + ?Sized> WordBus for &mut T {
    fn read_word(&mut self, offset: u64) -> u32 {
        (**self).read_word(offset)
    }

    fn write_word(&mut self, offset: u64, value: u32) {
        (**self).write_word(offset, value)
    }
}

/// Slot used by the lookup hardware: `ip[7:0] ^ ip[15:8]`.
pub fn endpoint_index(ip: Ipv4Addr) -> u8 {
    let v = u32::from(ip);
    ((v & 0xff) ^ ((v >> 8) & 0xff)) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointEntry {
    pub valid: bool,
    pub dst_ip: Ipv4Addr,
    pub dst_mac: MacAddress,
    pub src_mac: MacAddress,
}

impl EndpointEntry {
    pub fn new(dst_ip: Ipv4Addr, dst_mac: MacAddress, src_mac: MacAddress) -> Self {
        Self {
            valid: true,
            dst_ip,
            dst_mac,
            src_mac,
        }
    }

    pub fn index(&self) -> u8 {
        endpoint_index(self.dst_ip)
    }

    pub fn to_words(&self) -> [u32; ENDPOINT_SLOT_WORDS] {
        let dst = self.dst_mac.to_u64();
        let src = self.src_mac.to_u64();
        let mut w = [0u32; ENDPOINT_SLOT_WORDS];
        w[7] = if self.valid { ENDPOINT_VALID } else { 0 };
        w[6] = u32::from(self.dst_ip);
        w[5] = (dst >> 16) as u32;
        w[4] = ((dst & 0xffff) << 16) as u32 | ((src >> 32) & 0xffff) as u32;
        w[3] = src as u32;
        w
    }

    pub fn from_words(w: &[u32; ENDPOINT_SLOT_WORDS]) -> Self {
        let dst = (w[5] as u64) << 16 | (w[4] >> 16) as u64;
        let src = ((w[4] & 0xffff) as u64) << 32 | w[3] as u64;
        Self {
            valid: w[7] & ENDPOINT_VALID != 0,
            dst_ip: Ipv4Addr::from(w[6]),
            dst_mac: MacAddress::from_u64(dst),
            src_mac: MacAddress::from_u64(src),
        }
    }
}

/// [`EndpointTable`] over the lookup BRAM, verifying every word after writing it.
pub struct BramEndpointTable<W> {
    bram: W,
}

impl<W: WordBus> BramEndpointTable<W> {
    pub fn new(bram: W) -> Self {
        Self { bram }
    }

    pub fn read_entry(&mut self, index: u8) -> EndpointEntry {
        let base = index as u64 * ENDPOINT_SLOT_SIZE;
        let mut words = [0u32; ENDPOINT_SLOT_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.bram.read_word(base + i as u64 * 4);
        }
        EndpointEntry::from_words(&words)
    }

    pub fn into_inner(self) -> W {
        self.bram
    }
}

impl<W: WordBus> EndpointTable for BramEndpointTable<W> {
    fn write_entry(
        &mut self,
        dst_ip: Ipv4Addr,
        dst_mac: MacAddress,
        src_mac: MacAddress,
    ) -> Result<(), EndpointError> {
        let entry = EndpointEntry::new(dst_ip, dst_mac, src_mac);
        let index = entry.index();
        let base = index as u64 * ENDPOINT_SLOT_SIZE;
        let words = entry.to_words();

        for (i, &w) in words.iter().enumerate() {
            self.bram.write_word(base + i as u64 * 4, w);
        }
        for (i, &wrote) in words.iter().enumerate() {
            let read = self.bram.read_word(base + i as u64 * 4);
            if read != wrote {
                tracing::error!(index, word = i, wrote, read, "endpoint readback mismatch");
                return Err(EndpointError::ReadbackMismatch {
                    index,
                    word: i,
                    wrote,
                    read,
                });
            }
        }
        tracing::debug!(%dst_ip, %dst_mac, %src_mac, index, "endpoint entry written");
        Ok(())
    }
}

/// Writes the TX encapsulator's source/destination MAC pair and reads it back.
pub fn program_mac_pair<W: WordBus>(
    bram: &mut W,
    src: MacAddress,
    dst: MacAddress,
) -> Result<(), EndpointError> {
    let writes = [
        (MAC_SRC_LO, src.low_word()),
        (MAC_SRC_HI, src.high_word()),
        (MAC_DST_LO, dst.low_word()),
        (MAC_DST_HI, dst.high_word()),
    ];
    for &(offset, value) in &writes {
        bram.write_word(offset, value);
    }
    for &(offset, wrote) in &writes {
        let read = bram.read_word(offset);
        if read != wrote {
            tracing::error!(offset, wrote, read, "MAC BRAM readback mismatch");
            return Err(EndpointError::MacReadbackMismatch {
                offset,
                wrote,
                read,
            });
        }
    }
    tracing::debug!(%src, %dst, "MAC pair programmed");
    Ok(())
}

/// Programs `mac` and waits for carrier, polling every 100 ms until `timeout`.
pub fn bring_up_link<L, C>(
    link: &mut L,
    clock: &mut C,
    mac: MacAddress,
    timeout: Duration,
) -> Result<(), LinkError>
where
    L: LinkLayer + ?Sized,
    C: Clock + ?Sized,
{
    link.configure(mac)?;
    let deadline = Deadline::after(clock, timeout);
    loop {
        if link.link_is_up() {
            tracing::info!(%mac, "link up");
            return Ok(());
        }
        let now = clock.now();
        if deadline.expired(now) {
            let waited = deadline.elapsed(now);
            tracing::error!(%mac, ?waited, "link down");
            return Err(LinkError::Down { waited });
        }
        clock.pause(LINK_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Bram {
        words: HashMap<u64, u32>,
        stuck: Option<(u64, u32)>,
    }

    impl WordBus for Bram {
        fn read_word(&mut self, offset: u64) -> u32 {
            match self.stuck {
                Some((at, v)) if at == offset => v,
                _ => self.words.get(&offset).copied().unwrap_or(0),
            }
        }

        fn write_word(&mut self, offset: u64, value: u32) {
            self.words.insert(offset, value);
        }
    }

    #[test]
    fn index_xors_low_octets() {
        assert_eq!(endpoint_index(Ipv4Addr::new(192, 168, 1, 100)), 0x64 ^ 0x01);
        assert_eq!(endpoint_index(Ipv4Addr::new(192, 168, 1, 101)), 0x65 ^ 0x01);
        assert_eq!(endpoint_index(Ipv4Addr::new(10, 0, 7, 7)), 0);
    }

    #[test]
    fn entry_words_follow_bram_layout() {
        let entry = EndpointEntry::new(
            Ipv4Addr::new(192, 168, 1, 100),
            MacAddress::from_u64(0xAABB_CCDD_EE01),
            MacAddress::from_u64(0x1122_3344_5501),
        );
        let w = entry.to_words();
        assert_eq!(w[7], 0x8000_0000);
        assert_eq!(w[6], 0xC0A8_0164);
        assert_eq!(w[5], 0xAABB_CCDD);
        assert_eq!(w[4], 0xEE01_1122);
        assert_eq!(w[3], 0x3344_5501);
        assert_eq!(&w[0..3], &[0, 0, 0]);
        assert_eq!(EndpointEntry::from_words(&w), entry);
    }

    #[test]
    fn table_writes_slot_and_detects_bad_readback() {
        let mut table = BramEndpointTable::new(Bram::default());
        let ip = Ipv4Addr::new(192, 168, 1, 101);
        let dst = MacAddress::from_u64(0xAABB_CCDD_EE02);
        let src = MacAddress::from_u64(0x1122_3344_5502);
        table.write_entry(ip, dst, src).unwrap();
        let read = table.read_entry(endpoint_index(ip));
        assert!(read.valid);
        assert_eq!(read.dst_mac, dst);

        let slot = endpoint_index(ip) as u64 * ENDPOINT_SLOT_SIZE;
        let mut bram = table.into_inner();
        bram.stuck = Some((slot + 6 * 4, 0));
        let mut table = BramEndpointTable::new(bram);
        assert_eq!(
            table.write_entry(ip, dst, src),
            Err(EndpointError::ReadbackMismatch {
                index: endpoint_index(ip),
                word: 6,
                wrote: 0xC0A8_0165,
                read: 0
            })
        );
    }

    #[test]
    fn mac_pair_uses_lo_hi_words() {
        let mut bram = Bram::default();
        let src: MacAddress = "00:0a:35:01:02:03".parse().unwrap();
        let dst = MacAddress::from_u64(0x000C_2915_372C);
        program_mac_pair(&mut bram, src, dst).unwrap();
        assert_eq!(bram.words[&MAC_SRC_LO], 0x3501_0203);
        assert_eq!(bram.words[&MAC_SRC_HI], 0x0000_000A);
        assert_eq!(bram.words[&MAC_DST_LO], 0x2915_372C);
        assert_eq!(bram.words[&MAC_DST_HI], 0x0000_000C);
    }

    #[test]
    fn mac_parse_rejects_garbage() {
        assert!("00:0a:35:01:02".parse::<MacAddress>().is_err());
        assert!("00:0a:35:01:02:03:04".parse::<MacAddress>().is_err());
        assert!("zz:0a:35:01:02:03".parse::<MacAddress>().is_err());
        assert_eq!(
            "00-0A-35-01-02-03".parse::<MacAddress>().unwrap().to_string(),
            "00:0a:35:01:02:03"
        );
    }
}
