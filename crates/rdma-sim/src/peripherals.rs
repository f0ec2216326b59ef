//! Models of the collaborators programmed during bring-up: the Ethernet link and the BRAM
//! windows holding the endpoint table and the MAC pair.

use std::collections::BTreeMap;

use rdma_qp::{LinkError, LinkLayer, MacAddress, WordBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkBehaviour {
    /// Carrier comes up once `link_is_up` has been polled this many times.
    UpAfterPolls(u32),
    NeverUp,
    /// `configure` fails.
    RejectMac,
}

#[derive(Debug, Clone)]
pub struct SimLink {
    behaviour: LinkBehaviour,
    configured: Option<MacAddress>,
    polls: u32,
}

impl SimLink {
    pub fn new(behaviour: LinkBehaviour) -> Self {
        Self {
            behaviour,
            configured: None,
            polls: 0,
        }
    }

    pub fn configured_mac(&self) -> Option<MacAddress> {
        self.configured
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }
}

impl LinkLayer for SimLink {
    fn configure(&mut self, mac: MacAddress) -> Result<(), LinkError> {
        if self.behaviour == LinkBehaviour::RejectMac {
            return Err(LinkError::Rejected {
                mac,
                reason: "PHY did not accept the address".into(),
            });
        }
        self.configured = Some(mac);
        self.polls = 0;
        Ok(())
    }

    fn link_is_up(&mut self) -> bool {
        self.polls = self.polls.saturating_add(1);
        match self.behaviour {
            LinkBehaviour::UpAfterPolls(n) => self.configured.is_some() && self.polls > n,
            LinkBehaviour::NeverUp | LinkBehaviour::RejectMac => false,
        }
    }
}

/// Word-addressed BRAM. One word can be forced to a fixed value to model a stuck bit or a
/// write that never lands.
#[derive(Debug, Clone, Default)]
pub struct SimBram {
    words: BTreeMap<u64, u32>,
    stuck: Option<(u64, u32)>,
}

impl SimBram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stick_word(&mut self, offset: u64, value: u32) {
        self.stuck = Some((offset & !3, value));
    }

    pub fn written_words(&self) -> usize {
        self.words.len()
    }
}

impl WordBus for SimBram {
    fn read_word(&mut self, offset: u64) -> u32 {
        let offset = offset & !3;
        match self.stuck {
            Some((at, value)) if at == offset => value,
            _ => self.words.get(&offset).copied().unwrap_or(0),
        }
    }

    fn write_word(&mut self, offset: u64, value: u32) {
        self.words.insert(offset & !3, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_comes_up_after_configured_polls() {
        let mut link = SimLink::new(LinkBehaviour::UpAfterPolls(2));
        assert!(!link.link_is_up());
        link.configure(MacAddress::from_u64(0x000a_3501_0203)).unwrap();
        assert!(!link.link_is_up());
        assert!(!link.link_is_up());
        assert!(link.link_is_up());
    }

    #[test]
    fn stuck_word_ignores_writes() {
        let mut bram = SimBram::new();
        bram.stick_word(0x1c, 0);
        bram.write_word(0x1c, 0x8000_0000);
        bram.write_word(0x18, 5);
        assert_eq!(bram.read_word(0x1c), 0);
        assert_eq!(bram.read_word(0x18), 5);
    }
}
