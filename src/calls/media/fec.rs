//! XOR forward error correction over fixed-size groups of audio payloads.
//!
//! The sender XORs every `group_size` consecutive audio payloads (plaintext
//! codec frames, zero-padded to the longest) and ships the result as one
//! redundancy payload:
//!
//! ```text
//! [group start: u64 BE][group size: u8][xor bytes]
//! ```
//!
//! A receiver holding the redundancy and all but one member rebuilds the
//! missing one. Shorter members come back zero-padded; the codec ignores the
//! padding.

use std::collections::BTreeMap;

use log::debug;

const REDUNDANCY_HEADER_LEN: usize = 9;

#[derive(Debug, Clone)]
pub struct FecConfig {
    /// Payloads covered by one redundancy packet.
    pub group_size: u8,
    /// Groups kept on the receive side.
    pub retained_groups: usize,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            group_size: 4,
            retained_groups: 10,
        }
    }
}

/// A parsed redundancy payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redundancy {
    pub group_start: u64,
    pub group_size: u8,
    pub parity: Vec<u8>,
}

impl Redundancy {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REDUNDANCY_HEADER_LEN + self.parity.len());
        out.extend_from_slice(&self.group_start.to_be_bytes());
        out.push(self.group_size);
        out.extend_from_slice(&self.parity);
        out
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < REDUNDANCY_HEADER_LEN {
            return None;
        }
        let mut start = [0u8; 8];
        start.copy_from_slice(&data[..8]);
        let group_size = data[8];
        if group_size == 0 {
            return None;
        }
        Some(Self {
            group_start: u64::from_be_bytes(start),
            group_size,
            parity: data[REDUNDANCY_HEADER_LEN..].to_vec(),
        })
    }

    fn covers(&self, seq: u64) -> bool {
        seq >= self.group_start && seq - self.group_start < u64::from(self.group_size)
    }

    fn members(&self) -> impl Iterator<Item = u64> + '_ {
        (0..u64::from(self.group_size)).map(move |i| self.group_start.wrapping_add(i))
    }
}

fn xor_into(acc: &mut Vec<u8>, data: &[u8]) {
    if acc.len() < data.len() {
        acc.resize(data.len(), 0);
    }
    for (a, b) in acc.iter_mut().zip(data) {
        *a ^= b;
    }
}

/// Send-side group accumulator.
#[derive(Debug, Clone)]
pub struct FecEncoder {
    group_size: u8,
    group_start: Option<u64>,
    members: u8,
    parity: Vec<u8>,
}

impl FecEncoder {
    pub fn new(config: &FecConfig) -> Self {
        Self {
            group_size: config.group_size.max(1),
            group_start: None,
            members: 0,
            parity: Vec::new(),
        }
    }

    /// Add an outbound payload. Returns the redundancy once the group is full.
    pub fn push(&mut self, seq: u64, payload: &[u8]) -> Option<Redundancy> {
        let group_start = *self.group_start.get_or_insert(seq);
        xor_into(&mut self.parity, payload);
        self.members += 1;
        if self.members < self.group_size {
            return None;
        }
        let redundancy = Redundancy {
            group_start,
            group_size: self.group_size,
            parity: std::mem::take(&mut self.parity),
        };
        self.group_start = None;
        self.members = 0;
        Some(redundancy)
    }

    pub fn reset(&mut self) {
        self.group_start = None;
        self.members = 0;
        self.parity.clear();
    }
}

/// Receive-side store of recent payloads and redundancy groups.
#[derive(Debug, Clone)]
pub struct FecDecoder {
    retained_groups: usize,
    max_payloads: usize,
    received: BTreeMap<u64, Vec<u8>>,
    groups: BTreeMap<u64, Redundancy>,
}

impl FecDecoder {
    pub fn new(config: &FecConfig) -> Self {
        let retained_groups = config.retained_groups.max(1);
        Self {
            retained_groups,
            max_payloads: retained_groups * usize::from(config.group_size.max(1)) * 2,
            received: BTreeMap::new(),
            groups: BTreeMap::new(),
        }
    }

    /// Remember a payload obtained by decryption or recovery.
    pub fn record(&mut self, seq: u64, payload: &[u8]) {
        self.received.insert(seq, payload.to_vec());
        while self.received.len() > self.max_payloads {
            self.received.pop_first();
        }
    }

    /// Store a redundancy packet. Returns its group start.
    pub fn add_redundancy(&mut self, redundancy: Redundancy) -> u64 {
        let start = redundancy.group_start;
        self.groups.insert(start, redundancy);
        while self.groups.len() > self.retained_groups {
            self.groups.pop_first();
        }
        start
    }

    /// Rebuild payload `seq` if its group has redundancy and exactly one
    /// missing member (which must be `seq`).
    pub fn try_recover(&self, seq: u64) -> Option<Vec<u8>> {
        if self.received.contains_key(&seq) {
            return None;
        }
        let (_, group) = self.groups.range(..=seq).next_back()?;
        if !group.covers(seq) {
            return None;
        }
        let mut rebuilt = group.parity.clone();
        for member in group.members().filter(|&m| m != seq) {
            xor_into(&mut rebuilt, self.received.get(&member)?);
        }
        debug!("FEC recovered seq {seq} from group {}", group.group_start);
        Some(rebuilt)
    }

    /// The single missing member of a group, if exactly one is missing.
    pub fn missing_member(&self, group_start: u64) -> Option<u64> {
        let group = self.groups.get(&group_start)?;
        let mut missing = group.members().filter(|m| !self.received.contains_key(m));
        let first = missing.next()?;
        missing.next().is_none().then_some(first)
    }

    pub fn reset(&mut self) {
        self.received.clear();
        self.groups.clear();
    }
}
