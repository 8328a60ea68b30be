//! Decoding of the FSRoot container: the cluster chain table and the directory.
//!
//! The first 0x4000 bytes of an FSRoot block alternate between the two tables in runs of 512
//! bytes, whatever the page size of the part:
//!
//! ```text
//! | chain 0 | dir 0 | chain 1 | dir 1 | ... | chain 15 | dir 15 |
//! ```

use std::fmt;

use deku::prelude::*;

use super::{Error, Result, FSROOT_SIZE};

/// Length of each alternating run
pub const RUN_LEN: usize = 0x200;

/// Bytes of the FSRoot block holding both tables
pub const FSROOT_BLOCK_LEN: usize = FSROOT_SIZE * 2;

/// Bytes per directory entry
pub const ENTRY_SIZE: usize = 32;

/// Number of directory slots
pub const ENTRY_COUNT: usize = FSROOT_SIZE / ENTRY_SIZE;

/// Chain values from here up end a file's chain
pub const CHAIN_END: u16 = 0x1FFE;

/// First name byte of a never-used directory slot
const NAME_EMPTY: u8 = 0x00;

/// First name byte of a deleted file
const NAME_TOMBSTONE: u8 = 0x05;

const NAME_LEN: usize = 22;

/// Split the interleaved FSRoot area into its even runs and its odd runs
pub fn deinterleave(raw: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let raw = raw.get(..FSROOT_BLOCK_LEN).ok_or(Error::Truncated {
        what: "FSRoot block",
        len: raw.len(),
        need: FSROOT_BLOCK_LEN,
    })?;

    let mut even = Vec::with_capacity(FSROOT_SIZE);
    let mut odd = Vec::with_capacity(FSROOT_SIZE);
    for pair in raw.chunks_exact(RUN_LEN * 2) {
        let (a, b) = pair.split_at(RUN_LEN);
        even.extend_from_slice(a);
        odd.extend_from_slice(b);
    }

    Ok((even, odd))
}

/// Inverse of [`deinterleave`]. Both halves are padded or cut to `FSROOT_SIZE`.
pub fn interleave(even: &[u8], odd: &[u8]) -> Vec<u8> {
    let mut even = even.to_vec();
    let mut odd = odd.to_vec();
    even.resize(FSROOT_SIZE, 0);
    odd.resize(FSROOT_SIZE, 0);

    let mut out = Vec::with_capacity(FSROOT_BLOCK_LEN);
    for (a, b) in even.chunks_exact(RUN_LEN).zip(odd.chunks_exact(RUN_LEN)) {
        out.extend_from_slice(a);
        out.extend_from_slice(b);
    }
    out
}

/// Packed FAT-style date and time
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct FsTimestamp(pub u32);

impl FsTimestamp {
    pub fn from_parts(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        let year = u32::from(year.saturating_sub(1980)) & 0x7F;
        Self(
            (year << 25)
                | (u32::from(month & 0xF) << 21)
                | (u32::from(day & 0x1F) << 16)
                | (u32::from(hour & 0x1F) << 11)
                | (u32::from(minute & 0x3F) << 5)
                | u32::from((second / 2) & 0x1F),
        )
    }

    pub fn year(self) -> u16 {
        ((self.0 >> 25) & 0x7F) as u16 + 1980
    }
    pub fn month(self) -> u8 {
        ((self.0 >> 21) & 0xF) as u8
    }
    pub fn day(self) -> u8 {
        ((self.0 >> 16) & 0x1F) as u8
    }
    pub fn hour(self) -> u8 {
        ((self.0 >> 11) & 0x1F) as u8
    }
    pub fn minute(self) -> u8 {
        ((self.0 >> 5) & 0x3F) as u8
    }
    /// Stored in two-second units
    pub fn second(self) -> u8 {
        (self.0 & 0x1F) as u8 * 2
    }
}

impl fmt::Display for FsTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year(),
            self.month(),
            self.day(),
            self.hour(),
            self.minute(),
            self.second()
        )
    }
}

/// A directory entry exactly as stored
#[derive(Debug, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
struct RawEntry {
    name: [u8; NAME_LEN],
    start_cluster: u16,
    size: u32,
    timestamp: u32,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum EntryState {
    Empty,
    Live,
    Deleted,
}

/// One file in the directory
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct FsEntry {
    /// Slot of the entry in the directory table
    pub slot: usize,
    pub raw_name: [u8; NAME_LEN],
    pub start_cluster: u16,
    pub size: u32,
    pub timestamp: FsTimestamp,
}

impl FsEntry {
    /// Make a live entry; the name is cut to 21 bytes
    pub fn new(name: &str, start_cluster: u16, size: u32, timestamp: FsTimestamp) -> Self {
        let mut raw_name = [0; NAME_LEN];
        let len = name.len().min(NAME_LEN - 1);
        raw_name[..len].copy_from_slice(&name.as_bytes()[..len]);

        Self {
            slot: 0,
            raw_name,
            start_cluster,
            size,
            timestamp,
        }
    }

    /// Convert from a 32-byte slice
    pub fn decode(slot: usize, bytes: &[u8]) -> Result<Self> {
        let (_, raw) = RawEntry::from_bytes((bytes, 0))?;
        Ok(Self {
            slot,
            raw_name: raw.name,
            start_cluster: raw.start_cluster,
            size: raw.size,
            timestamp: FsTimestamp(raw.timestamp),
        })
    }

    /// Write into a byte slice
    pub fn encode(&self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = RawEntry {
            name: self.raw_name,
            start_cluster: self.start_cluster,
            size: self.size,
            timestamp: self.timestamp.0,
        }
        .to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }

    pub fn state(&self) -> EntryState {
        match self.raw_name[0] {
            NAME_EMPTY => EntryState::Empty,
            NAME_TOMBSTONE => EntryState::Deleted,
            _ => EntryState::Live,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.state() == EntryState::Deleted
    }

    /// Mark the entry deleted, the way the console does it
    pub fn delete(&mut self) {
        self.raw_name[0] = NAME_TOMBSTONE;
    }

    /// The file name up to its terminator. A deleted entry's lost first byte shows as '?'.
    pub fn name(&self) -> String {
        let end = self
            .raw_name
            .iter()
            .position(|&x| x == 0)
            .unwrap_or(NAME_LEN);
        let mut name = self.raw_name[..end].to_vec();
        if let Some(first) = name.first_mut().filter(|x| **x == NAME_TOMBSTONE) {
            *first = b'?';
        }
        String::from_utf8_lossy(&name).into_owned()
    }
}

/// The decoded FSRoot container
#[derive(Debug, Clone)]
pub struct FsRoot {
    chain: Vec<u16>,
    entries: Vec<FsEntry>,
}

impl Default for FsRoot {
    fn default() -> Self {
        Self::new()
    }
}

impl FsRoot {
    /// An FSRoot with a zeroed chain table and no entries
    pub fn new() -> Self {
        Self {
            chain: vec![0; FSROOT_SIZE / 2],
            entries: Vec::new(),
        }
    }

    /// Decode the user data of an FSRoot block
    pub fn decode(block: &[u8]) -> Result<Self> {
        let (chain_bytes, dir_bytes) = deinterleave(block)?;

        let chain = chain_bytes
            .chunks_exact(2)
            .map(|x| u16::from_be_bytes([x[0], x[1]]))
            .collect();

        let mut entries = Vec::new();
        for (slot, bytes) in dir_bytes.chunks_exact(ENTRY_SIZE).enumerate() {
            let entry = FsEntry::decode(slot, bytes)?;
            if entry.state() != EntryState::Empty {
                entries.push(entry);
            }
        }

        Ok(Self { chain, entries })
    }

    /// Encode back into the interleaved block layout
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let chain_bytes: Vec<u8> = self.chain.iter().flat_map(|x| x.to_be_bytes()).collect();

        let mut dir_bytes = vec![0; FSROOT_SIZE];
        for entry in &self.entries {
            let start = entry.slot * ENTRY_SIZE;
            let out = dir_bytes
                .get_mut(start..start + ENTRY_SIZE)
                .ok_or(anyhow::anyhow!("entry slot {} out of range", entry.slot))?;
            entry.encode(out)?;
        }

        Ok(interleave(&chain_bytes, &dir_bytes))
    }

    /// Every used directory slot, deleted files included
    pub fn entries(&self) -> &[FsEntry] {
        &self.entries
    }

    /// Entries that have not been deleted
    pub fn files(&self) -> impl Iterator<Item = &FsEntry> {
        self.entries.iter().filter(|x| !x.is_deleted())
    }

    /// Find a live file by name
    pub fn find(&self, name: &str) -> Option<&FsEntry> {
        self.files().find(|x| x.name() == name)
    }

    /// The chain table as 16-bit links
    pub fn chain(&self) -> &[u16] {
        &self.chain
    }

    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    /// The cluster after `cluster`, or None if `cluster` is outside the table
    pub fn next_cluster(&self, cluster: u16) -> Option<u16> {
        self.chain.get(cluster as usize).copied()
    }

    /// Link `cluster` to `next` in the chain table
    pub fn set_next(&mut self, cluster: u16, next: u16) -> anyhow::Result<()> {
        let link = self
            .chain
            .get_mut(cluster as usize)
            .ok_or(anyhow::anyhow!("cluster {cluster:#x} outside the chain table"))?;
        *link = next;
        Ok(())
    }

    /// Place an entry in the first free directory slot, returning the slot
    pub fn add_entry(&mut self, mut entry: FsEntry) -> anyhow::Result<usize> {
        let slot = (0..ENTRY_COUNT)
            .find(|x| self.entries.iter().all(|y| y.slot != *x))
            .ok_or(anyhow::anyhow!("directory full"))?;
        entry.slot = slot;
        self.entries.push(entry);
        self.entries.sort_by_key(|x| x.slot);
        Ok(slot)
    }
}

#[test]
fn test_interleave_round_trip() -> anyhow::Result<()> {
    let even: Vec<u8> = (0..FSROOT_SIZE).map(|x| (x % 251) as u8).collect();
    let odd: Vec<u8> = (0..FSROOT_SIZE).map(|x| (x % 241) as u8 ^ 0x80).collect();

    let raw = interleave(&even, &odd);
    assert_eq!(raw.len(), 0x4000);
    assert_eq!(raw[..RUN_LEN], even[..RUN_LEN]);
    assert_eq!(raw[RUN_LEN..RUN_LEN * 2], odd[..RUN_LEN]);

    let (even_out, odd_out) = deinterleave(&raw)?;
    assert_eq!(even_out, even);
    assert_eq!(odd_out, odd);

    assert!(matches!(
        deinterleave(&raw[..0x3000]),
        Err(Error::Truncated { .. })
    ));
    Ok(())
}

#[test]
fn test_timestamp_fields() {
    let ts = FsTimestamp::from_parts(2012, 11, 3, 17, 45, 30);
    assert_eq!(ts.year(), 2012);
    assert_eq!(ts.month(), 11);
    assert_eq!(ts.day(), 3);
    assert_eq!(ts.hour(), 17);
    assert_eq!(ts.minute(), 45);
    assert_eq!(ts.second(), 30);
    assert_eq!(ts.to_string(), "2012-11-03 17:45:30");
    assert_eq!(FsTimestamp(0).year(), 1980);
}

#[test]
fn test_fsroot_entries() -> anyhow::Result<()> {
    let ts = FsTimestamp::from_parts(2010, 1, 2, 3, 4, 6);

    let mut root = FsRoot::new();
    root.add_entry(FsEntry::new("sysupdate.xexp", 0x10, 0x1234, ts))?;
    let mut deleted = FsEntry::new("name.txt", 0x20, 0x40, ts);
    deleted.delete();
    root.add_entry(deleted)?;
    root.add_entry(FsEntry::new("a_rather_long_file_name.bin", 0x30, 1, ts))?;
    root.set_next(0x10, 0x11)?;
    root.set_next(0x11, 0x1FFF)?;
    assert!(root.set_next(0x1000, 0).is_err());

    let raw = root.encode()?;
    assert_eq!(raw.len(), FSROOT_BLOCK_LEN);
    // First entry sits at the start of the first odd run
    assert_eq!(&raw[RUN_LEN..RUN_LEN + 14], b"sysupdate.xexp");

    let root = FsRoot::decode(&raw)?;
    assert_eq!(root.entries().len(), 3);
    assert_eq!(root.files().count(), 2);
    assert_eq!(root.chain_len(), 0x1000);
    assert_eq!(root.next_cluster(0x10), Some(0x11));
    assert_eq!(root.next_cluster(0x11), Some(0x1FFF));
    assert_eq!(root.next_cluster(0x1000), None);

    let file = root.find("sysupdate.xexp").ok_or(anyhow::anyhow!("missing"))?;
    assert_eq!(file.slot, 0);
    assert_eq!((file.start_cluster, file.size), (0x10, 0x1234));
    assert_eq!(file.timestamp, ts);

    let tombstone = &root.entries()[1];
    assert!(tombstone.is_deleted());
    assert_eq!(tombstone.name(), "?ame.txt");
    assert!(root.find("?ame.txt").is_none());

    assert_eq!(root.entries()[2].name(), "a_rather_long_file_na");
    Ok(())
}
