//! Directories: entry layout, name handling, lookup and mutation.
//!
//! Directory storage is either the fixed FAT16 root area or a cluster
//! chain; both are addressed by flat entry index. Long names are VFAT
//! sequences: a run of 13-unit UTF-16 fragments in descending order ahead
//! of the 8.3 entry they decorate, tied to it by a checksum of the short
//! name.

use smallvec::SmallVec;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{DiskOps, FatError, FatVolume};

pub(crate) const ENTRY_SIZE: u32 = 32;
const DELETED: u8 = 0xE5;
const KANJI_ESCAPE: u8 = 0x05;
const ATTR_LONG_NAME: u8 = 0x0F;
/// UTF-16 units per long-name entry.
const LFN_UNITS: usize = 13;
/// Longest long name, in UTF-16 units.
const LFN_MAX_UNITS: usize = 255;

/// Fixed timestamp stamped on entries the server writes; the target
/// environment has no clock source. Encodes 1 Jan 2025, 00:00:00.
pub(crate) const NO_RTC_DATE: u16 = ((2025 - 1980) << 9) | (1 << 5) | 1;
pub(crate) const NO_RTC_TIME: u16 = 0;

bitflags::bitflags! {
    /// Directory-entry attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

/// On-disk 8.3 directory entry.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct RawDirEntry {
    pub(crate) name: [u8; 11],
    pub(crate) attr: u8,
    pub(crate) nt_flags: u8,
    pub(crate) create_tenths: u8,
    pub(crate) create_time: U16,
    pub(crate) create_date: U16,
    pub(crate) access_date: U16,
    pub(crate) cluster_hi: U16,
    pub(crate) write_time: U16,
    pub(crate) write_date: U16,
    pub(crate) cluster_lo: U16,
    pub(crate) size: U32,
}

/// On-disk long-name entry (same slot size, attribute 0x0F).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct RawLfnEntry {
    order: u8,
    name1: [u8; 10],
    attr: u8,
    kind: u8,
    checksum: u8,
    name2: [u8; 12],
    cluster_lo: U16,
    name3: [u8; 4],
}

const _: () = assert!(size_of::<RawDirEntry>() == ENTRY_SIZE as usize);
const _: () = assert!(size_of::<RawLfnEntry>() == ENTRY_SIZE as usize);

/// Where a directory's entries live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DirStorage {
    /// The fixed FAT16 root directory area.
    Root16,
    /// A cluster chain starting at the given cluster.
    Chain(u32),
}

/// A resolved directory entry.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    /// The entry's name: the long name when present, else the rendered
    /// short name.
    pub name: String,
    pub(crate) attr: Attributes,
    pub(crate) size: u32,
    pub(crate) first_cluster: u32,
    pub(crate) write_date: u16,
    pub(crate) write_time: u16,
    pub(crate) parent: DirStorage,
    /// Index of the 8.3 entry in `parent`; `u32::MAX` marks the synthetic
    /// root entry, which exists nowhere on disk.
    pub(crate) entry_index: u32,
    /// Number of long-name entries immediately ahead of the 8.3 entry.
    pub(crate) lfn_span: u32,
}

impl DirEntryInfo {
    pub fn is_dir(&self) -> bool {
        self.attr.contains(Attributes::DIRECTORY)
    }

    pub(crate) fn is_root(&self) -> bool {
        self.entry_index == u32::MAX
    }

    /// Packed FAT timestamp, date in the high half.
    pub(crate) fn timestamp(&self) -> u64 {
        u64::from(self.write_date) << 16 | u64::from(self.write_time)
    }
}

/// An open directory: storage plus iteration state.
#[derive(Debug)]
pub struct DirHandle {
    pub(crate) storage: DirStorage,
    /// Raw entry cursor.
    pub(crate) cursor: u32,
    /// Entries returned since the last rewind; the tell/seek location.
    pub(crate) returned: u64,
}

impl DirHandle {
    pub(crate) fn rewind(&mut self) {
        self.cursor = 0;
        self.returned = 0;
    }

    pub(crate) fn location(&self) -> u64 {
        self.returned
    }
}

/// Classic short-name checksum binding LFN entries to their 8.3 entry.
fn lfn_checksum(short: &[u8; 11]) -> u8 {
    short
        .iter()
        .fold(0u8, |sum, &c| (sum >> 1 | sum << 7).wrapping_add(c))
}

fn valid_sfn_char(c: char) -> bool {
    matches!(c,
        'A'..='Z' | '0'..='9'
        | '$' | '%' | '\'' | '-' | '_' | '@' | '~' | '!' | '(' | ')' | '{' | '}' | '^' | '#' | '&')
}

const INVALID_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Validate a single path component.
fn validate_name(name: &str) -> Result<(), FatError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.ends_with('.')
        || name.ends_with(' ')
        || name.encode_utf16().count() > LFN_MAX_UNITS
        || name.chars().any(|c| c < ' ' || INVALID_NAME_CHARS.contains(&c))
    {
        return Err(FatError::InvalidName);
    }
    Ok(())
}

/// Render `name` as a bare 8.3 short name, if it is one (uppercase, valid
/// character set, 8+3 lengths). Anything else needs a long-name run.
fn bare_83(name: &str) -> Option<[u8; 11]> {
    let (base, ext) = match name.rfind('.') {
        Some(at) => (&name[..at], &name[at + 1..]),
        None => (name, ""),
    };
    if base.is_empty()
        || base.len() > 8
        || ext.len() > 3
        || base.contains('.')
        || !base.chars().all(valid_sfn_char)
        || !ext.chars().all(valid_sfn_char)
    {
        return None;
    }
    let mut sfn = [b' '; 11];
    for (i, c) in base.bytes().enumerate() {
        sfn[i] = c;
    }
    for (i, c) in ext.bytes().enumerate() {
        sfn[8 + i] = c;
    }
    Some(sfn)
}

/// Build the `BASE~N.EXT` alias for a long name.
fn sfn_alias(name: &str, n: u32) -> [u8; 11] {
    let (base, ext) = match name.rfind('.') {
        Some(at) if at > 0 => (&name[..at], &name[at + 1..]),
        _ => (name, ""),
    };
    let sanitize = |s: &str| -> SmallVec<[u8; 8]> {
        s.chars()
            .filter(|c| *c != ' ' && *c != '.')
            .map(|c| {
                let up = c.to_ascii_uppercase();
                if valid_sfn_char(up) { up as u8 } else { b'_' }
            })
            .collect()
    };
    let base = sanitize(base);
    let ext = sanitize(ext);
    let tail: SmallVec<[u8; 8]> = format!("~{n}").into_bytes().into_iter().collect();
    let keep = base.len().min(8 - tail.len().min(7));
    let mut sfn = [b' '; 11];
    if keep == 0 {
        sfn[0] = b'X';
    }
    sfn[..keep].copy_from_slice(&base[..keep]);
    sfn[keep..keep + tail.len()].copy_from_slice(&tail);
    for (i, &c) in ext.iter().take(3).enumerate() {
        sfn[8 + i] = c;
    }
    sfn
}

/// Render a stored short name for display, honouring the NT lowercase
/// hints.
fn render_sfn(raw: &RawDirEntry) -> String {
    let mut name = raw.name;
    if name[0] == KANJI_ESCAPE {
        name[0] = DELETED;
    }
    let base_len = name[..8].iter().rposition(|&c| c != b' ').map_or(0, |p| p + 1);
    let ext_len = name[8..].iter().rposition(|&c| c != b' ').map_or(0, |p| p + 1);
    let mut out = String::with_capacity(12);
    for &c in &name[..base_len] {
        let c = c as char;
        out.push(if raw.nt_flags & 0x08 != 0 { c.to_ascii_lowercase() } else { c });
    }
    if ext_len > 0 {
        out.push('.');
        for &c in &name[8..8 + ext_len] {
            let c = c as char;
            out.push(if raw.nt_flags & 0x10 != 0 { c.to_ascii_lowercase() } else { c });
        }
    }
    out
}

fn names_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Reassembles a long-name run while scanning towards its 8.3 entry.
#[derive(Default)]
struct LfnAssembler {
    units: Vec<u16>,
    total: u8,
    expect: u8,
    checksum: u8,
    broken: bool,
}

impl LfnAssembler {
    fn reset(&mut self) {
        self.units.clear();
        self.total = 0;
        self.expect = 0;
        self.checksum = 0;
        self.broken = false;
    }

    fn feed(&mut self, entry: &RawLfnEntry) {
        let order = entry.order & 0x3F;
        if entry.order & 0x40 != 0 {
            // run header: the highest-ordered fragment comes first on disk
            self.reset();
            if order == 0 || order as usize * LFN_UNITS > LFN_MAX_UNITS + LFN_UNITS {
                self.broken = true;
                return;
            }
            self.total = order;
            self.expect = order;
            self.checksum = entry.checksum;
            self.units = vec![0xFFFF; order as usize * LFN_UNITS];
        } else if self.total == 0 || order != self.expect || entry.checksum != self.checksum {
            self.broken = true;
        }
        if self.broken || self.expect == 0 {
            return;
        }
        let at = (order as usize - 1) * LFN_UNITS;
        let mut units = [0u16; LFN_UNITS];
        for (i, chunk) in entry.name1.chunks_exact(2).enumerate() {
            units[i] = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
        for (i, chunk) in entry.name2.chunks_exact(2).enumerate() {
            units[5 + i] = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
        for (i, chunk) in entry.name3.chunks_exact(2).enumerate() {
            units[11 + i] = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
        self.units[at..at + LFN_UNITS].copy_from_slice(&units);
        self.expect = order - 1;
    }

    /// The assembled name, if the run is complete and matches `short`.
    fn take(&mut self, short: &[u8; 11]) -> Option<(String, u32)> {
        if self.broken || self.total == 0 || self.expect != 0 || self.checksum != lfn_checksum(short)
        {
            self.reset();
            return None;
        }
        let end = self.units.iter().position(|&u| u == 0).unwrap_or(self.units.len());
        let name: String = char::decode_utf16(self.units[..end].iter().copied())
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
        let span = u32::from(self.total);
        self.reset();
        Some((name, span))
    }
}

impl FatVolume {
    fn entries_per_cluster(&self) -> u32 {
        self.cluster_bytes() / ENTRY_SIZE
    }

    /// Device sector and in-sector byte offset of entry `index`, or `None`
    /// past the end of the directory's storage.
    async fn dir_entry_location(
        &self,
        disk: &impl DiskOps,
        dir: DirStorage,
        index: u32,
    ) -> Result<Option<(u64, usize)>, FatError> {
        let eps = self.bytes_per_sector / ENTRY_SIZE;
        match dir {
            DirStorage::Root16 => {
                if index >= self.root_entries {
                    return Ok(None);
                }
                let sector = self.root_start + u64::from(index / eps);
                Ok(Some((sector, ((index % eps) * ENTRY_SIZE) as usize)))
            }
            DirStorage::Chain(start) => {
                let epc = self.entries_per_cluster();
                let Some(cluster) = self.nth_cluster(disk, start, index / epc).await? else {
                    return Ok(None);
                };
                let within = index % epc;
                let sector = self.cluster_first_sector(cluster) + u64::from(within / eps);
                Ok(Some((sector, ((within % eps) * ENTRY_SIZE) as usize)))
            }
        }
    }

    async fn read_dir_entry_raw(
        &self,
        disk: &impl DiskOps,
        dir: DirStorage,
        index: u32,
    ) -> Result<Option<RawDirEntry>, FatError> {
        let Some((sector, offset)) = self.dir_entry_location(disk, dir, index).await? else {
            return Ok(None);
        };
        let mut buf = vec![0u8; self.bytes_per_sector as usize];
        disk.read(sector, &mut buf).await?;
        let entry = RawDirEntry::read_from_bytes(&buf[offset..offset + ENTRY_SIZE as usize])
            .map_err(|_| FatError::Internal)?;
        Ok(Some(entry))
    }

    async fn write_dir_entry_bytes(
        &self,
        disk: &impl DiskOps,
        dir: DirStorage,
        index: u32,
        bytes: &[u8],
    ) -> Result<(), FatError> {
        let Some((sector, offset)) = self.dir_entry_location(disk, dir, index).await? else {
            return Err(FatError::Internal);
        };
        let mut buf = vec![0u8; self.bytes_per_sector as usize];
        disk.read(sector, &mut buf).await?;
        buf[offset..offset + ENTRY_SIZE as usize].copy_from_slice(bytes);
        disk.write(sector, &buf).await?;
        Ok(())
    }

    /// Scan from `*cursor` to the next reportable entry. Skips deleted
    /// entries, volume labels and the dot entries; assembles long names.
    /// Leaves the cursor on the terminal entry at end of directory so
    /// repeated calls keep reporting the end.
    pub(crate) async fn next_dir_entry(
        &self,
        disk: &impl DiskOps,
        dir: DirStorage,
        cursor: &mut u32,
    ) -> Result<Option<DirEntryInfo>, FatError> {
        let mut lfn = LfnAssembler::default();
        loop {
            let Some(raw) = self.read_dir_entry_raw(disk, dir, *cursor).await? else {
                return Ok(None);
            };
            if raw.name[0] == 0 {
                return Ok(None);
            }
            if raw.name[0] == DELETED {
                lfn.reset();
                *cursor += 1;
                continue;
            }
            if raw.attr == ATTR_LONG_NAME {
                let entry = RawLfnEntry::read_from_bytes(raw.as_bytes())
                    .map_err(|_| FatError::Internal)?;
                lfn.feed(&entry);
                *cursor += 1;
                continue;
            }
            let attr = Attributes::from_bits_truncate(raw.attr);
            if attr.contains(Attributes::VOLUME_ID) || raw.name[0] == b'.' {
                lfn.reset();
                *cursor += 1;
                continue;
            }
            let index = *cursor;
            *cursor += 1;
            let (name, lfn_span) = match lfn.take(&raw.name) {
                Some((name, span)) => (name, span),
                None => (render_sfn(&raw), 0),
            };
            return Ok(Some(DirEntryInfo {
                name,
                attr,
                size: raw.size.get(),
                first_cluster: u32::from(raw.cluster_hi.get()) << 16
                    | u32::from(raw.cluster_lo.get()),
                write_date: raw.write_date.get(),
                write_time: raw.write_time.get(),
                parent: dir,
                entry_index: index,
                lfn_span,
            }));
        }
    }

    async fn find_in_dir(
        &self,
        disk: &impl DiskOps,
        dir: DirStorage,
        name: &str,
    ) -> Result<Option<DirEntryInfo>, FatError> {
        let mut cursor = 0;
        while let Some(entry) = self.next_dir_entry(disk, dir, &mut cursor).await? {
            if names_eq(&entry.name, name) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    fn synthetic_root(&self) -> DirEntryInfo {
        DirEntryInfo {
            name: String::from("/"),
            attr: Attributes::DIRECTORY,
            size: 0,
            first_cluster: match self.root_dir() {
                DirStorage::Root16 => 0,
                DirStorage::Chain(c) => c,
            },
            write_date: 0,
            write_time: 0,
            parent: self.root_dir(),
            entry_index: u32::MAX,
            lfn_span: 0,
        }
    }

    /// Resolve `path` to its entry. `/` resolves to a synthetic root
    /// entry that exists nowhere on disk.
    pub(crate) async fn lookup(
        &self,
        disk: &impl DiskOps,
        path: &str,
    ) -> Result<DirEntryInfo, FatError> {
        let mut components = path
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .peekable();
        let mut dir = self.root_dir();
        let mut found = None;
        while let Some(component) = components.next() {
            if component == ".." {
                return Err(FatError::InvalidName);
            }
            let last = components.peek().is_none();
            match self.find_in_dir(disk, dir, component).await? {
                Some(entry) => {
                    if !last {
                        if !entry.is_dir() {
                            return Err(FatError::NoPath);
                        }
                        dir = DirStorage::Chain(entry.first_cluster);
                    }
                    found = Some(entry);
                }
                None => {
                    return Err(if last { FatError::NoFile } else { FatError::NoPath });
                }
            }
        }
        Ok(found.unwrap_or_else(|| self.synthetic_root()))
    }

    /// Resolve the directory that would hold `path`'s leaf, returning its
    /// storage and the leaf name.
    pub(crate) async fn resolve_parent<'p>(
        &self,
        disk: &impl DiskOps,
        path: &'p str,
    ) -> Result<(DirStorage, &'p str), FatError> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
        let Some((&leaf, prefix)) = components.split_last() else {
            return Err(FatError::InvalidName);
        };
        let mut dir = self.root_dir();
        for component in prefix {
            if *component == ".." {
                return Err(FatError::InvalidName);
            }
            match self.find_in_dir(disk, dir, component).await? {
                Some(entry) if entry.is_dir() => dir = DirStorage::Chain(entry.first_cluster),
                Some(_) => return Err(FatError::NoPath),
                None => return Err(FatError::NoPath),
            }
        }
        if leaf == ".." {
            return Err(FatError::InvalidName);
        }
        Ok((dir, leaf))
    }

    async fn sfn_exists(
        &self,
        disk: &impl DiskOps,
        dir: DirStorage,
        sfn: &[u8; 11],
    ) -> Result<bool, FatError> {
        let mut index = 0;
        loop {
            let Some(raw) = self.read_dir_entry_raw(disk, dir, index).await? else {
                return Ok(false);
            };
            if raw.name[0] == 0 {
                return Ok(false);
            }
            if raw.name[0] != DELETED && raw.attr != ATTR_LONG_NAME && raw.name == *sfn {
                return Ok(true);
            }
            index += 1;
        }
    }

    /// Append a zeroed cluster to a directory chain.
    async fn extend_dir(&self, disk: &impl DiskOps, start: u32) -> Result<(), FatError> {
        let mut last = start;
        while let Some(next) = self.next_cluster(disk, last).await? {
            last = next;
        }
        let fresh = self.alloc_cluster(disk, Some(last)).await?;
        self.zero_cluster(disk, fresh).await
    }

    /// Create a directory entry (with its long-name run when needed) for
    /// `name` in `parent`. Returns the index of the 8.3 entry.
    pub(crate) async fn create_entry(
        &self,
        disk: &impl DiskOps,
        parent: DirStorage,
        name: &str,
        attr: Attributes,
        first_cluster: u32,
        size: u32,
    ) -> Result<u32, FatError> {
        validate_name(name)?;
        let (sfn, lfn_units) = match bare_83(name) {
            Some(sfn) => (sfn, Vec::new()),
            None => {
                let mut n = 1;
                let sfn = loop {
                    let candidate = sfn_alias(name, n);
                    if !self.sfn_exists(disk, parent, &candidate).await? {
                        break candidate;
                    }
                    n += 1;
                    if n > 999_999 {
                        return Err(FatError::DirectoryFull);
                    }
                };
                let mut units: Vec<u16> = name.encode_utf16().collect();
                units.push(0);
                while units.len() % LFN_UNITS != 0 {
                    units.push(0xFFFF);
                }
                (sfn, units)
            }
        };
        let lfn_entries = (lfn_units.len() / LFN_UNITS) as u32;
        let needed = lfn_entries + 1;

        // find a run of `needed` free slots, growing the chain as required
        let mut run_start = 0;
        let mut run_len = 0;
        let mut index = 0;
        while run_len < needed {
            match self.read_dir_entry_raw(disk, parent, index).await? {
                Some(raw) => {
                    if raw.name[0] == 0 || raw.name[0] == DELETED {
                        if run_len == 0 {
                            run_start = index;
                        }
                        run_len += 1;
                    } else {
                        run_len = 0;
                    }
                    index += 1;
                }
                None => match parent {
                    DirStorage::Root16 => return Err(FatError::DirectoryFull),
                    DirStorage::Chain(start) => self.extend_dir(disk, start).await?,
                },
            }
        }

        let checksum = lfn_checksum(&sfn);
        for i in 0..lfn_entries {
            let order = (lfn_entries - i) as u8;
            let at = (order as usize - 1) * LFN_UNITS;
            let units = &lfn_units[at..at + LFN_UNITS];
            let mut name1 = [0u8; 10];
            let mut name2 = [0u8; 12];
            let mut name3 = [0u8; 4];
            for (j, u) in units[..5].iter().enumerate() {
                name1[j * 2..j * 2 + 2].copy_from_slice(&u.to_le_bytes());
            }
            for (j, u) in units[5..11].iter().enumerate() {
                name2[j * 2..j * 2 + 2].copy_from_slice(&u.to_le_bytes());
            }
            for (j, u) in units[11..].iter().enumerate() {
                name3[j * 2..j * 2 + 2].copy_from_slice(&u.to_le_bytes());
            }
            let entry = RawLfnEntry {
                order: if i == 0 { order | 0x40 } else { order },
                name1,
                attr: ATTR_LONG_NAME,
                kind: 0,
                checksum,
                name2,
                cluster_lo: U16::new(0),
                name3,
            };
            self.write_dir_entry_bytes(disk, parent, run_start + i, entry.as_bytes())
                .await?;
        }

        let sfn_index = run_start + lfn_entries;
        let mut stored = sfn;
        if stored[0] == DELETED {
            stored[0] = KANJI_ESCAPE;
        }
        let entry = RawDirEntry {
            name: stored,
            attr: attr.bits(),
            nt_flags: 0,
            create_tenths: 0,
            create_time: U16::new(NO_RTC_TIME),
            create_date: U16::new(NO_RTC_DATE),
            access_date: U16::new(NO_RTC_DATE),
            cluster_hi: U16::new((first_cluster >> 16) as u16),
            write_time: U16::new(NO_RTC_TIME),
            write_date: U16::new(NO_RTC_DATE),
            cluster_lo: U16::new(first_cluster as u16),
            size: U32::new(size),
        };
        self.write_dir_entry_bytes(disk, parent, sfn_index, entry.as_bytes())
            .await?;
        Ok(sfn_index)
    }

    /// Mark an entry and its long-name run deleted.
    pub(crate) async fn remove_entry(
        &self,
        disk: &impl DiskOps,
        info: &DirEntryInfo,
    ) -> Result<(), FatError> {
        let first = info.entry_index - info.lfn_span;
        for index in first..=info.entry_index {
            let Some(mut raw) = self.read_dir_entry_raw(disk, info.parent, index).await? else {
                return Err(FatError::Internal);
            };
            raw.name[0] = DELETED;
            self.write_dir_entry_bytes(disk, info.parent, index, raw.as_bytes()).await?;
        }
        Ok(())
    }

    /// Rewrite an entry's cluster, size and timestamp after file changes.
    pub(crate) async fn update_entry(
        &self,
        disk: &impl DiskOps,
        parent: DirStorage,
        index: u32,
        first_cluster: u32,
        size: u32,
    ) -> Result<(), FatError> {
        let Some(mut raw) = self.read_dir_entry_raw(disk, parent, index).await? else {
            return Err(FatError::Internal);
        };
        raw.cluster_hi = U16::new((first_cluster >> 16) as u16);
        raw.cluster_lo = U16::new(first_cluster as u16);
        raw.size = U32::new(size);
        raw.write_date = U16::new(NO_RTC_DATE);
        raw.write_time = U16::new(NO_RTC_TIME);
        raw.attr |= Attributes::ARCHIVE.bits();
        self.write_dir_entry_bytes(disk, parent, index, raw.as_bytes()).await
    }

    /// Whether a directory holds any live entry beyond the dot pair.
    async fn dir_is_empty(&self, disk: &impl DiskOps, dir: DirStorage) -> Result<bool, FatError> {
        let mut cursor = 0;
        Ok(self.next_dir_entry(disk, dir, &mut cursor).await?.is_none())
    }

    /// Create a directory at `path`, with its dot entries.
    pub(crate) async fn mkdir(&self, disk: &impl DiskOps, path: &str) -> Result<(), FatError> {
        match self.lookup(disk, path).await {
            Ok(_) => return Err(FatError::Exists),
            Err(FatError::NoFile) => {}
            Err(e) => return Err(e),
        }
        let (parent, leaf) = self.resolve_parent(disk, path).await?;
        let cluster = self.alloc_cluster(disk, None).await?;
        self.zero_cluster(disk, cluster).await?;

        let parent_cluster = match parent {
            DirStorage::Chain(c) if parent != self.root_dir() => c,
            // ".." pointing at the root is encoded as cluster 0
            _ => 0,
        };
        let dot = |name: [u8; 11], target: u32| RawDirEntry {
            name,
            attr: Attributes::DIRECTORY.bits(),
            nt_flags: 0,
            create_tenths: 0,
            create_time: U16::new(NO_RTC_TIME),
            create_date: U16::new(NO_RTC_DATE),
            access_date: U16::new(NO_RTC_DATE),
            cluster_hi: U16::new((target >> 16) as u16),
            write_time: U16::new(NO_RTC_TIME),
            write_date: U16::new(NO_RTC_DATE),
            cluster_lo: U16::new(target as u16),
            size: U32::new(0),
        };
        let me = DirStorage::Chain(cluster);
        self.write_dir_entry_bytes(disk, me, 0, dot(*b".          ", cluster).as_bytes())
            .await?;
        self.write_dir_entry_bytes(disk, me, 1, dot(*b"..         ", parent_cluster).as_bytes())
            .await?;

        match self
            .create_entry(disk, parent, leaf, Attributes::DIRECTORY, cluster, 0)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                // roll the cluster back so a failed create leaks nothing
                let _ = self.free_chain(disk, cluster).await;
                Err(e)
            }
        }
    }

    async fn remove_resolved(
        &self,
        disk: &impl DiskOps,
        info: &DirEntryInfo,
    ) -> Result<(), FatError> {
        if info.is_dir() && !self.dir_is_empty(disk, DirStorage::Chain(info.first_cluster)).await? {
            return Err(FatError::Denied);
        }
        self.remove_entry(disk, info).await?;
        if info.first_cluster != 0 {
            self.free_chain(disk, info.first_cluster).await?;
        }
        Ok(())
    }

    /// Remove a file or an empty directory.
    pub(crate) async fn unlink(&self, disk: &impl DiskOps, path: &str) -> Result<(), FatError> {
        let info = self.lookup(disk, path).await?;
        if info.is_root() {
            return Err(FatError::Denied);
        }
        self.remove_resolved(disk, &info).await
    }

    /// Remove an empty directory; the target must be a directory.
    pub(crate) async fn rmdir(&self, disk: &impl DiskOps, path: &str) -> Result<(), FatError> {
        let info = self.lookup(disk, path).await?;
        if info.is_root() {
            return Err(FatError::Denied);
        }
        if !info.is_dir() {
            return Err(FatError::NoPath);
        }
        self.remove_resolved(disk, &info).await
    }

    /// Move `old` to `new`. The destination must not exist.
    pub(crate) async fn rename(
        &self,
        disk: &impl DiskOps,
        old: &str,
        new: &str,
    ) -> Result<(), FatError> {
        let info = self.lookup(disk, old).await?;
        if info.is_root() {
            return Err(FatError::Denied);
        }
        match self.lookup(disk, new).await {
            Ok(_) => return Err(FatError::Exists),
            Err(FatError::NoFile) => {}
            Err(e) => return Err(e),
        }
        let (new_parent, leaf) = self.resolve_parent(disk, new).await?;
        self.create_entry(disk, new_parent, leaf, info.attr, info.first_cluster, info.size)
            .await?;
        self.remove_entry(disk, &info).await?;

        // a moved directory's ".." entry must track its new parent
        if info.is_dir() && new_parent != info.parent {
            let target = match new_parent {
                DirStorage::Chain(c) if new_parent != self.root_dir() => c,
                _ => 0,
            };
            let me = DirStorage::Chain(info.first_cluster);
            if let Some(mut dotdot) = self.read_dir_entry_raw(disk, me, 1).await? {
                if dotdot.name.starts_with(b"..") {
                    dotdot.cluster_hi = U16::new((target >> 16) as u16);
                    dotdot.cluster_lo = U16::new(target as u16);
                    self.write_dir_entry_bytes(disk, me, 1, dotdot.as_bytes()).await?;
                }
            }
        }
        Ok(())
    }

    /// Open a directory for iteration.
    pub(crate) async fn opendir(
        &self,
        disk: &impl DiskOps,
        path: &str,
    ) -> Result<DirHandle, FatError> {
        let info = self.lookup(disk, path).await?;
        let storage = if info.is_root() {
            self.root_dir()
        } else if info.is_dir() {
            DirStorage::Chain(info.first_cluster)
        } else {
            return Err(FatError::NoPath);
        };
        Ok(DirHandle {
            storage,
            cursor: 0,
            returned: 0,
        })
    }

    /// Read the next entry of an open directory; `None` at the end.
    pub(crate) async fn readdir(
        &self,
        disk: &impl DiskOps,
        handle: &mut DirHandle,
    ) -> Result<Option<DirEntryInfo>, FatError> {
        let entry = self.next_dir_entry(disk, handle.storage, &mut handle.cursor).await?;
        if entry.is_some() {
            handle.returned += 1;
        }
        Ok(entry)
    }

    /// Release an open directory. The handle owns nothing but iteration
    /// state, so there is nothing to write back; the check guards against
    /// a handle whose chain start stopped being a plausible cluster.
    pub(crate) async fn closedir(
        &self,
        _disk: &impl DiskOps,
        handle: &mut DirHandle,
    ) -> Result<(), FatError> {
        match handle.storage {
            DirStorage::Root16 => Ok(()),
            DirStorage::Chain(start) => {
                if (2..=self.max_cluster()).contains(&start) {
                    Ok(())
                } else {
                    Err(FatError::Internal)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_reference() {
        // reference value for "FOO     BAR": independently computed with
        // the canonical algorithm
        let mut sum = 0u8;
        for &c in b"FOO     BAR" {
            sum = (sum >> 1 | sum << 7).wrapping_add(c);
        }
        assert_eq!(lfn_checksum(b"FOO     BAR"), sum);
        assert_ne!(lfn_checksum(b"FOO     BAR"), lfn_checksum(b"FOO     BAZ"));
    }

    #[test]
    fn bare_short_names() {
        assert_eq!(bare_83("README.TXT").unwrap(), *b"README  TXT");
        assert_eq!(bare_83("A").unwrap(), *b"A          ");
        assert_eq!(bare_83("NO_EXT~1").unwrap(), *b"NO_EXT~1   ");
        assert!(bare_83("lower.txt").is_none());
        assert!(bare_83("TOOLONGNAME.TXT").is_none());
        assert!(bare_83("BAD.EXTS").is_none());
        assert!(bare_83("TWO.DOT.S").is_none());
        assert!(bare_83("").is_none());
    }

    #[test]
    fn alias_generation() {
        assert_eq!(sfn_alias("hello world.txt", 1), *b"HELLOW~1TXT");
        assert_eq!(sfn_alias("hello.txt", 12), *b"HELLO~12TXT");
        assert_eq!(sfn_alias("x", 1), *b"X~1        ");
        // invalid characters degrade to underscores
        assert_eq!(sfn_alias("a+b.c", 1), *b"A_B~1   C  ");
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("plain name.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("tail.").is_err());
        assert!(validate_name("que?").is_err());
        let long: String = std::iter::repeat_n('x', 256).collect();
        assert!(validate_name(&long).is_err());
    }

    #[test]
    fn renders_short_names() {
        let mut raw = RawDirEntry {
            name: *b"README  TXT",
            attr: 0x20,
            nt_flags: 0,
            create_tenths: 0,
            create_time: U16::new(0),
            create_date: U16::new(0),
            access_date: U16::new(0),
            cluster_hi: U16::new(0),
            write_time: U16::new(0),
            write_date: U16::new(0),
            cluster_lo: U16::new(0),
            size: U32::new(0),
        };
        assert_eq!(render_sfn(&raw), "README.TXT");
        raw.nt_flags = 0x08 | 0x10;
        assert_eq!(render_sfn(&raw), "readme.txt");
        raw.name = *b"NOEXT      ";
        assert_eq!(render_sfn(&raw), "noext");
    }
}
