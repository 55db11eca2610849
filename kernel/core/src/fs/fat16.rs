/// FAT16 driver on top of the shared block cache.
///
/// Assumes the volume starts at LBA 0 of its device (no partition table) and uses
/// 512-byte sectors. Short (8.3) names only: long-name entries are skipped when
/// reading and never written.
use super::path;
use super::vfs::{FileSystem, FsHandle};
use crate::block::{BlockCache, DeviceId, SharedCache};
use crate::consts::BLOCK_SIZE;
use alloc::vec::Vec;
use cupid_api_types::fs::{DirEntry, FileType, OpenFlags, Stat, Whence, seek_target};
use cupid_api_types::{Errno, FsResult};
use heapless::String;

// ─── Constants ─────────────────────────────────────────────────────────────────

const FAT16_EOC: u32 = 0xFFF8;
const FAT16_BAD: u32 = 0xFFF7;
const FAT16_MIN_CLUSTERS: u32 = 4085;
const FAT16_MAX_CLUSTERS: u32 = 65524;

const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_ARCHIVE: u8 = 0x20;
const ATTR_LFN: u8 = 0x0F;
const ATTR_VOLUME_ID: u8 = 0x08;

/// Reserved-byte flags marking an all-lowercase base name / extension.
const NT_LOWER_BASE: u8 = 0x08;
const NT_LOWER_EXT: u8 = 0x10;

const ENTRY_SIZE: usize = 32;
const ENTRIES_PER_SECTOR: usize = BLOCK_SIZE / ENTRY_SIZE;
const DELETED: u8 = 0xE5;

const FORMAT_ROOT_ENTRIES: u32 = 512;

// ─── Timestamps ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FatTimestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl FatTimestamp {
    /// 1980-01-01 00:00:00, the earliest FAT date.
    pub const EPOCH: Self = Self { year: 1980, month: 1, day: 1, hour: 0, minute: 0, second: 0 };

    fn date(&self) -> u16 {
        (self.year.saturating_sub(1980).min(127) << 9)
            | (u16::from(self.month.clamp(1, 12)) << 5)
            | u16::from(self.day.clamp(1, 31))
    }

    fn time(&self) -> u16 {
        (u16::from(self.hour.min(23)) << 11)
            | (u16::from(self.minute.min(59)) << 5)
            | u16::from(self.second.min(59) / 2)
    }
}

/// Source of modification timestamps.
pub type FatClock = fn() -> FatTimestamp;

/// Clock for machines without an RTC: every timestamp is the FAT epoch.
pub fn epoch_clock() -> FatTimestamp {
    FatTimestamp::EPOCH
}

// ─── Boot sector ───────────────────────────────────────────────────────────────

fn le16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

/// Layout constants derived from the BPB.
#[derive(Clone, Copy, Debug)]
struct Geometry {
    sectors_per_cluster: u32,
    reserved_sectors: u32,
    num_fats: u32,
    fat_sectors: u32,
    root_start: u32,
    root_sectors: u32,
    data_start: u32,
    clusters: u32,
}

impl Geometry {
    fn parse(sec: &[u8; BLOCK_SIZE]) -> FsResult<Self> {
        if sec[510] != 0x55 || sec[511] != 0xAA {
            return Err(Errno::InvalidArgument);
        }
        let bytes_per_sector = u32::from(le16(sec, 11));
        let sectors_per_cluster = u32::from(sec[13]);
        let reserved_sectors = u32::from(le16(sec, 14));
        let num_fats = u32::from(sec[16]);
        let root_entries = u32::from(le16(sec, 17));
        let total_sectors = match le16(sec, 19) {
            0 => le32(sec, 32),
            n => u32::from(n),
        };
        let fat_sectors = u32::from(le16(sec, 22));

        if bytes_per_sector != BLOCK_SIZE as u32
            || !sectors_per_cluster.is_power_of_two()
            || reserved_sectors == 0
            || num_fats == 0
            || fat_sectors == 0
            || root_entries == 0
        {
            return Err(Errno::InvalidArgument);
        }

        let root_start = reserved_sectors + num_fats * fat_sectors;
        let root_sectors = (root_entries * ENTRY_SIZE as u32).div_ceil(bytes_per_sector);
        let data_start = root_start + root_sectors;
        let clusters = total_sectors.checked_sub(data_start).ok_or(Errno::InvalidArgument)?
            / sectors_per_cluster;
        if !(FAT16_MIN_CLUSTERS..=FAT16_MAX_CLUSTERS).contains(&clusters) {
            return Err(Errno::InvalidArgument);
        }
        // Every data cluster needs a FAT entry.
        if fat_sectors * (bytes_per_sector / 2) < clusters + 2 {
            return Err(Errno::InvalidArgument);
        }
        Ok(Self {
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            fat_sectors,
            root_start,
            root_sectors,
            data_start,
            clusters,
        })
    }

    fn cluster_bytes(&self) -> u32 {
        self.sectors_per_cluster * BLOCK_SIZE as u32
    }

    fn cluster_lba(&self, cluster: u32) -> u64 {
        u64::from(self.data_start) + u64::from(cluster - 2) * u64::from(self.sectors_per_cluster)
    }

    fn is_data_cluster(&self, cluster: u32) -> bool {
        (2..self.clusters + 2).contains(&cluster)
    }
}

// ─── Directory entry (32 bytes) ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
struct RawDirEntry {
    name: [u8; 8],
    ext: [u8; 3],
    attr: u8,
    nt_flags: u8,
    crt_time: u16,
    crt_date: u16,
    acc_date: u16,
    mod_time: u16,
    mod_date: u16,
    cluster: u32,
    size: u32,
}

impl RawDirEntry {
    fn parse(b: &[u8]) -> Self {
        let mut name = [0u8; 8];
        let mut ext = [0u8; 3];
        name.copy_from_slice(&b[0..8]);
        ext.copy_from_slice(&b[8..11]);
        Self {
            name,
            ext,
            attr: b[11],
            nt_flags: b[12],
            crt_time: le16(b, 14),
            crt_date: le16(b, 16),
            acc_date: le16(b, 18),
            mod_time: le16(b, 22),
            mod_date: le16(b, 24),
            cluster: u32::from(le16(b, 26)),
            size: le32(b, 28),
        }
    }

    fn encode(&self, b: &mut [u8]) {
        b[0..8].copy_from_slice(&self.name);
        b[8..11].copy_from_slice(&self.ext);
        b[11] = self.attr;
        b[12] = self.nt_flags;
        b[13] = 0;
        b[14..16].copy_from_slice(&self.crt_time.to_le_bytes());
        b[16..18].copy_from_slice(&self.crt_date.to_le_bytes());
        b[18..20].copy_from_slice(&self.acc_date.to_le_bytes());
        b[20..22].copy_from_slice(&0u16.to_le_bytes());
        b[22..24].copy_from_slice(&self.mod_time.to_le_bytes());
        b[24..26].copy_from_slice(&self.mod_date.to_le_bytes());
        b[26..28].copy_from_slice(&(self.cluster as u16).to_le_bytes());
        b[28..32].copy_from_slice(&self.size.to_le_bytes());
    }

    fn new(short: &ShortName, attr: u8, cluster: u32, now: FatTimestamp) -> Self {
        Self {
            name: short.name,
            ext: short.ext,
            attr,
            nt_flags: short.nt_flags,
            crt_time: now.time(),
            crt_date: now.date(),
            acc_date: now.date(),
            mod_time: now.time(),
            mod_date: now.date(),
            cluster,
            size: 0,
        }
    }

    fn is_end(&self) -> bool {
        self.name[0] == 0x00
    }

    fn is_free(&self) -> bool {
        self.name[0] == 0x00 || self.name[0] == DELETED
    }

    fn is_lfn(&self) -> bool {
        self.attr & ATTR_LFN == ATTR_LFN
    }

    fn is_volume_id(&self) -> bool {
        self.attr & ATTR_VOLUME_ID != 0 && !self.is_lfn()
    }

    fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    fn is_dot(&self) -> bool {
        self.name[0] == b'.'
    }

    /// Entries that name a real file or directory.
    fn is_visible(&self) -> bool {
        !self.is_free() && !self.is_lfn() && !self.is_volume_id() && !self.is_dot()
    }

    fn matches(&self, short: &ShortName) -> bool {
        self.name == short.name && self.ext == short.ext
    }

    /// `"HELLO   TXT"` → `"HELLO.TXT"`, lowercased where the entry asks for it.
    fn display_name(&self) -> String<12> {
        let mut out = String::new();
        let lower_base = self.nt_flags & NT_LOWER_BASE != 0;
        let lower_ext = self.nt_flags & NT_LOWER_EXT != 0;
        let name_end = self.name.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
        for (i, &b) in self.name[..name_end].iter().enumerate() {
            let b = if i == 0 && b == 0x05 { DELETED } else { b };
            let _ = out.push(if lower_base { b.to_ascii_lowercase() } else { b } as char);
        }
        let ext_end = self.ext.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
        if ext_end > 0 {
            let _ = out.push('.');
            for &b in &self.ext[..ext_end] {
                let _ = out.push(if lower_ext { b.to_ascii_lowercase() } else { b } as char);
            }
        }
        out
    }

    fn dot(name: &[u8], cluster: u32, now: FatTimestamp) -> Self {
        let mut short = ShortName { name: [b' '; 8], ext: [b' '; 3], nt_flags: 0 };
        short.name[..name.len()].copy_from_slice(name);
        Self::new(&short, ATTR_DIRECTORY, cluster, now)
    }
}

// ─── 8.3 names ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ShortName {
    name: [u8; 8],
    ext: [u8; 3],
    nt_flags: u8,
}

fn valid_short_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'()-@^_`{}~".contains(&b)
}

/// Encodes `name` as an 8.3 entry name. Names that do not fit are rejected instead
/// of being mangled, so distinct names never collide.
fn to_short_name(name: &str) -> Option<ShortName> {
    let (base, ext) = match name.rfind('.') {
        Some(i) => (&name[..i], Some(&name[i + 1..])),
        None => (name, None),
    };
    let ext = match ext {
        Some(e) if e.is_empty() => return None,
        Some(e) => e,
        None => "",
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return None;
    }
    if !base.bytes().chain(ext.bytes()).all(valid_short_char) {
        return None;
    }

    let lower_only = |s: &str| s.bytes().any(|b| b.is_ascii_lowercase()) && !s.bytes().any(|b| b.is_ascii_uppercase());
    let mut short = ShortName { name: [b' '; 8], ext: [b' '; 3], nt_flags: 0 };
    for (i, b) in base.bytes().enumerate() {
        short.name[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().enumerate() {
        short.ext[i] = b.to_ascii_uppercase();
    }
    if lower_only(base) {
        short.nt_flags |= NT_LOWER_BASE;
    }
    if lower_only(ext) {
        short.nt_flags |= NT_LOWER_EXT;
    }
    Some(short)
}

// ─── Volume access ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DirLoc {
    Root,
    Cluster(u32),
}

/// Location of a 32-byte directory slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SlotRef {
    lba: u64,
    index: usize,
}

/// Result of resolving a path. The root has no slot.
struct Located {
    entry: RawDirEntry,
    slot: Option<SlotRef>,
}

impl Located {
    fn is_dir(&self) -> bool {
        self.slot.is_none() || self.entry.is_dir()
    }

    fn as_dir(&self) -> DirLoc {
        match self.slot {
            None => DirLoc::Root,
            Some(_) if self.entry.cluster == 0 => DirLoc::Root,
            Some(_) => DirLoc::Cluster(self.entry.cluster),
        }
    }
}

/// The cache, locked, plus the volume layout: every on-disk operation goes through here.
struct Volume<'a> {
    cache: &'a mut BlockCache,
    device: DeviceId,
    geo: Geometry,
    clock: FatClock,
}

impl Volume<'_> {
    fn read_sector(&mut self, lba: u64) -> FsResult<&[u8; BLOCK_SIZE]> {
        Ok(self.cache.read_block(self.device, lba)?)
    }

    fn fat_location(&self, cluster: u32) -> (u64, usize) {
        let offset = cluster as usize * 2;
        (
            u64::from(self.geo.reserved_sectors) + (offset / BLOCK_SIZE) as u64,
            offset % BLOCK_SIZE,
        )
    }

    fn fat_get(&mut self, cluster: u32) -> FsResult<u32> {
        let (lba, off) = self.fat_location(cluster);
        let sec = self.read_sector(lba)?;
        Ok(u32::from(le16(sec, off)))
    }

    /// Updates the entry in every FAT copy.
    fn fat_set(&mut self, cluster: u32, value: u32) -> FsResult<()> {
        let (lba, off) = self.fat_location(cluster);
        for copy in 0..self.geo.num_fats {
            let lba = lba + u64::from(copy * self.geo.fat_sectors);
            self.cache.modify_block(self.device, lba, |b| {
                b[off..off + 2].copy_from_slice(&(value as u16).to_le_bytes());
            })?;
        }
        Ok(())
    }

    fn next_in_chain(&mut self, cluster: u32) -> FsResult<Option<u32>> {
        let next = self.fat_get(cluster)?;
        if next >= FAT16_EOC {
            return Ok(None);
        }
        if next == FAT16_BAD || !self.geo.is_data_cluster(next) {
            log::warn!("fat16: corrupt chain at cluster {cluster} -> {next:#x}");
            return Err(Errno::Io);
        }
        Ok(Some(next))
    }

    /// Claims the first free cluster, marks it end-of-chain and zeroes it.
    fn alloc_cluster(&mut self) -> FsResult<u32> {
        let per_sector = (BLOCK_SIZE / 2) as u32;
        let last = self.geo.clusters + 2;
        let mut cluster = 2;
        while cluster < last {
            let (lba, _) = self.fat_location(cluster);
            let sec = self.read_sector(lba)?;
            let first_in_sector = (cluster / per_sector) * per_sector;
            let found = (cluster..last.min(first_in_sector + per_sector))
                .find(|&c| le16(sec, (c - first_in_sector) as usize * 2) == 0);
            if let Some(free) = found {
                let first = self.geo.cluster_lba(free);
                for s in 0..u64::from(self.geo.sectors_per_cluster) {
                    self.cache.write_block(self.device, first + s, &[0u8; BLOCK_SIZE])?;
                }
                self.fat_set(free, 0xFFFF)?;
                log::trace!("fat16: allocated cluster {free}");
                return Ok(free);
            }
            cluster = first_in_sector + per_sector;
        }
        Err(Errno::NoSpace)
    }

    fn free_chain(&mut self, first: u32) -> FsResult<()> {
        let mut current = if self.geo.is_data_cluster(first) { Some(first) } else { None };
        let mut steps = 0;
        while let Some(cluster) = current {
            steps += 1;
            if steps > self.geo.clusters {
                return Err(Errno::Io);
            }
            current = self.next_in_chain(cluster)?;
            self.fat_set(cluster, 0)?;
        }
        Ok(())
    }

    fn free_clusters(&mut self) -> FsResult<u32> {
        let mut free = 0;
        for cluster in 2..self.geo.clusters + 2 {
            if self.fat_get(cluster)? == 0 {
                free += 1;
            }
        }
        Ok(free)
    }

    fn dir_sectors(&mut self, dir: DirLoc) -> FsResult<Vec<u64>> {
        let mut sectors = Vec::new();
        match dir {
            DirLoc::Root => {
                let start = u64::from(self.geo.root_start);
                sectors.extend(start..start + u64::from(self.geo.root_sectors));
            }
            DirLoc::Cluster(first) => {
                let mut current = Some(first);
                while let Some(cluster) = current {
                    if sectors.len() > (self.geo.clusters * self.geo.sectors_per_cluster) as usize {
                        return Err(Errno::Io);
                    }
                    let lba = self.geo.cluster_lba(cluster);
                    sectors.extend(lba..lba + u64::from(self.geo.sectors_per_cluster));
                    current = self.next_in_chain(cluster)?;
                }
            }
        }
        Ok(sectors)
    }

    fn read_entry(&mut self, slot: SlotRef) -> FsResult<RawDirEntry> {
        let sec = self.read_sector(slot.lba)?;
        let off = slot.index * ENTRY_SIZE;
        Ok(RawDirEntry::parse(&sec[off..off + ENTRY_SIZE]))
    }

    fn write_entry(&mut self, slot: SlotRef, entry: &RawDirEntry) -> FsResult<()> {
        let off = slot.index * ENTRY_SIZE;
        self.cache
            .modify_block(self.device, slot.lba, |b| entry.encode(&mut b[off..off + ENTRY_SIZE]))?;
        Ok(())
    }

    fn find_entry(&mut self, dir: DirLoc, short: &ShortName) -> FsResult<Option<(RawDirEntry, SlotRef)>> {
        for lba in self.dir_sectors(dir)? {
            let sec = self.read_sector(lba)?;
            for index in 0..ENTRIES_PER_SECTOR {
                let entry = RawDirEntry::parse(&sec[index * ENTRY_SIZE..(index + 1) * ENTRY_SIZE]);
                if entry.is_end() {
                    return Ok(None);
                }
                if entry.is_visible() && entry.matches(short) {
                    return Ok(Some((entry, SlotRef { lba, index })));
                }
            }
        }
        Ok(None)
    }

    fn lookup(&mut self, path: &str) -> FsResult<Located> {
        let mut located = Located { entry: RawDirEntry::dot(b".", 0, FatTimestamp::EPOCH), slot: None };
        for component in path::components(path) {
            if !located.is_dir() {
                return Err(Errno::NotADirectory);
            }
            let short = to_short_name(component).ok_or(Errno::NotFound)?;
            let (entry, slot) = self.find_entry(located.as_dir(), &short)?.ok_or(Errno::NotFound)?;
            located = Located { entry, slot: Some(slot) };
        }
        Ok(located)
    }

    /// A free slot in `dir`, growing a subdirectory by one cluster when it is full.
    fn free_slot(&mut self, dir: DirLoc) -> FsResult<SlotRef> {
        let sectors = self.dir_sectors(dir)?;
        for &lba in &sectors {
            let sec = self.read_sector(lba)?;
            if let Some(index) = (0..ENTRIES_PER_SECTOR)
                .find(|i| matches!(sec[i * ENTRY_SIZE], 0x00 | DELETED))
            {
                return Ok(SlotRef { lba, index });
            }
        }
        let DirLoc::Cluster(first) = dir else {
            return Err(Errno::NoSpace);
        };
        let mut last = first;
        while let Some(next) = self.next_in_chain(last)? {
            last = next;
        }
        let grown = self.alloc_cluster()?;
        self.fat_set(last, grown)?;
        Ok(SlotRef { lba: self.geo.cluster_lba(grown), index: 0 })
    }

    fn create_entry(&mut self, parent: DirLoc, short: &ShortName, attr: u8, cluster: u32) -> FsResult<(RawDirEntry, SlotRef)> {
        let slot = self.free_slot(parent)?;
        let entry = RawDirEntry::new(short, attr, cluster, (self.clock)());
        self.write_entry(slot, &entry)?;
        Ok((entry, slot))
    }

    fn dir_is_empty(&mut self, cluster: u32) -> FsResult<bool> {
        for lba in self.dir_sectors(DirLoc::Cluster(cluster))? {
            let sec = self.read_sector(lba)?;
            for index in 0..ENTRIES_PER_SECTOR {
                let entry = RawDirEntry::parse(&sec[index * ENTRY_SIZE..(index + 1) * ENTRY_SIZE]);
                if entry.is_end() {
                    return Ok(true);
                }
                if entry.is_visible() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Cluster holding byte `index * cluster_bytes` of a chain, following the cached
    /// position in `walk` when possible. With `extend`, missing clusters are allocated.
    fn cluster_at(&mut self, handle: &mut FatHandle, index: u32, extend: bool) -> FsResult<Option<u32>> {
        if handle.first_cluster == 0 {
            if !extend {
                return Ok(None);
            }
            handle.first_cluster = self.alloc_cluster()?;
            handle.walk = (0, handle.first_cluster);
        }
        let (mut at, mut cluster) = if handle.walk.0 <= index && handle.walk.1 != 0 {
            handle.walk
        } else {
            (0, handle.first_cluster)
        };
        while at < index {
            cluster = match self.next_in_chain(cluster)? {
                Some(next) => next,
                None if extend => {
                    let grown = self.alloc_cluster()?;
                    self.fat_set(cluster, grown)?;
                    grown
                }
                None => return Ok(None),
            };
            at += 1;
        }
        handle.walk = (at, cluster);
        Ok(Some(cluster))
    }

    /// Reloads first cluster and size from the directory entry, which every handle on
    /// the file shares. A chain cannot be freed while a handle holds it, so the
    /// cached walk survives unless the first cluster moved.
    fn refresh(&mut self, handle: &mut FatHandle) -> FsResult<()> {
        if let Some(slot) = handle.slot {
            let entry = self.read_entry(slot)?;
            if entry.cluster != handle.first_cluster {
                handle.walk = (0, 0);
            }
            handle.first_cluster = entry.cluster;
            handle.size = entry.size;
        }
        Ok(())
    }

    /// Writes the handle's first cluster, size and modification time to its entry.
    fn sync_entry(&mut self, handle: &FatHandle) -> FsResult<()> {
        let Some(slot) = handle.slot else {
            return Ok(());
        };
        let mut entry = self.read_entry(slot)?;
        let now = (self.clock)();
        entry.cluster = handle.first_cluster;
        entry.size = handle.size;
        entry.mod_time = now.time();
        entry.mod_date = now.date();
        entry.acc_date = now.date();
        self.write_entry(slot, &entry)
    }
}

// ─── Driver ────────────────────────────────────────────────────────────────────

struct FatHandle {
    slot: Option<SlotRef>,
    dir: Option<DirLoc>,
    first_cluster: u32,
    size: u32,
    pos: u32,
    flags: OpenFlags,
    /// (chain index, cluster) of the last cluster visited.
    walk: (u32, u32),
    /// Next directory entry index for `readdir`.
    dir_index: usize,
}

pub struct Fat16 {
    cache: SharedCache,
    device: DeviceId,
    geometry: Option<Geometry>,
    handles: Vec<Option<FatHandle>>,
    clock: FatClock,
}

impl Fat16 {
    /// A driver for the volume on `device`. The boot sector is read by `mount`.
    pub fn new(cache: SharedCache, device: DeviceId) -> Self {
        Self { cache, device, geometry: None, handles: Vec::new(), clock: epoch_clock }
    }

    pub fn with_clock(mut self, clock: FatClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Number of unallocated data clusters.
    pub fn free_clusters(&mut self) -> FsResult<u32> {
        self.with_volume(|vol, _| vol.free_clusters())
    }

    pub fn cluster_size(&self) -> Option<u32> {
        self.geometry.map(|g| g.cluster_bytes())
    }

    fn with_volume<R>(
        &mut self,
        f: impl FnOnce(&mut Volume<'_>, &mut Vec<Option<FatHandle>>) -> FsResult<R>,
    ) -> FsResult<R> {
        let geo = self.geometry.ok_or(Errno::Io)?;
        let cache = self.cache.clone();
        let mut guard = cache.lock();
        let mut volume = Volume { cache: &mut guard, device: self.device, geo, clock: self.clock };
        f(&mut volume, &mut self.handles)
    }

    fn handle_mut(handles: &mut [Option<FatHandle>], handle: FsHandle) -> FsResult<&mut FatHandle> {
        handles.get_mut(handle as usize).and_then(Option::as_mut).ok_or(Errno::BadDescriptor)
    }

    fn insert_handle(handles: &mut Vec<Option<FatHandle>>, handle: FatHandle) -> FsHandle {
        match handles.iter().position(Option::is_none) {
            Some(free) => {
                handles[free] = Some(handle);
                free as FsHandle
            }
            None => {
                handles.push(Some(handle));
                (handles.len() - 1) as FsHandle
            }
        }
    }
}

impl FileSystem for Fat16 {
    fn name(&self) -> &'static str {
        "fat16"
    }

    fn mount(&mut self) -> FsResult<()> {
        let geometry = {
            let mut cache = self.cache.lock();
            let sec = cache.read_block(self.device, 0)?;
            Geometry::parse(sec)?
        };
        log::info!(
            "fat16: {} clusters of {} bytes, data at sector {}",
            geometry.clusters,
            geometry.cluster_bytes(),
            geometry.data_start
        );
        self.geometry = Some(geometry);
        Ok(())
    }

    fn unmount(&mut self) -> FsResult<()> {
        let mut cache = self.cache.lock();
        cache.flush(self.device)?;
        cache.invalidate(self.device);
        self.handles.clear();
        self.geometry = None;
        Ok(())
    }

    fn open(&mut self, path: &str, flags: OpenFlags) -> FsResult<FsHandle> {
        self.with_volume(|vol, handles| {
            let (entry, slot) = match vol.lookup(path) {
                Ok(found) => {
                    if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                        return Err(Errno::AlreadyExists);
                    }
                    if found.is_dir() && flags.contains(OpenFlags::WRITE) {
                        return Err(Errno::IsADirectory);
                    }
                    (found.entry, found.slot)
                }
                Err(Errno::NotFound) if flags.contains(OpenFlags::CREATE) => {
                    let (parent_path, name) = path::split_last(path).ok_or(Errno::InvalidArgument)?;
                    let parent = vol.lookup(parent_path)?;
                    if !parent.is_dir() {
                        return Err(Errno::NotADirectory);
                    }
                    let short = to_short_name(name).ok_or(Errno::InvalidArgument)?;
                    let (entry, slot) = vol.create_entry(parent.as_dir(), &short, ATTR_ARCHIVE, 0)?;
                    (entry, Some(slot))
                }
                Err(e) => return Err(e),
            };

            let is_dir = slot.is_none() || entry.is_dir();
            let mut handle = FatHandle {
                slot,
                dir: None,
                first_cluster: entry.cluster,
                size: entry.size,
                pos: 0,
                flags,
                walk: (0, 0),
                dir_index: 0,
            };
            if is_dir {
                handle.dir = Some(Located { entry, slot }.as_dir());
            } else if flags.contains(OpenFlags::TRUNCATE) {
                if handles.iter().flatten().any(|h| h.slot == slot) {
                    return Err(Errno::Busy);
                }
                if handle.size > 0 || handle.first_cluster != 0 {
                    vol.free_chain(handle.first_cluster)?;
                    handle.first_cluster = 0;
                    handle.size = 0;
                    vol.sync_entry(&handle)?;
                }
            }
            Ok(Self::insert_handle(handles, handle))
        })
    }

    fn close(&mut self, handle: FsHandle) -> FsResult<()> {
        Self::handle_mut(&mut self.handles, handle)?;
        self.handles[handle as usize] = None;
        Ok(())
    }

    fn read(&mut self, handle: FsHandle, buf: &mut [u8]) -> FsResult<usize> {
        self.with_volume(|vol, handles| {
            let h = Self::handle_mut(handles, handle)?;
            if h.dir.is_some() {
                return Err(Errno::IsADirectory);
            }
            vol.refresh(h)?;
            let cluster_bytes = vol.geo.cluster_bytes();
            let wanted = (h.size.saturating_sub(h.pos) as usize).min(buf.len());
            let mut done = 0;
            while done < wanted {
                let cluster = vol
                    .cluster_at(h, h.pos / cluster_bytes, false)?
                    .ok_or(Errno::Io)?;
                let in_cluster = h.pos % cluster_bytes;
                let lba = vol.geo.cluster_lba(cluster) + u64::from(in_cluster) / BLOCK_SIZE as u64;
                let off = in_cluster as usize % BLOCK_SIZE;
                let n = (BLOCK_SIZE - off).min(wanted - done);
                let sec = vol.read_sector(lba)?;
                buf[done..done + n].copy_from_slice(&sec[off..off + n]);
                done += n;
                h.pos += n as u32;
            }
            Ok(done)
        })
    }

    fn write(&mut self, handle: FsHandle, buf: &[u8]) -> FsResult<usize> {
        self.with_volume(|vol, handles| {
            let h = Self::handle_mut(handles, handle)?;
            if h.dir.is_some() {
                return Err(Errno::IsADirectory);
            }
            vol.refresh(h)?;
            if h.flags.contains(OpenFlags::APPEND) {
                h.pos = h.size;
            }
            let cluster_bytes = vol.geo.cluster_bytes();
            let room = (u32::MAX - h.pos) as usize;
            let wanted = buf.len().min(room);
            let mut done = 0;
            // Clusters linked before a failure must still reach the entry.
            let outcome = loop {
                if done >= wanted {
                    break Ok(());
                }
                let cluster = match vol.cluster_at(h, h.pos / cluster_bytes, true) {
                    Ok(Some(c)) => c,
                    Ok(None) => break Err(Errno::Io),
                    Err(Errno::NoSpace) if done > 0 => break Ok(()),
                    Err(e) => break Err(e),
                };
                let in_cluster = h.pos % cluster_bytes;
                let lba = vol.geo.cluster_lba(cluster) + u64::from(in_cluster) / BLOCK_SIZE as u64;
                let off = in_cluster as usize % BLOCK_SIZE;
                let n = (BLOCK_SIZE - off).min(wanted - done);
                let src = &buf[done..done + n];
                let stored = if n == BLOCK_SIZE {
                    vol.cache.write_block(vol.device, lba, src)
                } else {
                    vol.cache.modify_block(vol.device, lba, |b| b[off..off + n].copy_from_slice(src))
                };
                if let Err(e) = stored {
                    break Err(e.into());
                }
                done += n;
                h.pos += n as u32;
                h.size = h.size.max(h.pos);
            };
            vol.sync_entry(h)?;
            outcome.map(|()| done)
        })
    }

    fn seek(&mut self, handle: FsHandle, offset: i64, whence: Whence) -> FsResult<u64> {
        self.with_volume(|vol, handles| {
            let h = Self::handle_mut(handles, handle)?;
            vol.refresh(h)?;
            let target = seek_target(u64::from(h.pos), u64::from(h.size), offset, whence)
                .ok_or(Errno::InvalidArgument)?;
            h.pos = u32::try_from(target).map_err(|_| Errno::InvalidArgument)?;
            Ok(target)
        })
    }

    fn stat(&mut self, path: &str) -> FsResult<Stat> {
        self.with_volume(|vol, _| {
            let found = vol.lookup(path)?;
            Ok(if found.is_dir() {
                Stat { size: 0, file_type: FileType::Directory }
            } else {
                Stat { size: u64::from(found.entry.size), file_type: FileType::File }
            })
        })
    }

    fn readdir(&mut self, handle: FsHandle) -> FsResult<Option<DirEntry>> {
        self.with_volume(|vol, handles| {
            let h = Self::handle_mut(handles, handle)?;
            let dir = h.dir.ok_or(Errno::NotADirectory)?;
            let sectors = vol.dir_sectors(dir)?;
            while let Some(&lba) = sectors.get(h.dir_index / ENTRIES_PER_SECTOR) {
                let index = h.dir_index % ENTRIES_PER_SECTOR;
                let sec = vol.read_sector(lba)?;
                let entry = RawDirEntry::parse(&sec[index * ENTRY_SIZE..(index + 1) * ENTRY_SIZE]);
                if entry.is_end() {
                    return Ok(None);
                }
                h.dir_index += 1;
                if entry.is_visible() {
                    let (kind, size) = if entry.is_dir() {
                        (FileType::Directory, 0)
                    } else {
                        (FileType::File, u64::from(entry.size))
                    };
                    return Ok(DirEntry::new(&entry.display_name(), size, kind));
                }
            }
            Ok(None)
        })
    }

    fn mkdir(&mut self, path: &str) -> FsResult<()> {
        self.with_volume(|vol, _| {
            let (parent_path, name) = path::split_last(path).ok_or(Errno::AlreadyExists)?;
            match vol.lookup(path) {
                Ok(_) => return Err(Errno::AlreadyExists),
                Err(Errno::NotFound) => {}
                Err(e) => return Err(e),
            }
            let parent = vol.lookup(parent_path)?;
            if !parent.is_dir() {
                return Err(Errno::NotADirectory);
            }
            let short = to_short_name(name).ok_or(Errno::InvalidArgument)?;
            let cluster = vol.alloc_cluster()?;
            let now = (vol.clock)();
            let parent_cluster = match parent.as_dir() {
                DirLoc::Root => 0,
                DirLoc::Cluster(c) => c,
            };
            let first = SlotRef { lba: vol.geo.cluster_lba(cluster), index: 0 };
            vol.write_entry(first, &RawDirEntry::dot(b".", cluster, now))?;
            vol.write_entry(SlotRef { index: 1, ..first }, &RawDirEntry::dot(b"..", parent_cluster, now))?;
            if let Err(e) = vol.create_entry(parent.as_dir(), &short, ATTR_DIRECTORY, cluster) {
                vol.free_chain(cluster)?;
                return Err(e);
            }
            Ok(())
        })
    }

    fn unlink(&mut self, path: &str) -> FsResult<()> {
        self.with_volume(|vol, handles| {
            let found = vol.lookup(path)?;
            let slot = found.slot.ok_or(Errno::InvalidArgument)?;
            if handles.iter().flatten().any(|h| h.slot == Some(slot)) {
                return Err(Errno::Busy);
            }
            if found.entry.is_dir() && !vol.dir_is_empty(found.entry.cluster)? {
                return Err(Errno::NotEmpty);
            }
            vol.free_chain(found.entry.cluster)?;
            vol.cache.modify_block(vol.device, slot.lba, |b| b[slot.index * ENTRY_SIZE] = DELETED)?;
            Ok(())
        })
    }

    fn sync(&mut self) -> FsResult<()> {
        self.cache.lock().flush(self.device)?;
        Ok(())
    }
}

// ─── mkfs ──────────────────────────────────────────────────────────────────────

/// Lays out an empty FAT16 volume covering the whole of `device`.
pub fn format(cache: &mut BlockCache, device: DeviceId, label: &str) -> FsResult<()> {
    let total = cache.devices().get(device).ok_or(Errno::NotFound)?.sector_count();
    let total = u32::try_from(total).map_err(|_| Errno::InvalidArgument)?;
    let reserved = 1u32;
    let num_fats = 2u32;
    let root_sectors = FORMAT_ROOT_ENTRIES * ENTRY_SIZE as u32 / BLOCK_SIZE as u32;

    let mut sectors_per_cluster = 1u32;
    let (fat_sectors, clusters) = loop {
        let available = total.checked_sub(reserved + root_sectors).ok_or(Errno::InvalidArgument)?;
        let estimate = available / sectors_per_cluster + 2;
        let fat_sectors = (estimate * 2).div_ceil(BLOCK_SIZE as u32);
        let clusters = available.saturating_sub(num_fats * fat_sectors) / sectors_per_cluster;
        if clusters <= FAT16_MAX_CLUSTERS {
            break (fat_sectors, clusters);
        }
        if sectors_per_cluster == 64 {
            return Err(Errno::InvalidArgument);
        }
        sectors_per_cluster *= 2;
    };
    if clusters < FAT16_MIN_CLUSTERS {
        return Err(Errno::InvalidArgument);
    }

    let mut boot = [0u8; BLOCK_SIZE];
    boot[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
    boot[3..11].copy_from_slice(b"CUPIDOS ");
    boot[11..13].copy_from_slice(&(BLOCK_SIZE as u16).to_le_bytes());
    boot[13] = sectors_per_cluster as u8;
    boot[14..16].copy_from_slice(&(reserved as u16).to_le_bytes());
    boot[16] = num_fats as u8;
    boot[17..19].copy_from_slice(&(FORMAT_ROOT_ENTRIES as u16).to_le_bytes());
    match u16::try_from(total) {
        Ok(small) => boot[19..21].copy_from_slice(&small.to_le_bytes()),
        Err(_) => boot[32..36].copy_from_slice(&total.to_le_bytes()),
    }
    boot[21] = 0xF8;
    boot[22..24].copy_from_slice(&(fat_sectors as u16).to_le_bytes());
    boot[24..26].copy_from_slice(&32u16.to_le_bytes());
    boot[26..28].copy_from_slice(&64u16.to_le_bytes());
    boot[36] = 0x80;
    boot[38] = 0x29;
    boot[39..43].copy_from_slice(&(0x4355_5044 ^ total).to_le_bytes());
    let mut volume_label = [b' '; 11];
    for (dst, src) in volume_label.iter_mut().zip(label.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    boot[43..54].copy_from_slice(&volume_label);
    boot[54..62].copy_from_slice(b"FAT16   ");
    boot[510] = 0x55;
    boot[511] = 0xAA;
    cache.write_block(device, 0, &boot)?;

    let zero = [0u8; BLOCK_SIZE];
    for fat in 0..num_fats {
        let start = reserved + fat * fat_sectors;
        for s in 0..fat_sectors {
            let mut sec = zero;
            if s == 0 {
                sec[0..2].copy_from_slice(&0xFFF8u16.to_le_bytes());
                sec[2..4].copy_from_slice(&0xFFFFu16.to_le_bytes());
            }
            cache.write_block(device, u64::from(start + s), &sec)?;
        }
    }
    let root_start = reserved + num_fats * fat_sectors;
    for s in 0..root_sectors {
        cache.write_block(device, u64::from(root_start + s), &zero)?;
    }
    cache.flush(device)?;
    log::info!(
        "fat16: formatted device {} ({clusters} clusters, {sectors_per_cluster} sectors each)",
        device.0
    );
    Ok(())
}

// ─── Unit tests ────────────────────────────────────────────────────────────────
