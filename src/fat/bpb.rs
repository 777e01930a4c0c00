//! Boot-sector parsing.
//!
//! The BIOS parameter block is little-endian on disk regardless of host,
//! so the raw struct uses byte-order-aware fields and is read by copy from
//! the boot sector.

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use super::{FatError, FatType};

/// Raw boot sector prefix, through the FAT32 extension.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct RawBpb {
    jump: [u8; 3],
    oem: [u8; 8],
    bytes_per_sector: U16,
    sectors_per_cluster: u8,
    reserved_sectors: U16,
    fat_count: u8,
    root_entries: U16,
    total_sectors16: U16,
    media: u8,
    sectors_per_fat16: U16,
    sectors_per_track: U16,
    head_count: U16,
    hidden_sectors: U32,
    total_sectors32: U32,
    // FAT32 extension; garbage on FAT12/16 volumes and only consulted
    // when sectors_per_fat16 is zero
    sectors_per_fat32: U32,
    ext_flags: U16,
    fs_version: U16,
    root_cluster: U32,
    fsinfo_sector: U16,
    backup_boot_sector: U16,
    reserved: [u8; 12],
    drive_number: u8,
    reserved1: u8,
    boot_signature: u8,
    volume_id: U32,
    volume_label: [u8; 11],
    fs_type: [u8; 8],
}

/// Parsed volume geometry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Layout {
    pub(crate) kind: FatType,
    pub(crate) bytes_per_sector: u32,
    pub(crate) sectors_per_cluster: u32,
    pub(crate) fat_start: u64,
    pub(crate) sectors_per_fat: u32,
    pub(crate) fat_count: u32,
    pub(crate) root_start: u64,
    pub(crate) root_entries: u32,
    pub(crate) root_cluster: u32,
    pub(crate) data_start: u64,
    pub(crate) cluster_count: u32,
}

/// Microsoft's FAT-type thresholds on the data-cluster count.
const FAT12_MAX_CLUSTERS: u32 = 4084;
const FAT16_MAX_CLUSTERS: u32 = 65524;

/// Parse and validate a boot sector.
pub(crate) fn layout(sector: &[u8]) -> Result<Layout, FatError> {
    if sector.len() < 512 || sector[510] != 0x55 || sector[511] != 0xAA {
        return Err(FatError::NoFilesystem);
    }
    let (bpb, _) = RawBpb::read_from_prefix(sector).map_err(|_| FatError::NoFilesystem)?;

    let bytes_per_sector = u32::from(bpb.bytes_per_sector.get());
    let sectors_per_cluster = u32::from(bpb.sectors_per_cluster);
    if !(512..=4096).contains(&bytes_per_sector)
        || !bytes_per_sector.is_power_of_two()
        || sectors_per_cluster == 0
        || !sectors_per_cluster.is_power_of_two()
        || bpb.reserved_sectors.get() == 0
        || bpb.fat_count == 0
    {
        return Err(FatError::NoFilesystem);
    }

    let total_sectors = if bpb.total_sectors16.get() != 0 {
        u32::from(bpb.total_sectors16.get())
    } else {
        bpb.total_sectors32.get()
    };
    let sectors_per_fat = if bpb.sectors_per_fat16.get() != 0 {
        u32::from(bpb.sectors_per_fat16.get())
    } else {
        bpb.sectors_per_fat32.get()
    };
    if total_sectors == 0 || sectors_per_fat == 0 {
        return Err(FatError::NoFilesystem);
    }

    let fat_count = u32::from(bpb.fat_count);
    let root_entries = u32::from(bpb.root_entries.get());
    let root_sectors = (root_entries * 32).div_ceil(bytes_per_sector);
    let fat_start = u64::from(bpb.reserved_sectors.get());
    let root_start = fat_start + u64::from(fat_count * sectors_per_fat);
    let data_start = root_start + u64::from(root_sectors);
    if u64::from(total_sectors) <= data_start {
        return Err(FatError::NoFilesystem);
    }
    let cluster_count = (total_sectors - data_start as u32) / sectors_per_cluster;

    let kind = if cluster_count <= FAT12_MAX_CLUSTERS {
        // FAT12's packed entries buy nothing on this transport
        return Err(FatError::NoFilesystem);
    } else if cluster_count <= FAT16_MAX_CLUSTERS {
        FatType::Fat16
    } else {
        FatType::Fat32
    };

    if kind == FatType::Fat32 {
        if bpb.sectors_per_fat16.get() != 0 || bpb.fs_version.get() != 0 || bpb.root_cluster.get() < 2
        {
            return Err(FatError::NoFilesystem);
        }
    } else if root_entries == 0 {
        return Err(FatError::NoFilesystem);
    }

    Ok(Layout {
        kind,
        bytes_per_sector,
        sectors_per_cluster,
        fat_start,
        sectors_per_fat,
        fat_count,
        root_start,
        root_entries,
        root_cluster: if kind == FatType::Fat32 {
            bpb.root_cluster.get()
        } else {
            0
        },
        data_start,
        cluster_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// A minimal FAT16 boot sector: 20480 sectors of 512 bytes, 4 sectors
    /// per cluster, 2 FATs of 32 sectors, 512 root entries.
    fn fat16_boot() -> Vec<u8> {
        let mut s = vec![0u8; 512];
        put16(&mut s, 11, 512); // bytes per sector
        s[13] = 4; // sectors per cluster
        put16(&mut s, 14, 1); // reserved
        s[16] = 2; // fat count
        put16(&mut s, 17, 512); // root entries
        put16(&mut s, 19, 20480); // total sectors
        put16(&mut s, 22, 32); // sectors per fat
        s[510] = 0x55;
        s[511] = 0xAA;
        s
    }

    #[test]
    fn parses_fat16() {
        let l = layout(&fat16_boot()).unwrap();
        assert_eq!(l.kind, FatType::Fat16);
        assert_eq!(l.bytes_per_sector, 512);
        assert_eq!(l.sectors_per_cluster, 4);
        assert_eq!(l.fat_start, 1);
        assert_eq!(l.root_start, 1 + 64);
        assert_eq!(l.root_entries, 512);
        assert_eq!(l.data_start, 1 + 64 + 32);
        assert_eq!(l.cluster_count, (20480 - 97) / 4);
    }

    #[test]
    fn parses_fat32() {
        let mut s = vec![0u8; 512];
        put16(&mut s, 11, 512);
        s[13] = 8;
        put16(&mut s, 14, 32);
        s[16] = 2;
        put32(&mut s, 32, 1_048_576); // total sectors (32-bit)
        put32(&mut s, 36, 1024); // sectors per fat (32-bit)
        put32(&mut s, 44, 2); // root cluster
        s[510] = 0x55;
        s[511] = 0xAA;
        let l = layout(&s).unwrap();
        assert_eq!(l.kind, FatType::Fat32);
        assert_eq!(l.root_cluster, 2);
        assert_eq!(l.root_entries, 0);
        assert_eq!(l.data_start, 32 + 2048);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut s = fat16_boot();
        s[511] = 0;
        assert_eq!(layout(&s).unwrap_err(), FatError::NoFilesystem);
    }

    #[test]
    fn rejects_fat12_scale_volumes() {
        let mut s = fat16_boot();
        put16(&mut s, 19, 4096); // too few sectors: lands under the FAT12 limit
        assert_eq!(layout(&s).unwrap_err(), FatError::NoFilesystem);
    }
}
