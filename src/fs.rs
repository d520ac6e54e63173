use crate::mapped_file::MappedFile;
use crate::structures::*;
use anyhow::{anyhow, Result};
use crc::{Crc, CRC_32_ISCSI};
use log::{debug, warn};
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

/// Opening a damaged btrfs filesystem.
///
/// btrfsprogs does quite a lot of work when opening a btrfs filesystem.
/// It uses libblkid to scan devices and identify those that are part of
/// the same filesystem then performs a lot of checks on the validity of
/// the superblock.
///
/// This programme does none of this, requiring the user to provide a list
/// of devices. It does try all three superblock mirrors per device and
/// keeps the one with the highest generation that passes its checksum,
/// since on a damaged filesystem the primary superblock is as likely a
/// casualty as anything else.

/// 64KiB, 64MiB, 256GiB
pub fn superblock_offset(mirror: usize) -> usize {
    if mirror == 0 {
        BTRFS_SUPER_INFO_OFFSET
    } else {
        0x4000 << (BTRFS_SUPER_MIRROR_SHIFT * mirror)
    }
}

fn superblock_offsets() -> [usize; BTRFS_SUPER_MIRROR_MAX] {
    let mut offs = [0_usize; BTRFS_SUPER_MIRROR_MAX];
    for (i, o) in offs.iter_mut().enumerate() {
        *o = superblock_offset(i);
    }
    offs
}

fn load_sb_at(dev: &MappedFile, offset: usize) -> Result<btrfs_super_block> {
    let buf = dev
        .try_slice(offset, BTRFS_SUPER_INFO_SIZE)
        .ok_or_else(|| anyhow!("device too small for superblock at {offset}"))?;
    let sb: btrfs_super_block =
        parse_struct(buf).ok_or_else(|| anyhow!("short superblock read"))?;
    if sb.magic != BTRFS_MAGIC {
        return Err(anyhow!("invalid magic in block"));
    }
    let csum_type = BtrfsCsumType::try_from(sb.csum_type)
        .map_err(|t| anyhow!("unknown checksum type {t}"))?;
    if csum_data(&buf[BTRFS_CSUM_SIZE..], csum_type)? != sb.csum {
        return Err(anyhow!("invalid checksum in superblock"));
    }
    Ok(sb)
}

/// best superblock across the three mirrors
fn load_sb(path: &PathBuf, dev: &MappedFile) -> Result<btrfs_super_block> {
    let mut best: Option<btrfs_super_block> = None;
    for offset in superblock_offsets() {
        match load_sb_at(dev, offset) {
            Ok(sb) => {
                let gen = sb.generation;
                let better = match &best {
                    None => true,
                    Some(b) => gen > b.generation,
                };
                if better {
                    best = Some(sb);
                }
            }
            // an unimplemented checksum algorithm dooms every mirror alike;
            // report it rather than a generic "no valid superblock"
            Err(e)
                if e.downcast_ref::<crate::err::RebuildError>()
                    .map_or(false, |re| matches!(re, crate::err::RebuildError::Io(_))) =>
            {
                return Err(e);
            }
            Err(e) => {
                debug!("{}: superblock mirror at {offset}: {e}", path.display());
            }
        }
    }
    best.ok_or_else(|| anyhow!("{}: no valid superblock on device", path.display()))
}

pub struct SysChunkIter<'a> {
    cursor: std::io::Cursor<&'a [u8]>,
    size: u64,
}

impl SysChunkIter<'_> {
    pub fn new(sb: &btrfs_super_block) -> SysChunkIter {
        SysChunkIter {
            cursor: std::io::Cursor::<&[u8]>::new(&sb.sys_chunk_array),
            size: sb.sys_chunk_array_size as u64,
        }
    }
}

impl Iterator for SysChunkIter<'_> {
    type Item = ChunkInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.position() >= self.size {
            return None;
        }
        let mut stripes = Vec::<btrfs_stripe>::new();

        type DiskKeyBuf = [u8; std::mem::size_of::<btrfs_disk_key>()];
        let mut buf: DiskKeyBuf = [0_u8; std::mem::size_of::<btrfs_disk_key>()];
        self.cursor.read_exact(&mut buf).ok()?;
        let key: btrfs_disk_key = parse_struct(&buf)?;

        type ChunkBuf = [u8; std::mem::size_of::<btrfs_chunk>()];
        let mut buf: ChunkBuf = [0_u8; std::mem::size_of::<btrfs_chunk>()];
        self.cursor.read_exact(&mut buf).ok()?;
        let chunk: btrfs_chunk = parse_struct(&buf)?;

        for _ in 0..chunk.num_stripes {
            type StripeBuf = [u8; std::mem::size_of::<btrfs_stripe>()];
            let mut buf: StripeBuf = [0_u8; std::mem::size_of::<btrfs_stripe>()];
            self.cursor.read_exact(&mut buf).ok()?;
            stripes.push(parse_struct(&buf)?);
        }

        Some(ChunkInfo(key, chunk, stripes))
    }
}

/* the checksums range from 4-32 bytes depending on the algorithm in use. For
simplicity we'll always return a 32 byte buffer, but this could be improved
upon */
pub fn csum_data(buf: &[u8], csum_type: BtrfsCsumType) -> crate::err::Result<BtrfsCsum> {
    match csum_type {
        BtrfsCsumType::CRC32 => Ok(csum_data_crc32(buf)),
        // xxhash/sha256/blake2 are valid mkfs choices we cannot verify yet;
        // nothing on such a filesystem can be trusted, so fail the open
        other => Err(crate::err::RebuildError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("checksum algorithm {other:?} is not implemented"),
        ))),
    }
}

fn csum_data_crc32(buf: &[u8]) -> [u8; BTRFS_CSUM_SIZE] {
    const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
    let mut ret = [0_u8; BTRFS_CSUM_SIZE];
    let cs = CASTAGNOLI.checksum(buf).to_le_bytes();
    ret[..cs.len()].copy_from_slice(&cs[..]);
    ret
}

/// The crc btrfs stamps into DIR_ITEM key offsets: crc32c seeded with ~1,
/// no output xor.
pub fn name_hash(name: &[u8]) -> u32 {
    const NAME_HASH: crc::Algorithm<u32> = crc::Algorithm {
        width: 32,
        poly: 0x1edc6f41,
        init: 0xfffffffe,
        refin: true,
        refout: true,
        xorout: 0,
        check: 0,
        residue: 0,
    };
    const HASHER: Crc<u32> = Crc::<u32>::new(&NAME_HASH);
    HASHER.checksum(name)
}

pub struct DeviceInfo {
    pub path: PathBuf,
    pub file: MappedFile,
    pub devid: LE64,
    pub dev_uuid: BtrfsUuid,
}

pub struct ChunkInfo(pub btrfs_disk_key, pub btrfs_chunk, pub Vec<btrfs_stripe>);

/// processed info about the filesystem
pub struct FsInfo {
    pub fsid: BtrfsFsid,
    pub devid_map: HashMap<LE64, Arc<DeviceInfo>>,
    pub devuuid_map: HashMap<BtrfsUuid, Arc<DeviceInfo>>,
    pub master_sb: btrfs_super_block,
    pub bootstrap_chunks: Vec<ChunkInfo>,
}

impl FsInfo {
    pub fn nodesize(&self) -> u32 {
        self.master_sb.nodesize
    }

    pub fn sectorsize(&self) -> u32 {
        self.master_sb.sectorsize
    }

    pub fn csum_type(&self) -> BtrfsCsumType {
        // validated in load_sb_at
        BtrfsCsumType::try_from(self.master_sb.csum_type).unwrap_or(BtrfsCsumType::CRC32)
    }

    /// bytes each data-sector checksum occupies inside an EXTENT_CSUM run
    pub fn csum_size(&self) -> usize {
        match self.csum_type() {
            BtrfsCsumType::CRC32 => 4,
            BtrfsCsumType::XXHASH => 8,
            BtrfsCsumType::SHA256 | BtrfsCsumType::BLAKE2 => 32,
        }
    }

    /// the uuid node headers carry; differs from fsid only on
    /// metadata_uuid filesystems
    pub fn node_fsid(&self) -> BtrfsFsid {
        if self.master_sb.metadata_uuid != NULL_UUID {
            self.master_sb.metadata_uuid
        } else {
            self.master_sb.fsid
        }
    }
}

/// add specified devices to internal structures and read superblocks
pub fn load_fs(paths: &Vec<PathBuf>) -> Result<FsInfo> {
    let mut fsid = None;
    let mut devid_map = HashMap::<LE64, Arc<DeviceInfo>>::new();
    let mut devuuid_map = HashMap::<BtrfsUuid, Arc<DeviceInfo>>::new();
    let mut master_sb: Option<btrfs_super_block> = None;
    let mut initial_chunks = Vec::new();
    for path in paths {
        debug!("checking {}", path.display());
        let file = MappedFile::open(path)?;
        let sb = load_sb(path, &file)?;
        match fsid {
            None => fsid = Some(sb.fsid),
            Some(f) => {
                if sb.fsid != f {
                    return Err(anyhow!(
                        "{}: belongs to a different filesystem",
                        path.display()
                    ));
                }
            }
        };
        if sb.dev_item.fsid != fsid.unwrap_or_default() {
            warn!(
                "{}: dev_item fsid disagrees with superblock fsid",
                path.display()
            );
        }
        if let Some(prev_sb) = &master_sb {
            let prev_num_devices = prev_sb.num_devices;
            let num_devices = sb.num_devices;
            assert_eq!(prev_num_devices, num_devices);
        }

        let di = Arc::new(DeviceInfo {
            path: path.clone(),
            file,
            devid: sb.dev_item.devid,
            dev_uuid: sb.dev_item.uuid,
        });
        if devid_map.insert(di.devid, Arc::clone(&di)).is_some() {
            return Err(anyhow!("devid {} supplied twice", di.devid));
        }
        devuuid_map.insert(di.dev_uuid, Arc::clone(&di));
        let keep = match &master_sb {
            None => true,
            Some(prev) => sb.generation > prev.generation,
        };
        if keep {
            master_sb = Some(sb);
            initial_chunks.clear();
            for ci in SysChunkIter::new(&sb) {
                initial_chunks.push(ci);
            }
        }
    }
    let sb = master_sb.ok_or_else(|| anyhow!("no device carried a usable superblock"))?;

    Ok(FsInfo {
        fsid: fsid.unwrap_or_default(),
        devid_map,
        devuuid_map,
        master_sb: sb,
        bootstrap_chunks: initial_chunks,
    })
}

/// all-zero superblock for synthesizing filesystems in tests
#[cfg(test)]
pub(crate) fn default_super_block() -> btrfs_super_block {
    let mut sb: btrfs_super_block = parse_struct(&[0_u8; BTRFS_SUPER_INFO_SIZE])
        .expect("superblock is exactly one sector");
    sb.magic = BTRFS_MAGIC;
    sb.num_devices = 1;
    sb.sectorsize = 4096;
    sb.nodesize = 16384;
    sb.stripesize = 4096;
    sb.csum_type = BtrfsCsumType::CRC32 as u16;
    sb
}

#[cfg(test)]
pub(crate) fn test_fs_info() -> FsInfo {
    FsInfo {
        fsid: [7; BTRFS_FSID_SIZE],
        devid_map: HashMap::new(),
        devuuid_map: HashMap::new(),
        master_sb: {
            let mut sb = default_super_block();
            sb.fsid = [7; BTRFS_FSID_SIZE];
            sb
        },
        bootstrap_chunks: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csum_is_stable() {
        let a = csum_data(b"hello btrfs", BtrfsCsumType::CRC32).unwrap();
        let b = csum_data(b"hello btrfs", BtrfsCsumType::CRC32).unwrap();
        assert_eq!(a, b);
        assert_ne!(
            a,
            csum_data(b"hello btrfs!", BtrfsCsumType::CRC32).unwrap()
        );
        // only the first four bytes carry the crc32
        assert_eq!(a[4..], [0_u8; 28]);
    }

    #[test]
    fn unimplemented_csum_algorithm_is_an_error_not_a_panic() {
        for t in [
            BtrfsCsumType::XXHASH,
            BtrfsCsumType::SHA256,
            BtrfsCsumType::BLAKE2,
        ] {
            assert!(csum_data(b"anything", t).is_err());
        }
    }

    #[test]
    fn name_hash_differs_by_name() {
        assert_ne!(name_hash(b"file"), name_hash(b"file2"));
        assert_eq!(name_hash(b"file"), name_hash(b"file"));
    }

    #[test]
    fn mirror_offsets() {
        let offs = superblock_offsets();
        assert_eq!(offs[0], 0x10000);
        assert_eq!(offs[1], 0x4000000);
        assert_eq!(offs[2], 0x4000000000);
    }
}
