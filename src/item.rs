use crate::addr::{LogicalAddr, PhysicalAddr, QualifiedPaddr};
use crate::err::{RebuildError, Result};
use crate::structures::*;

/// Decoded leaf item bodies.
///
/// Items are a tagged union over ~30 on-disc kinds; the variants below are
/// the ones the rebuild rules inspect. Anything else is carried as
/// `Unsupported` so a leaf full of exotic items still parses.

#[derive(Clone, Debug)]
pub enum Item {
    Inode(InodeItem),
    InodeRefs(Vec<InodeRef>),
    DirEnts(Vec<DirEnt>),
    FileExtent(FileExtent),
    ExtentCsum { count: usize },
    Root(RootItem),
    RootRef { dirid: u64, sequence: u64, name: Vec<u8> },
    RootBackRef { dirid: u64, sequence: u64, name: Vec<u8> },
    Extent(ExtentItem),
    TreeBlockRef,
    ExtentDataRef(Vec<ExtentDataRef>),
    SharedBlockRef,
    SharedDataRef { count: u32 },
    BlockGroup { used: u64, flags: u64 },
    DevExtent(DevExtent),
    DevItem { devid: u64, total_bytes: u64, uuid: BtrfsUuid },
    Chunk(ChunkItem),
    UuidSubvol { subvol_ids: Vec<u64> },
    Orphan,
    Unsupported { item_type: BtrfsItemType },
}

#[derive(Clone, Copy, Debug)]
pub struct InodeItem {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub nlink: u32,
    pub mode: u32,
    pub flags: u64,
}

impl InodeItem {
    pub fn is_regular_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn nodatasum(&self) -> bool {
        self.flags & INODE_NODATASUM != 0
    }
}

#[derive(Clone, Debug)]
pub struct InodeRef {
    pub index: u64,
    pub name: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct DirEnt {
    pub location: Key,
    pub transid: u64,
    pub dirent_type: u8,
    pub name: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
pub struct FileExtent {
    pub generation: u64,
    pub ram_bytes: u64,
    pub compression: u8,
    pub extent_type: u8,
    /// None for inline extents
    pub disk: Option<DiskExtent>,
    pub inline_len: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
pub struct DiskExtent {
    pub disk_bytenr: LogicalAddr,
    pub disk_num_bytes: u64,
    pub offset: u64,
    pub num_bytes: u64,
}

impl FileExtent {
    /// bytes of the file this extent covers, starting at key.offset
    pub fn coverage_len(&self) -> u64 {
        match (self.inline_len, self.disk) {
            (Some(n), _) => n,
            (None, Some(d)) => d.num_bytes,
            (None, None) => 0,
        }
    }

    /// a hole written as a regular extent with bytenr 0 needs no csums
    pub fn is_hole(&self) -> bool {
        matches!(self.disk, Some(d) if d.disk_bytenr.0 == 0)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RootItem {
    pub generation: u64,
    pub root_dirid: u64,
    pub bytenr: LogicalAddr,
    pub level: u8,
    pub uuid: BtrfsUuid,
    pub parent_uuid: BtrfsUuid,
}

#[derive(Clone, Debug)]
pub struct ExtentItem {
    pub refs: u64,
    pub generation: u64,
    pub flags: u64,
    pub data_refs: Vec<ExtentDataRef>,
    pub tree_block_roots: Vec<u64>,
}

#[derive(Clone, Copy, Debug)]
pub struct ExtentDataRef {
    pub root: u64,
    pub objectid: u64,
    pub offset: u64,
    pub count: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct DevExtent {
    pub chunk_offset: LogicalAddr,
    pub length: u64,
}

#[derive(Clone, Debug)]
pub struct ChunkItem {
    pub length: u64,
    pub flags: u64,
    pub stripes: Vec<QualifiedPaddr>,
}

fn corrupt(what: &str, key: Key) -> RebuildError {
    RebuildError::NodeCorrupt(format!("{what} in item {key:?}"))
}

fn parse_name(buf: &[u8], at: usize, len: usize, key: Key) -> Result<Vec<u8>> {
    buf.get(at..at + len)
        .map(|s| s.to_vec())
        .ok_or_else(|| corrupt("truncated name", key))
}

/// Decode one leaf item body. The caller hands us the key because several
/// bodies only make sense together with it (csum runs, dev extents,
/// block groups all carry half their meaning in the key).
pub fn parse_item_body(key: Key, buf: &[u8], csum_size: usize) -> Result<Item> {
    use BtrfsItemType::*;
    let item = match key.item_type {
        INODE_ITEM => {
            let raw: btrfs_inode_item =
                parse_struct(buf).ok_or_else(|| corrupt("short inode item", key))?;
            Item::Inode(InodeItem {
                generation: raw.generation,
                transid: raw.transid,
                size: raw.size,
                nlink: raw.nlink,
                mode: raw.mode,
                flags: raw.flags,
            })
        }
        INODE_REF => {
            // several refs may be packed back to back
            let mut refs = Vec::new();
            let mut pos = 0_usize;
            while pos < buf.len() {
                let raw: btrfs_inode_ref = parse_struct(&buf[pos..])
                    .ok_or_else(|| corrupt("short inode ref", key))?;
                let name_at = pos + std::mem::size_of::<btrfs_inode_ref>();
                let name = parse_name(buf, name_at, raw.name_len as usize, key)?;
                pos = name_at + raw.name_len as usize;
                refs.push(InodeRef {
                    index: raw.index,
                    name,
                });
            }
            Item::InodeRefs(refs)
        }
        DIR_ITEM | DIR_INDEX | XATTR_ITEM => {
            let mut ents = Vec::new();
            let mut pos = 0_usize;
            while pos < buf.len() {
                let raw: btrfs_dir_item =
                    parse_struct(&buf[pos..]).ok_or_else(|| corrupt("short dir item", key))?;
                let name_at = pos + std::mem::size_of::<btrfs_dir_item>();
                let name = parse_name(buf, name_at, raw.name_len as usize, key)?;
                let data_at = name_at + raw.name_len as usize;
                let data = parse_name(buf, data_at, raw.data_len as usize, key)?;
                pos = data_at + raw.data_len as usize;
                let location =
                    Key::try_from(raw.location).map_err(|t| {
                        corrupt(&format!("dirent location type {t:#x}"), key)
                    })?;
                ents.push(DirEnt {
                    location,
                    transid: raw.transid,
                    dirent_type: raw.r#type,
                    name,
                    data,
                });
            }
            Item::DirEnts(ents)
        }
        EXTENT_DATA => {
            if buf.len() < FILE_EXTENT_INLINE_HEADER {
                return Err(corrupt("short file extent", key));
            }
            let raw: btrfs_file_extent_item = if buf.len()
                >= std::mem::size_of::<btrfs_file_extent_item>()
            {
                parse_struct(buf).ok_or_else(|| corrupt("short file extent", key))?
            } else {
                // inline extents stop after the shared prefix; pad the rest
                let mut padded = [0_u8; std::mem::size_of::<btrfs_file_extent_item>()];
                padded[..buf.len()].copy_from_slice(buf);
                parse_struct(&padded).ok_or_else(|| corrupt("short file extent", key))?
            };
            let inline = raw.extent_type == FILE_EXTENT_INLINE;
            Item::FileExtent(FileExtent {
                generation: raw.generation,
                ram_bytes: raw.ram_bytes,
                compression: raw.compression,
                extent_type: raw.extent_type,
                disk: if inline {
                    None
                } else {
                    Some(DiskExtent {
                        disk_bytenr: LogicalAddr(raw.disk_bytenr),
                        disk_num_bytes: raw.disk_num_bytes,
                        offset: raw.offset,
                        num_bytes: raw.num_bytes,
                    })
                },
                inline_len: inline.then_some(raw.ram_bytes),
            })
        }
        EXTENT_CSUM => Item::ExtentCsum {
            count: buf.len() / csum_size.max(1),
        },
        ROOT_ITEM => {
            let raw: btrfs_root_item =
                parse_struct(buf).ok_or_else(|| corrupt("short root item", key))?;
            Item::Root(RootItem {
                generation: raw.generation,
                root_dirid: raw.root_dirid,
                bytenr: LogicalAddr(raw.bytenr),
                level: raw.level,
                uuid: raw.uuid,
                parent_uuid: raw.parent_uuid,
            })
        }
        ROOT_REF | ROOT_BACKREF => {
            let raw: btrfs_root_ref =
                parse_struct(buf).ok_or_else(|| corrupt("short root ref", key))?;
            let name = parse_name(
                buf,
                std::mem::size_of::<btrfs_root_ref>(),
                raw.name_len as usize,
                key,
            )?;
            if key.item_type == ROOT_REF {
                Item::RootRef {
                    dirid: raw.dirid,
                    sequence: raw.sequence,
                    name,
                }
            } else {
                Item::RootBackRef {
                    dirid: raw.dirid,
                    sequence: raw.sequence,
                    name,
                }
            }
        }
        EXTENT_ITEM | METADATA_ITEM => Item::Extent(parse_extent_item(key, buf)?),
        TREE_BLOCK_REF => Item::TreeBlockRef,
        EXTENT_DATA_REF => {
            let mut refs = Vec::new();
            let mut pos = 0_usize;
            let one = std::mem::size_of::<btrfs_extent_data_ref>();
            while pos + one <= buf.len() {
                let raw: btrfs_extent_data_ref = parse_struct(&buf[pos..])
                    .ok_or_else(|| corrupt("short extent data ref", key))?;
                refs.push(ExtentDataRef {
                    root: raw.root,
                    objectid: raw.objectid,
                    offset: raw.offset,
                    count: raw.count,
                });
                pos += one;
            }
            Item::ExtentDataRef(refs)
        }
        SHARED_BLOCK_REF => Item::SharedBlockRef,
        SHARED_DATA_REF => {
            let raw: btrfs_shared_data_ref =
                parse_struct(buf).ok_or_else(|| corrupt("short shared data ref", key))?;
            Item::SharedDataRef { count: raw.count }
        }
        BLOCK_GROUP_ITEM => {
            let raw: btrfs_block_group_item =
                parse_struct(buf).ok_or_else(|| corrupt("short block group item", key))?;
            Item::BlockGroup {
                used: raw.used,
                flags: raw.flags,
            }
        }
        DEV_EXTENT => {
            let raw: btrfs_dev_extent =
                parse_struct(buf).ok_or_else(|| corrupt("short dev extent", key))?;
            Item::DevExtent(DevExtent {
                chunk_offset: LogicalAddr(raw.chunk_offset),
                length: raw.length,
            })
        }
        DEV_ITEM => {
            let raw: btrfs_dev_item =
                parse_struct(buf).ok_or_else(|| corrupt("short dev item", key))?;
            Item::DevItem {
                devid: raw.devid,
                total_bytes: raw.total_bytes,
                uuid: raw.uuid,
            }
        }
        CHUNK_ITEM => Item::Chunk(parse_chunk_item(key, buf)?),
        UUID_KEY_SUBVOL | UUID_KEY_RECEIVED_SUBVOL => {
            let mut ids = Vec::new();
            let mut pos = 0_usize;
            while pos + 8 <= buf.len() {
                let mut le = [0_u8; 8];
                le.copy_from_slice(&buf[pos..pos + 8]);
                ids.push(u64::from_le_bytes(le));
                pos += 8;
            }
            Item::UuidSubvol { subvol_ids: ids }
        }
        ORPHAN_ITEM => Item::Orphan,
        other => Item::Unsupported { item_type: other },
    };
    Ok(item)
}

pub fn parse_chunk_item(key: Key, buf: &[u8]) -> Result<ChunkItem> {
    let raw: btrfs_chunk = parse_struct(buf).ok_or_else(|| corrupt("short chunk item", key))?;
    let stripe_size = std::mem::size_of::<btrfs_stripe>();
    let want = std::mem::size_of::<btrfs_chunk>() + raw.num_stripes as usize * stripe_size;
    if buf.len() < want {
        return Err(corrupt("chunk item missing stripes", key));
    }
    let mut stripes = Vec::with_capacity(raw.num_stripes as usize);
    for i in 0..raw.num_stripes as usize {
        let at = std::mem::size_of::<btrfs_chunk>() + i * stripe_size;
        let s: btrfs_stripe =
            parse_struct(&buf[at..]).ok_or_else(|| corrupt("short stripe", key))?;
        stripes.push(QualifiedPaddr {
            devid: s.devid,
            paddr: PhysicalAddr(s.offset),
        });
    }
    Ok(ChunkItem {
        length: raw.length,
        flags: raw.r#type,
        stripes,
    })
}

fn parse_extent_item(key: Key, buf: &[u8]) -> Result<ExtentItem> {
    let head_size = std::mem::size_of::<btrfs_extent_item>();
    let raw: btrfs_extent_item =
        parse_struct(buf).ok_or_else(|| corrupt("short extent item", key))?;
    let mut pos = head_size;
    // METADATA_ITEMs skip the tree_block_info; EXTENT_ITEMs for tree
    // blocks carry it before the inline refs
    if key.item_type == BtrfsItemType::EXTENT_ITEM && raw.flags & EXTENT_FLAG_TREE_BLOCK != 0 {
        pos += std::mem::size_of::<btrfs_tree_block_info>();
    }
    let mut data_refs = Vec::new();
    let mut tree_block_roots = Vec::new();
    while pos < buf.len() {
        let iref: btrfs_extent_inline_ref =
            parse_struct(&buf[pos..]).ok_or_else(|| corrupt("short inline ref", key))?;
        let kind = BtrfsItemType::try_from(iref.r#type)
            .map_err(|t| corrupt(&format!("inline ref type {t:#x}"), key))?;
        match kind {
            BtrfsItemType::TREE_BLOCK_REF => {
                tree_block_roots.push(iref.offset);
                pos += std::mem::size_of::<btrfs_extent_inline_ref>();
            }
            BtrfsItemType::SHARED_BLOCK_REF | BtrfsItemType::SHARED_DATA_REF => {
                pos += std::mem::size_of::<btrfs_extent_inline_ref>();
                if kind == BtrfsItemType::SHARED_DATA_REF {
                    pos += std::mem::size_of::<btrfs_shared_data_ref>();
                }
            }
            BtrfsItemType::EXTENT_DATA_REF => {
                // inline data refs replace the offset field with the full struct
                let at = pos + 1;
                let raw_ref: btrfs_extent_data_ref =
                    parse_struct(&buf[at..]).ok_or_else(|| corrupt("short inline data ref", key))?;
                data_refs.push(ExtentDataRef {
                    root: raw_ref.root,
                    objectid: raw_ref.objectid,
                    offset: raw_ref.offset,
                    count: raw_ref.count,
                });
                pos = at + std::mem::size_of::<btrfs_extent_data_ref>();
            }
            other => {
                return Err(corrupt(&format!("unexpected inline ref {other:?}"), key));
            }
        }
    }
    Ok(ExtentItem {
        refs: raw.refs,
        generation: raw.generation,
        flags: raw.flags,
        data_refs,
        tree_block_roots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(t: BtrfsItemType) -> Key {
        Key::new(256, t, 0)
    }

    #[test]
    fn inode_roundtrip() {
        let raw = btrfs_inode_item {
            generation: 7,
            transid: 7,
            size: 4096,
            nbytes: 4096,
            block_group: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            mode: S_IFREG | 0o644,
            rdev: 0,
            flags: INODE_NODATASUM,
            sequence: 0,
            __reserved: [0; 4],
            atime: btrfs_timespec { sec: 0, nsec: 0 },
            ctime: btrfs_timespec { sec: 0, nsec: 0 },
            mtime: btrfs_timespec { sec: 0, nsec: 0 },
            otime: btrfs_timespec { sec: 0, nsec: 0 },
        };
        let it = parse_item_body(key(BtrfsItemType::INODE_ITEM), struct_bytes(&raw), 4).unwrap();
        match it {
            Item::Inode(i) => {
                assert!(i.is_regular_file());
                assert!(i.nodatasum());
                assert_eq!(i.size, 4096);
            }
            other => panic!("wrong variant {other:?}"),
        }
    }

    #[test]
    fn dirent_name_parsing() {
        let raw = btrfs_dir_item {
            location: Key::new(300, BtrfsItemType::INODE_ITEM, 0).to_disk(),
            transid: 1,
            data_len: 0,
            name_len: 4,
            r#type: 1,
        };
        let mut buf = struct_bytes(&raw).to_vec();
        buf.extend_from_slice(b"file");
        let it = parse_item_body(key(BtrfsItemType::DIR_ITEM), &buf, 4).unwrap();
        match it {
            Item::DirEnts(ents) => {
                assert_eq!(ents.len(), 1);
                assert_eq!(ents[0].name, b"file");
                assert_eq!(ents[0].location.objectid, 300);
            }
            other => panic!("wrong variant {other:?}"),
        }
    }

    #[test]
    fn truncated_dirent_rejected() {
        let raw = btrfs_dir_item {
            location: Key::new(300, BtrfsItemType::INODE_ITEM, 0).to_disk(),
            transid: 1,
            data_len: 0,
            name_len: 100,
            r#type: 1,
        };
        let mut buf = struct_bytes(&raw).to_vec();
        buf.extend_from_slice(b"shrt");
        assert!(parse_item_body(key(BtrfsItemType::DIR_ITEM), &buf, 4).is_err());
    }

    #[test]
    fn chunk_with_stripes() {
        let raw = btrfs_chunk {
            length: 0x100000,
            owner: BTRFS_EXTENT_TREE_OBJECTID,
            stripe_len: 0x10000,
            r#type: BLOCK_GROUP_METADATA | BLOCK_GROUP_RAID1,
            io_align: 0x1000,
            io_width: 0x1000,
            sector_size: 0x1000,
            num_stripes: 2,
            sub_stripes: 0,
        };
        let mut buf = struct_bytes(&raw).to_vec();
        for (devid, off) in [(1_u64, 0x400000_u64), (2, 0x800000)] {
            buf.extend_from_slice(struct_bytes(&btrfs_stripe {
                devid,
                offset: off,
                dev_uuid: NULL_UUID,
            }));
        }
        let parsed = parse_chunk_item(key(BtrfsItemType::CHUNK_ITEM), &buf).unwrap();
        assert_eq!(parsed.length, 0x100000);
        assert_eq!(parsed.stripes.len(), 2);
        assert_eq!(parsed.stripes[1], QualifiedPaddr::new(2, 0x800000));
    }

    #[test]
    fn inline_file_extent() {
        let raw = btrfs_file_extent_item {
            generation: 5,
            ram_bytes: 11,
            compression: 0,
            encryption: 0,
            other_encoding: 0,
            extent_type: FILE_EXTENT_INLINE,
            disk_bytenr: 0,
            disk_num_bytes: 0,
            offset: 0,
            num_bytes: 0,
        };
        // inline bodies carry only the shared prefix plus file content; the
        // content bytes are irrelevant to parsing and elided here
        let buf = &struct_bytes(&raw)[..FILE_EXTENT_INLINE_HEADER];
        let it = parse_item_body(key(BtrfsItemType::EXTENT_DATA), buf, 4).unwrap();
        match it {
            Item::FileExtent(fe) => {
                assert!(fe.disk.is_none());
                assert_eq!(fe.coverage_len(), 11);
            }
            other => panic!("wrong variant {other:?}"),
        }
    }
}
