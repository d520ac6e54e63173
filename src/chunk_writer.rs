use crate::addr::LogicalAddr;
use crate::err::{RebuildError, Result};
use crate::fs::{csum_data, FsInfo};
use crate::structures::*;
use crate::volume::VolumeMapper;
use log::{info, warn};

/// Archival write-back of the reconstructed chunk tree.
///
/// One synthesized leaf holding every DEV_ITEM and CHUNK_ITEM we know of
/// is written at the superblock's chunk-tree address, so stock btrfs
/// tooling can at least resolve logical addresses again. Everything must
/// fit in a single node; when it does not we refuse rather than truncate.

struct PendingItem {
    key: Key,
    body: Vec<u8>,
}

fn dev_item_body(fs: &FsInfo, devid: u64) -> Vec<u8> {
    let mut item = fs.master_sb.dev_item;
    if item.devid != devid {
        item.devid = devid;
        if let Some(dev) = fs.devid_map.get(&devid) {
            item.uuid = dev.dev_uuid;
            item.total_bytes = dev.file.len() as u64;
        }
    }
    struct_bytes(&item).to_vec()
}

fn chunk_item_body(fs: &FsInfo, chunk: &crate::volume::ChunkMapping) -> Vec<u8> {
    let raw = btrfs_chunk {
        length: chunk.size,
        owner: BTRFS_EXTENT_TREE_OBJECTID,
        stripe_len: 0x10000,
        r#type: chunk.flags.unwrap_or(0),
        io_align: fs.sectorsize(),
        io_width: fs.sectorsize(),
        sector_size: fs.sectorsize(),
        num_stripes: chunk.stripes.len() as u16,
        sub_stripes: 1,
    };
    let mut body = struct_bytes(&raw).to_vec();
    for stripe in &chunk.stripes {
        let dev_uuid = fs
            .devid_map
            .get(&stripe.devid)
            .map(|d| d.dev_uuid)
            .unwrap_or(NULL_UUID);
        body.extend_from_slice(struct_bytes(&btrfs_stripe {
            devid: stripe.devid,
            offset: stripe.paddr.0,
            dev_uuid,
        }));
    }
    body
}

/// Serialize the chunk tree into one leaf image. Exposed separately from
/// the write so callers can inspect before committing bytes to a patient
/// that is already on the table.
pub fn build_chunk_tree_leaf(fs: &FsInfo, mapper: &VolumeMapper) -> Result<Vec<u8>> {
    let nodesize = fs.nodesize() as usize;
    let mut pending: Vec<PendingItem> = Vec::new();

    let mut devids: Vec<u64> = fs.devid_map.keys().copied().collect();
    devids.sort_unstable();
    for devid in devids {
        pending.push(PendingItem {
            key: Key::new(1, BtrfsItemType::DEV_ITEM, devid),
            body: dev_item_body(fs, devid),
        });
    }
    for chunk in mapper.chunks() {
        if chunk.stripes.is_empty() {
            // block-group-only mappings carry no geometry worth writing
            continue;
        }
        if chunk.flags.is_none() {
            warn!(
                "chunk at {} has no known flags; writing it typeless",
                chunk.laddr
            );
        }
        pending.push(PendingItem {
            key: Key::new(
                BTRFS_FIRST_CHUNK_TREE_OBJECTID,
                BtrfsItemType::CHUNK_ITEM,
                chunk.laddr.0,
            ),
            body: chunk_item_body(fs, &chunk),
        });
    }
    pending.sort_by_key(|p| p.key);

    let hdr_size = std::mem::size_of::<btrfs_header>();
    let item_size = std::mem::size_of::<btrfs_item>();
    let bodies: usize = pending.iter().map(|p| p.body.len()).sum();
    let needed = hdr_size + pending.len() * item_size + bodies;
    if needed > nodesize {
        return Err(RebuildError::FsInconsistency(format!(
            "reconstructed chunk tree needs {needed} bytes but a node holds {nodesize}; \
             multi-node chunk trees are not supported"
        )));
    }

    let mut block = vec![0_u8; nodesize];
    // item data is packed at the tail, item headers at the front, offsets
    // counted from the end of the node header
    let mut data_end = nodesize;
    for (i, p) in pending.iter().enumerate() {
        data_end -= p.body.len();
        block[data_end..data_end + p.body.len()].copy_from_slice(&p.body);
        let item = btrfs_item {
            key: p.key.to_disk(),
            offset: (data_end - hdr_size) as u32,
            size: p.body.len() as u32,
        };
        let at = hdr_size + i * item_size;
        block[at..at + item_size].copy_from_slice(struct_bytes(&item));
    }

    let header = btrfs_header {
        csum: [0; BTRFS_CSUM_SIZE],
        fsid: fs.node_fsid(),
        bytenr: fs.master_sb.chunk_root,
        flags: 0,
        chunk_tree_uuid: NULL_UUID,
        generation: fs.master_sb.chunk_root_generation,
        owner: BTRFS_CHUNK_TREE_OBJECTID,
        nritems: pending.len() as u32,
        level: 0,
    };
    block[..hdr_size].copy_from_slice(struct_bytes(&header));
    let csum = csum_data(&block[BTRFS_CSUM_SIZE..], fs.csum_type())?;
    block[..BTRFS_CSUM_SIZE].copy_from_slice(&csum);
    Ok(block)
}

/// Write the synthesized leaf to every mirror of the chunk-tree address
/// and refresh superblock checksums on every present device.
pub fn write_chunk_tree(fs: &FsInfo, mapper: &VolumeMapper) -> Result<()> {
    let block = build_chunk_tree_leaf(fs, mapper)?;
    let laddr = LogicalAddr(fs.master_sb.chunk_root);
    mapper.write_at(&block, laddr)?;
    info!(
        "wrote reconstructed chunk tree ({} bytes) at {laddr}",
        block.len()
    );
    rewrite_superblock_csums(fs)?;
    Ok(())
}

fn rewrite_superblock_csums(fs: &FsInfo) -> Result<()> {
    for dev in fs.devid_map.values() {
        for mirror in 0..BTRFS_SUPER_MIRROR_MAX {
            let offset = crate::fs::superblock_offset(mirror);
            let Some(raw) = dev.file.try_slice(offset, BTRFS_SUPER_INFO_SIZE) else {
                continue;
            };
            let Some(sb) = parse_struct::<btrfs_super_block>(raw) else {
                continue;
            };
            if sb.magic != BTRFS_MAGIC {
                continue;
            }
            let csum = csum_data(&raw[BTRFS_CSUM_SIZE..], fs.csum_type())?;
            if csum != sb.csum {
                dev.file.write_at(offset, &csum)?;
                info!(
                    "device {}: refreshed superblock checksum at {offset:#x}",
                    dev.devid
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::QualifiedPaddr;
    use crate::fs::DeviceInfo;
    use crate::mapped_file::MappedFile;
    use crate::volume::ChunkMapping;
    use std::collections::BTreeSet;
    use std::io::Write;
    use std::sync::Arc;

    fn fs_with_device(size: usize) -> (crate::fs::FsInfo, tempfile::NamedTempFile) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0_u8; size]).unwrap();
        tmp.flush().unwrap();
        let mut fs = crate::fs::test_fs_info();
        fs.master_sb.chunk_root = 0x1000000;
        fs.master_sb.dev_item.devid = 1;
        let dev = Arc::new(DeviceInfo {
            path: tmp.path().to_path_buf(),
            file: MappedFile::open(tmp.path()).unwrap(),
            devid: 1,
            dev_uuid: [9; 16],
        });
        fs.devid_map.insert(1, dev);
        (fs, tmp)
    }

    #[test]
    fn leaf_roundtrips_through_parser() {
        let (fs, _tmp) = fs_with_device(0x100000);
        let mapper = VolumeMapper::new();
        mapper
            .add_mapping(
                ChunkMapping::new(
                    LogicalAddr(0x1000000),
                    0x80000,
                    [QualifiedPaddr::new(1, 0x20000)].into_iter().collect(),
                )
                .with_flags(BLOCK_GROUP_SYSTEM),
            )
            .unwrap();
        let block = build_chunk_tree_leaf(&fs, &mapper).unwrap();
        assert_eq!(block.len(), fs.nodesize() as usize);

        let header: btrfs_header = parse_struct(&block).unwrap();
        assert_eq!({ header.owner }, BTRFS_CHUNK_TREE_OBJECTID);
        assert_eq!({ header.nritems }, 2); // one DEV_ITEM + one CHUNK_ITEM
        assert_eq!(
            csum_data(&block[BTRFS_CSUM_SIZE..], fs.csum_type()).unwrap(),
            header.csum
        );

        // second item is the chunk; walk the item table
        let hdr_size = std::mem::size_of::<btrfs_header>();
        let item_size = std::mem::size_of::<btrfs_item>();
        let item: btrfs_item = parse_struct(&block[hdr_size + item_size..]).unwrap();
        let key = Key::try_from(item.key).unwrap();
        assert_eq!(key.item_type, BtrfsItemType::CHUNK_ITEM);
        assert_eq!(key.offset, 0x1000000);
        let at = hdr_size + item.offset as usize;
        let chunk = crate::item::parse_chunk_item(key, &block[at..at + item.size as usize])
            .unwrap();
        assert_eq!(chunk.length, 0x80000);
        assert_eq!(chunk.stripes, vec![QualifiedPaddr::new(1, 0x20000)]);
    }

    #[test]
    fn oversized_chunk_tree_refused() {
        let (fs, _tmp) = fs_with_device(0x100000);
        let mapper = VolumeMapper::new();
        // enough disjoint single-stripe chunks to overflow one node
        for i in 0..1000_u64 {
            mapper
                .add_mapping(ChunkMapping::new(
                    LogicalAddr(0x10000000 + i * 0x200000),
                    0x100000,
                    [QualifiedPaddr::new(1, 0x100000000 + i * 0x200000)]
                        .into_iter()
                        .collect(),
                ))
                .unwrap();
        }
        assert!(matches!(
            build_chunk_tree_leaf(&fs, &mapper),
            Err(RebuildError::FsInconsistency(_))
        ));
    }

    #[test]
    fn written_tree_reads_back() {
        let (fs, _tmp) = fs_with_device(0x100000);
        let mapper = VolumeMapper::new();
        mapper
            .add_physical_volume(1, Arc::clone(&fs.devid_map[&1]))
            .unwrap();
        mapper
            .add_mapping(
                ChunkMapping::new(
                    LogicalAddr(0x1000000),
                    0x80000,
                    [QualifiedPaddr::new(1, 0x20000)].into_iter().collect(),
                )
                .with_flags(BLOCK_GROUP_SYSTEM),
            )
            .unwrap();
        write_chunk_tree(&fs, &mapper).unwrap();
        let mut back = vec![0_u8; fs.nodesize() as usize];
        mapper
            .read_at(&mut back, LogicalAddr(fs.master_sb.chunk_root))
            .unwrap();
        let header: btrfs_header = parse_struct(&back).unwrap();
        assert_eq!({ header.bytenr }, { fs.master_sb.chunk_root });
        assert_eq!(
            csum_data(&back[BTRFS_CSUM_SIZE..], fs.csum_type()).unwrap(),
            header.csum
        );
    }
}
