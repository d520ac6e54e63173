use crate::addr::LogicalAddr;
use crate::structures::*;
use std::collections::{BTreeMap, BTreeSet};

/// Human-readable output for the recovery report.

pub fn uuid_str(uuid: &BtrfsUuid) -> String {
    std::format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&uuid[0..4]),
        hex::encode(&uuid[4..6]),
        hex::encode(&uuid[6..8]),
        hex::encode(&uuid[8..10]),
        hex::encode(&uuid[10..])
    )
}

pub fn fmt_treeid(tree_id: u64) -> String {
    let name = match tree_id {
        BTRFS_ROOT_TREE_OBJECTID => "ROOT_TREE",
        BTRFS_EXTENT_TREE_OBJECTID => "EXTENT_TREE",
        BTRFS_CHUNK_TREE_OBJECTID => "CHUNK_TREE",
        BTRFS_DEV_TREE_OBJECTID => "DEV_TREE",
        BTRFS_FS_TREE_OBJECTID => "FS_TREE",
        BTRFS_CSUM_TREE_OBJECTID => "CSUM_TREE",
        BTRFS_QUOTA_TREE_OBJECTID => "QUOTA_TREE",
        BTRFS_UUID_TREE_OBJECTID => "UUID_TREE",
        BTRFS_FREE_SPACE_TREE_OBJECTID => "FREE_SPACE_TREE",
        BTRFS_BLOCK_GROUP_TREE_OBJECTID => "BLOCK_GROUP_TREE",
        BTRFS_DATA_RELOC_TREE_OBJECTID => "DATA_RELOC_TREE",
        _ => return format!("{tree_id}"),
    };
    format!("{tree_id} ({name})")
}

pub fn dump_sb(sb: &btrfs_super_block) {
    let sectorsize = sb.sectorsize;
    let nodesize = sb.nodesize;
    let generation = sb.generation;

    println!("sector size: {sectorsize}");
    println!("node size: {nodesize}");
    println!("generation: {generation}");
    println!("fsid: {}", uuid_str(&sb.fsid));
}

pub fn dump_roots(roots: &BTreeMap<u64, BTreeSet<LogicalAddr>>) {
    for (tree_id, set) in roots {
        if set.is_empty() {
            println!("tree {}: no roots recovered", fmt_treeid(*tree_id));
            continue;
        }
        let list: Vec<String> = set.iter().map(|l| format!("{l}")).collect();
        println!(
            "tree {}: {} root(s): {}",
            fmt_treeid(*tree_id),
            set.len(),
            list.join(", ")
        );
    }
}

pub fn dump_tree_contents(forrest: &crate::forrest::RebuiltForrest) {
    let mut ids = forrest.tree_ids();
    ids.sort_unstable();
    for id in ids {
        let Some(tree) = forrest.get(id) else { continue };
        println!(
            "tree {}: {} item(s) accepted, {} still potential",
            fmt_treeid(id),
            tree.item_count(),
            tree.potential_count()
        );
    }
}
