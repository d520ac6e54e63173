use crate::forrest::{ForrestEvent, RebuiltForrest};
use crate::fs::name_hash;
use crate::item::Item;
use crate::structures::*;
use crate::tree::RebuiltTree;
use crate::wants::{OffsetMatch, WantKey};
use log::warn;

/// Per-item-kind rules: what else must exist for this item to make sense.
///
/// Handlers are pure over the rebuilt state: they read, they emit wants,
/// they never mutate a tree. Cross-tree wants (csums, extent back-refs)
/// may hit a subvolume that cannot be instantiated yet; the handler then
/// reports what it is blocked on and the driver parks the item.

#[derive(Default, Debug)]
pub struct HandlerOutput {
    /// (target tree, want)
    pub wants: Vec<(u64, WantKey)>,
    /// tree ids to enqueue for crawling
    pub crawl: Vec<u64>,
    /// FsInconsistency findings, already resolved best-effort
    pub warnings: Vec<String>,
    /// the item could not be processed until this tree exists
    pub blocked_on: Option<u64>,
    /// forrest events produced by on-demand instantiation
    pub events: Vec<ForrestEvent>,
}

/// Lets the driver skip the settle→process hop for items whose handler
/// can never produce anything.
pub fn would_be_noop(t: BtrfsItemType) -> bool {
    use BtrfsItemType::*;
    !matches!(
        t,
        INODE_ITEM
            | INODE_REF
            | DIR_ITEM
            | DIR_INDEX
            | EXTENT_DATA
            | ROOT_ITEM
            | ROOT_REF
            | ROOT_BACKREF
            | EXTENT_ITEM
            | METADATA_ITEM
            | EXTENT_DATA_REF
            | UUID_KEY_SUBVOL
            | UUID_KEY_RECEIVED_SUBVOL
    )
}

pub fn item_wants(
    forrest: &RebuiltForrest,
    tree: &RebuiltTree,
    key: Key,
    item: &Item,
) -> HandlerOutput {
    let mut out = HandlerOutput::default();
    match item {
        Item::Root(_) => {
            // a surviving ROOT_ITEM is the invitation to rebuild that tree
            out.crawl.push(key.objectid);
        }
        Item::Inode(inode) => {
            if inode.is_regular_file() && inode.size > 0 {
                file_extent_wants(forrest, tree, key.objectid, inode.size, &mut out);
            }
        }
        Item::InodeRefs(refs) => {
            // key.offset is the parent directory; each ref should have a
            // matching DIR_INDEX under it
            for r in refs {
                out.wants.push((
                    tree.id,
                    WantKey::new(
                        key.offset,
                        BtrfsItemType::DIR_INDEX,
                        OffsetMatch::Name(r.name.clone()),
                    ),
                ));
            }
        }
        Item::DirEnts(ents) => {
            if key.item_type == BtrfsItemType::XATTR_ITEM {
                return out;
            }
            for ent in ents {
                if key.item_type == BtrfsItemType::DIR_ITEM {
                    let expect = name_hash(&ent.name) as u64;
                    if key.offset != expect {
                        out.warnings.push(format!(
                            "tree {}: DIR_ITEM {key:?} name {:?} hashes to {expect:#x}, not {:#x}",
                            tree.id,
                            String::from_utf8_lossy(&ent.name),
                            key.offset
                        ));
                        continue;
                    }
                }
                match ent.location.item_type {
                    BtrfsItemType::INODE_ITEM => {
                        out.wants.push((
                            tree.id,
                            WantKey::new(
                                ent.location.objectid,
                                BtrfsItemType::INODE_ITEM,
                                OffsetMatch::Exact(0),
                            ),
                        ));
                    }
                    BtrfsItemType::ROOT_ITEM => {
                        // subvolume direntry
                        out.crawl.push(ent.location.objectid);
                    }
                    other => out.warnings.push(format!(
                        "tree {}: direntry {key:?} points at a {other:?}",
                        tree.id
                    )),
                }
            }
        }
        Item::FileExtent(fe) => {
            if let Some(disk) = fe.disk {
                if !fe.is_hole() {
                    csum_wants(
                        forrest,
                        tree,
                        key.objectid,
                        disk.disk_bytenr.0,
                        disk.disk_bytenr.0 + disk.disk_num_bytes,
                        &mut out,
                    );
                }
            }
        }
        Item::Extent(ei) => {
            for r in &ei.data_refs {
                extent_data_ref_want(forrest, r.root, r.objectid, r.offset, &mut out);
                if out.blocked_on.is_some() {
                    return out;
                }
            }
        }
        Item::ExtentDataRef(refs) => {
            for r in refs {
                extent_data_ref_want(forrest, r.root, r.objectid, r.offset, &mut out);
                if out.blocked_on.is_some() {
                    return out;
                }
            }
        }
        Item::RootRef {
            dirid,
            name,
            ..
        } => {
            // key: (parent subvol, ROOT_REF, child subvol)
            out.wants.push((
                BTRFS_ROOT_TREE_OBJECTID,
                WantKey::new(key.offset, BtrfsItemType::ROOT_ITEM, OffsetMatch::Any),
            ));
            out.wants.push((
                key.objectid,
                WantKey::new(*dirid, BtrfsItemType::DIR_ITEM, OffsetMatch::Name(name.clone())),
            ));
        }
        Item::RootBackRef { dirid, name, .. } => {
            // key: (child subvol, ROOT_BACKREF, parent subvol)
            out.wants.push((
                BTRFS_ROOT_TREE_OBJECTID,
                WantKey::new(key.objectid, BtrfsItemType::ROOT_ITEM, OffsetMatch::Any),
            ));
            out.wants.push((
                key.offset,
                WantKey::new(*dirid, BtrfsItemType::DIR_ITEM, OffsetMatch::Name(name.clone())),
            ));
        }
        Item::UuidSubvol { subvol_ids } => {
            for id in subvol_ids {
                out.crawl.push(*id);
            }
        }
        // geometry items were consumed in pass 0; csum runs, orphans and
        // the rest assert nothing about other items
        _ => {}
    }
    out
}

/// an inode of size `size` should be fully covered by EXTENT_DATA items
fn file_extent_wants(
    forrest: &RebuiltForrest,
    tree: &RebuiltTree,
    ino: u64,
    size: u64,
    out: &mut HandlerOutput,
) {
    let reader = forrest.reader();
    let lo = Key::new(ino, BtrfsItemType::EXTENT_DATA, 0);
    let hi = Key::new(ino, BtrfsItemType::EXTENT_DATA, u64::MAX);
    let mut covered = 0_u64;
    let mut gaps: Vec<(u64, u64)> = Vec::new();
    for (k, ptr) in tree.range(lo, hi) {
        let len = match tree.read_item(reader, ptr) {
            Ok((_, Item::FileExtent(fe))) => fe.coverage_len(),
            Ok((k, other)) => {
                out.warnings
                    .push(format!("tree {}: {k:?} decodes to {other:?}", tree.id));
                0
            }
            Err(e) => {
                warn!("tree {}: unreadable extent {k:?}: {e}", tree.id);
                0
            }
        };
        let start = k.offset;
        let end = start + len;
        if end <= covered {
            continue;
        }
        if start > covered {
            gaps.push((covered, start.min(size)));
        }
        covered = covered.max(end);
        if covered >= size {
            break;
        }
    }
    if covered < size {
        gaps.push((covered, size));
    }
    for (glo, ghi) in gaps {
        if glo >= ghi {
            continue;
        }
        out.wants.push((
            tree.id,
            WantKey::new(ino, BtrfsItemType::EXTENT_DATA, OffsetMatch::Range(glo, ghi)),
        ));
    }
}

/// a regular extent should have checksums for its whole on-disk range,
/// unless the owning inode opted out
fn csum_wants(
    forrest: &RebuiltForrest,
    tree: &RebuiltTree,
    ino: u64,
    lo: u64,
    hi: u64,
    out: &mut HandlerOutput,
) {
    if hi <= lo {
        return;
    }
    let reader = forrest.reader();
    if let Some(ptr) = tree.lookup(Key::new(ino, BtrfsItemType::INODE_ITEM, 0)) {
        match tree.read_item(reader, ptr) {
            Ok((_, Item::Inode(inode))) if inode.nodatasum() => return,
            Ok(_) => {}
            Err(e) => warn!("tree {}: unreadable inode {ino}: {e}", tree.id),
        }
    }
    let csum_tree = match forrest.lookup(BTRFS_CSUM_TREE_OBJECTID, &mut out.events) {
        Ok(t) => t,
        Err(e) => {
            warn!("csum tree unavailable: {e}");
            out.blocked_on = Some(BTRFS_CSUM_TREE_OBJECTID);
            return;
        }
    };
    let sectorsize = reader.sectorsize();
    let klo = Key::new(BTRFS_EXTENT_CSUM_OBJECTID, BtrfsItemType::EXTENT_CSUM, 0);
    let khi = Key::new(
        BTRFS_EXTENT_CSUM_OBJECTID,
        BtrfsItemType::EXTENT_CSUM,
        hi - 1,
    );
    let mut covered = lo;
    let mut gaps: Vec<(u64, u64)> = Vec::new();
    for (k, ptr) in csum_tree.range(klo, khi) {
        let len = match csum_tree.read_item(reader, ptr) {
            Ok((_, Item::ExtentCsum { count })) => count as u64 * sectorsize,
            Ok(_) => 0,
            Err(e) => {
                warn!("csum tree: unreadable run {k:?}: {e}");
                0
            }
        };
        let start = k.offset;
        let end = start + len;
        if end <= covered {
            continue;
        }
        if start > covered {
            gaps.push((covered, start.min(hi)));
        }
        covered = covered.max(end);
        if covered >= hi {
            break;
        }
    }
    if covered < hi {
        gaps.push((covered, hi));
    }
    for (glo, ghi) in gaps {
        if glo >= ghi {
            continue;
        }
        out.wants.push((
            BTRFS_CSUM_TREE_OBJECTID,
            WantKey::new(
                BTRFS_EXTENT_CSUM_OBJECTID,
                BtrfsItemType::EXTENT_CSUM,
                OffsetMatch::Range(glo, ghi),
            ),
        ));
    }
}

/// extent back-refs assert the referenced FS tree holds the EXTENT_DATA
fn extent_data_ref_want(
    forrest: &RebuiltForrest,
    root: u64,
    objectid: u64,
    offset: u64,
    out: &mut HandlerOutput,
) {
    use crate::err::RebuildError;
    match forrest.lookup(root, &mut out.events) {
        Ok(_) => {
            out.wants.push((
                root,
                WantKey::new(objectid, BtrfsItemType::EXTENT_DATA, OffsetMatch::Exact(offset)),
            ));
        }
        Err(RebuildError::NoItem) => {
            out.blocked_on = Some(root);
        }
        Err(e) => {
            warn!("tree {root} unavailable for back-ref: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::DirEnt;

    #[test]
    fn noop_classification() {
        assert!(would_be_noop(BtrfsItemType::EXTENT_CSUM));
        assert!(would_be_noop(BtrfsItemType::CHUNK_ITEM));
        assert!(would_be_noop(BtrfsItemType::XATTR_ITEM));
        assert!(!would_be_noop(BtrfsItemType::ROOT_ITEM));
        assert!(!would_be_noop(BtrfsItemType::DIR_ITEM));
        assert!(!would_be_noop(BtrfsItemType::INODE_ITEM));
    }

    use crate::reader::NodeReader;
    use crate::volume::VolumeMapper;
    use std::sync::Arc;

    fn test_forrest() -> RebuiltForrest {
        let fs = Arc::new(crate::fs::test_fs_info());
        let mapper = Arc::new(VolumeMapper::new());
        let reader = Arc::new(NodeReader::new(Arc::clone(&fs), mapper));
        RebuiltForrest::new(fs, Arc::new(crate::graph::NodeGraph::new()), reader)
    }

    fn dirent(name: &[u8]) -> Item {
        Item::DirEnts(vec![DirEnt {
            location: Key::new(300, BtrfsItemType::INODE_ITEM, 0),
            transid: 1,
            dirent_type: 1,
            name: name.to_vec(),
            data: Vec::new(),
        }])
    }

    #[test]
    fn dirent_hash_mismatch_yields_warning_not_want() {
        let forrest = test_forrest();
        let tree = RebuiltTree::new(257, None, None, forrest.graph());

        // 0xDEAD is not crc32c("file")
        let bad = item_wants(
            &forrest,
            &tree,
            Key::new(256, BtrfsItemType::DIR_ITEM, 0xDEAD),
            &dirent(b"file"),
        );
        assert_eq!(bad.warnings.len(), 1);
        assert!(bad.wants.is_empty());

        let good = item_wants(
            &forrest,
            &tree,
            Key::new(256, BtrfsItemType::DIR_ITEM, name_hash(b"file") as u64),
            &dirent(b"file"),
        );
        assert!(good.warnings.is_empty());
        assert_eq!(
            good.wants,
            vec![(
                257,
                WantKey::new(300, BtrfsItemType::INODE_ITEM, OffsetMatch::Exact(0))
            )]
        );
    }

    #[test]
    fn root_item_triggers_crawl() {
        let forrest = test_forrest();
        let tree = RebuiltTree::new(BTRFS_ROOT_TREE_OBJECTID, None, None, forrest.graph());
        let ri = Item::Root(crate::item::RootItem {
            generation: 9,
            root_dirid: 256,
            bytenr: crate::addr::LogicalAddr(0x10000),
            level: 0,
            uuid: [1; 16],
            parent_uuid: NULL_UUID,
        });
        let out = item_wants(
            &forrest,
            &tree,
            Key::new(257, BtrfsItemType::ROOT_ITEM, 0),
            &ri,
        );
        assert_eq!(out.crawl, vec![257]);
        assert!(out.wants.is_empty());
    }

    #[test]
    fn inode_ref_wants_matching_dir_index() {
        let forrest = test_forrest();
        let tree = RebuiltTree::new(257, None, None, forrest.graph());
        let item = Item::InodeRefs(vec![crate::item::InodeRef {
            index: 2,
            name: b"log".to_vec(),
        }]);
        let out = item_wants(
            &forrest,
            &tree,
            Key::new(300, BtrfsItemType::INODE_REF, 256),
            &item,
        );
        assert_eq!(
            out.wants,
            vec![(
                257,
                WantKey::new(
                    256,
                    BtrfsItemType::DIR_INDEX,
                    OffsetMatch::Name(b"log".to_vec())
                )
            )]
        );
    }
}
