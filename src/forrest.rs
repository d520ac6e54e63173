use crate::addr::LogicalAddr;
use crate::err::{RebuildError, Result};
use crate::graph::NodeGraph;
use crate::item::Item;
use crate::reader::NodeReader;
use crate::structures::*;
use crate::tree::RebuiltTree;
use log::warn;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Lazily-instantiated collection of rebuilt trees.
///
/// The root tree is the base case: every subvolume's ROOT_ITEM is found by
/// querying the (rebuilt) root tree, and parent uuids resolve through the
/// (rebuilt) uuid tree, so those instantiate without any lookup of their
/// own. The driver seeds them first.

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForrestEvent {
    TreeInstantiated { tree: u64 },
    AddedItem { tree: u64, key: Key },
    AddedRoot { tree: u64, root: LogicalAddr, first: bool },
}

pub struct RebuiltForrest {
    fs: Arc<crate::fs::FsInfo>,
    graph: Arc<NodeGraph>,
    reader: Arc<NodeReader>,
    trees: RwLock<HashMap<u64, Arc<RebuiltTree>>>,
}

impl RebuiltForrest {
    pub fn new(
        fs: Arc<crate::fs::FsInfo>,
        graph: Arc<NodeGraph>,
        reader: Arc<NodeReader>,
    ) -> RebuiltForrest {
        RebuiltForrest {
            fs,
            graph,
            reader,
            trees: RwLock::new(HashMap::new()),
        }
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn reader(&self) -> &NodeReader {
        &self.reader
    }

    pub fn get(&self, tree_id: u64) -> Option<Arc<RebuiltTree>> {
        self.trees.read().get(&tree_id).cloned()
    }

    /// Return the rebuilt tree for `tree_id`, instantiating it if needed.
    /// Instantiation of a subvolume tree can fail with `NoItem` until the
    /// root tree has grown enough roots to expose the ROOT_ITEM; callers
    /// park the request and retry after the next augment round.
    pub fn lookup(
        &self,
        tree_id: u64,
        events: &mut Vec<ForrestEvent>,
    ) -> Result<Arc<RebuiltTree>> {
        if let Some(t) = self.get(tree_id) {
            return Ok(t);
        }

        let (uuid, parent_uuid, declared_root) = if tree_id < BTRFS_FIRST_FREE_OBJECTID
            || tree_id > BTRFS_LAST_FREE_OBJECTID
        {
            // the trees that hold the machinery together have no ROOT_ITEM
            // we could trust anyway; the superblock remembers two of them
            let declared = match tree_id {
                BTRFS_ROOT_TREE_OBJECTID => Some(LogicalAddr(self.fs.master_sb.root)),
                BTRFS_CHUNK_TREE_OBJECTID => Some(LogicalAddr(self.fs.master_sb.chunk_root)),
                _ => None,
            };
            (None, None, declared)
        } else {
            let root_item = self.find_root_item(tree_id, events)?;
            let parent = (root_item.parent_uuid != NULL_UUID).then_some(root_item.parent_uuid);
            if let Some(puuid) = parent {
                match self.resolve_subvol_uuid(puuid, events) {
                    Some(parent_id) => {
                        self.graph.ancestry.set_parent(tree_id, parent_id);
                    }
                    None => warn!(
                        "tree {tree_id}: parent uuid {} does not resolve",
                        hex::encode(puuid)
                    ),
                }
            }
            (Some(root_item.uuid), parent, Some(root_item.bytenr))
        };

        let tree = Arc::new(RebuiltTree::new(tree_id, uuid, parent_uuid, &self.graph));
        {
            let mut trees = self.trees.write();
            // racing instantiations both built the same thing; keep the first
            if let Some(existing) = trees.get(&tree_id) {
                return Ok(Arc::clone(existing));
            }
            trees.insert(tree_id, Arc::clone(&tree));
        }
        events.push(ForrestEvent::TreeInstantiated { tree: tree_id });

        // Bootstrap grafting. Prefer the root block the metadata declares;
        // when that did not survive, fall back to the newest scavenged
        // root the tree owns outright. Wants pull in everything else.
        let initial = declared_root
            .filter(|l| self.graph.node(*l).is_some() && !self.graph.is_bad(*l))
            .or_else(|| {
                self.graph
                    .candidate_roots_owned_by(tree_id)
                    .into_iter()
                    .max_by_key(|n| (n.generation, n.laddr))
                    .map(|n| n.laddr)
            });
        if let Some(root) = initial {
            self.add_root(tree_id, root, events)?;
        }
        Ok(tree)
    }

    fn find_root_item(
        &self,
        tree_id: u64,
        events: &mut Vec<ForrestEvent>,
    ) -> Result<crate::item::RootItem> {
        let root_tree = self.lookup(BTRFS_ROOT_TREE_OBJECTID, events)?;
        let matches = root_tree.range(
            Key::new(tree_id, BtrfsItemType::ROOT_ITEM, 0),
            Key::new(tree_id, BtrfsItemType::ROOT_ITEM, u64::MAX),
        );
        for (_, ptr) in matches {
            match root_tree.read_item(&self.reader, ptr) {
                Ok((_, Item::Root(ri))) => return Ok(ri),
                Ok((k, other)) => warn!(
                    "root tree: {k:?} decoded to unexpected {other:?}"
                ),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("root tree: unreadable ROOT_ITEM for {tree_id}: {e}"),
            }
        }
        Err(RebuildError::NoItem)
    }

    /// uuid tree keys pack the uuid into (objectid, offset) halves
    fn resolve_subvol_uuid(&self, uuid: BtrfsUuid, events: &mut Vec<ForrestEvent>) -> Option<u64> {
        let uuid_tree = self.lookup(BTRFS_UUID_TREE_OBJECTID, events).ok()?;
        let lo = u64::from_le_bytes(uuid[0..8].try_into().ok()?);
        let hi = u64::from_le_bytes(uuid[8..16].try_into().ok()?);
        let key = Key::new(lo, BtrfsItemType::UUID_KEY_SUBVOL, hi);
        let ptr = uuid_tree.lookup(key)?;
        match uuid_tree.read_item(&self.reader, ptr) {
            Ok((_, Item::UuidSubvol { subvol_ids })) => subvol_ids.first().copied(),
            Ok(_) => None,
            Err(e) => {
                warn!("uuid tree: unreadable entry {key:?}: {e}");
                None
            }
        }
    }

    /// Graft `root` into `tree_id`, translating the tree's added-item keys
    /// into forrest events the driver consumes.
    pub fn add_root(
        &self,
        tree_id: u64,
        root: LogicalAddr,
        events: &mut Vec<ForrestEvent>,
    ) -> Result<()> {
        let tree = self.lookup(tree_id, events)?;
        let already = tree.roots().contains(&root);
        let added = tree.add_root(&self.graph, root);
        if !already && tree.roots().contains(&root) {
            events.push(ForrestEvent::AddedRoot {
                tree: tree_id,
                root,
                first: tree.root_count() == 1,
            });
        }
        for key in added {
            events.push(ForrestEvent::AddedItem { tree: tree_id, key });
        }
        Ok(())
    }

    /// terminal observation: what did we manage to reattach where
    pub fn list_roots(&self) -> BTreeMap<u64, BTreeSet<LogicalAddr>> {
        self.trees
            .read()
            .iter()
            .map(|(id, t)| (*id, t.roots()))
            .collect()
    }

    pub fn tree_ids(&self) -> Vec<u64> {
        self.trees.read().keys().copied().collect()
    }
}
