use crate::addr::LogicalAddr;
use crate::err::{RebuildError, Result};
use crate::graph::NodeGraph;
use crate::item::{parse_item_body, Item};
use crate::reader::{NodeBody, NodeExpectations, NodeReader};
use crate::structures::{BtrfsUuid, Key};
use log::warn;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// One reconstructed B-tree.
///
/// A rebuilt tree has no single root: it accumulates scavenged subtrees
/// whose owner is the tree itself or a CoW ancestor. `items` is the
/// accepted content; `potential_items` is what could still be added from
/// leaves no accepted root reaches yet. Both indices answer queries by
/// (node, slot) pointer and bodies are re-read from disk on demand.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ItemPtr {
    pub node: LogicalAddr,
    pub slot: usize,
}

struct TreeState {
    roots: BTreeSet<LogicalAddr>,
    /// leaves already reachable from an accepted root
    covered: HashSet<LogicalAddr>,
}

pub struct RebuiltTree {
    pub id: u64,
    pub uuid: Option<BtrfsUuid>,
    pub parent_uuid: Option<BtrfsUuid>,
    state: Mutex<TreeState>,
    items: RwLock<BTreeMap<Key, ItemPtr>>,
    potential: RwLock<BTreeMap<Key, ItemPtr>>,
    /// every (key, pointer) in an acceptable scavenged leaf; frozen at
    /// construction
    candidates: BTreeMap<Key, Vec<ItemPtr>>,
}

impl RebuiltTree {
    /// Index the scavenged leaves usable by this tree. Ancestry for the
    /// tree's whole parent chain is known by the time the forrest calls
    /// this, because instantiation resolves parents recursively first.
    pub fn new(
        id: u64,
        uuid: Option<BtrfsUuid>,
        parent_uuid: Option<BtrfsUuid>,
        graph: &NodeGraph,
    ) -> RebuiltTree {
        let mut candidates: BTreeMap<Key, Vec<ItemPtr>> = BTreeMap::new();
        for leaf in graph.leaves() {
            if graph.is_bad(leaf.laddr) {
                continue;
            }
            if !graph.ancestry.is_acceptable_owner(id, leaf.owner) {
                continue;
            }
            for (slot, key) in leaf.items.iter().enumerate() {
                candidates.entry(*key).or_default().push(ItemPtr {
                    node: leaf.laddr,
                    slot,
                });
            }
        }
        let tree = RebuiltTree {
            id,
            uuid,
            parent_uuid,
            state: Mutex::new(TreeState {
                roots: BTreeSet::new(),
                covered: HashSet::new(),
            }),
            items: RwLock::new(BTreeMap::new()),
            potential: RwLock::new(BTreeMap::new()),
            candidates,
        };
        // everything starts out merely potential
        {
            let state = tree.state.lock();
            let mut potential = tree.potential.write();
            for key in tree.candidates.keys() {
                if let Some(best) = tree.best_candidate(graph, *key, &state.covered) {
                    potential.insert(*key, best);
                }
            }
        }
        tree
    }

    /// replacement rule: newer generation wins, then smaller CoW distance
    /// to this tree, then lower laddr
    pub fn should_replace(
        &self,
        graph: &NodeGraph,
        incumbent: LogicalAddr,
        challenger: LogicalAddr,
    ) -> bool {
        if incumbent == challenger {
            return false;
        }
        let (Some(inc), Some(ch)) = (graph.node(incumbent), graph.node(challenger)) else {
            return false;
        };
        if ch.generation != inc.generation {
            return ch.generation > inc.generation;
        }
        let di = graph.ancestry.cow_distance(self.id, inc.owner);
        let dc = graph.ancestry.cow_distance(self.id, ch.owner);
        if dc != di {
            // an unknown distance loses to a known one
            return match (dc, di) {
                (Some(a), Some(b)) => a < b,
                (Some(_), None) => true,
                (None, _) => false,
            };
        }
        ch.laddr < inc.laddr
    }

    fn best_candidate(
        &self,
        graph: &NodeGraph,
        key: Key,
        covered: &HashSet<LogicalAddr>,
    ) -> Option<ItemPtr> {
        let mut best: Option<ItemPtr> = None;
        for cand in self.candidates.get(&key)? {
            if covered.contains(&cand.node) {
                continue;
            }
            best = match best {
                None => Some(*cand),
                Some(cur) if self.should_replace(graph, cur.node, cand.node) => Some(*cand),
                keep => keep,
            };
        }
        best
    }

    /// Graft a scavenged subtree. Every acceptable leaf under `root` moves
    /// from potential to accepted, the replacement rule arbitrating each
    /// key. Returns the keys whose accepted pointer was added or upgraded;
    /// the driver settles those.
    pub fn add_root(&self, graph: &NodeGraph, root: LogicalAddr) -> Vec<Key> {
        let mut events = Vec::new();
        let Some(root_node) = graph.node(root) else {
            warn!("tree {}: cannot add unknown root {root}", self.id);
            return events;
        };
        if !graph.ancestry.is_acceptable_owner(self.id, root_node.owner) {
            warn!(
                "tree {}: root {root} owned by {} is not an ancestor",
                self.id, root_node.owner
            );
            return events;
        }

        let mut state = self.state.lock();
        if !state.roots.insert(root) {
            return events;
        }
        let new_leaves: Vec<LogicalAddr> = graph
            .descendants(root)
            .into_iter()
            .filter(|l| {
                graph
                    .node(*l)
                    .map(|n| {
                        n.level == 0
                            && graph.ancestry.is_acceptable_owner(self.id, n.owner)
                            && !state.covered.contains(l)
                    })
                    .unwrap_or(false)
            })
            .collect();

        // fixed order: items before potential_items
        let mut items = self.items.write();
        let mut potential = self.potential.write();

        let mut touched_keys = BTreeSet::new();
        for leaf in &new_leaves {
            let Some(node) = graph.node(*leaf) else { continue };
            for (slot, key) in node.items.iter().enumerate() {
                touched_keys.insert(*key);
                let ptr = ItemPtr {
                    node: *leaf,
                    slot,
                };
                match items.get(key) {
                    None => {
                        items.insert(*key, ptr);
                        events.push(*key);
                    }
                    Some(cur) if cur.node == ptr.node => {}
                    Some(cur) => {
                        if self.should_replace(graph, cur.node, ptr.node) {
                            items.insert(*key, ptr);
                            events.push(*key);
                        }
                    }
                }
            }
        }

        state.covered.extend(new_leaves.iter().copied());

        for key in touched_keys {
            match self.best_candidate(graph, key, &state.covered) {
                Some(best) => potential.insert(key, best),
                None => potential.remove(&key),
            };
        }

        events
    }

    pub fn lookup(&self, key: Key) -> Option<ItemPtr> {
        self.items.read().get(&key).copied()
    }

    pub fn potential_lookup(&self, key: Key) -> Option<ItemPtr> {
        self.potential.read().get(&key).copied()
    }

    /// Walk the accepted items with a signed-direction comparator. The
    /// comparator must be monotone over key order; the first key it calls
    /// Equal on is returned.
    pub fn search<F>(&self, cmp: F) -> Option<(Key, ItemPtr)>
    where
        F: Fn(&Key) -> std::cmp::Ordering,
    {
        let items = self.items.read();
        for (k, v) in items.iter() {
            match cmp(k) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Some((*k, *v)),
                std::cmp::Ordering::Greater => return None,
            }
        }
        None
    }

    /// snapshot of the accepted pointers in `[lo, hi]`
    pub fn range(&self, lo: Key, hi: Key) -> Vec<(Key, ItemPtr)> {
        self.items
            .read()
            .range(lo..=hi)
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    /// candidate pointers in `[lo, hi]`, accepted or not; the augment
    /// resolver works from these
    pub fn candidate_range(&self, lo: Key, hi: Key) -> Vec<(Key, ItemPtr)> {
        self.candidates
            .range(lo..=hi)
            .flat_map(|(k, v)| v.iter().map(move |p| (*k, *p)))
            .collect()
    }

    /// reader lock over the accepted index; hold it briefly. When both
    /// indices are needed, take this one first.
    pub fn acquire_items(&self) -> RwLockReadGuard<'_, BTreeMap<Key, ItemPtr>> {
        self.items.read()
    }

    pub fn acquire_potential_items(&self) -> RwLockReadGuard<'_, BTreeMap<Key, ItemPtr>> {
        self.potential.read()
    }

    /// snapshot of every accepted (key, pointer), in key order
    pub fn items(&self) -> Vec<(Key, ItemPtr)> {
        self.acquire_items()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    pub fn item_count(&self) -> usize {
        self.acquire_items().len()
    }

    pub fn potential_count(&self) -> usize {
        self.acquire_potential_items().len()
    }

    /// Re-read an item body from disk. No cache: pointers are cheap and
    /// bodies are only needed while an item is being processed.
    pub fn read_item(&self, reader: &NodeReader, ptr: ItemPtr) -> Result<(Key, Item)> {
        let node = reader.read_node_at_logical(
            ptr.node,
            &NodeExpectations {
                level: Some(0),
                ..Default::default()
            },
        )?;
        let NodeBody::Leaf(items) = &node.body else {
            return Err(RebuildError::NodeCorrupt(format!(
                "expected leaf at {}",
                ptr.node
            )));
        };
        let leaf_item = items.get(ptr.slot).ok_or_else(|| {
            RebuildError::NodeCorrupt(format!("slot {} missing from leaf {}", ptr.slot, ptr.node))
        })?;
        let item = parse_item_body(leaf_item.key, &leaf_item.data, reader.csum_size())?;
        Ok((leaf_item.key, item))
    }

    /// candidate roots containing `leaf`, filtered to owners this tree may
    /// graft
    pub fn leaf_to_roots(&self, graph: &NodeGraph, leaf: LogicalAddr) -> BTreeSet<LogicalAddr> {
        graph
            .leaf_to_roots(leaf)
            .into_iter()
            .filter(|r| {
                graph
                    .node(*r)
                    .map(|n| graph.ancestry.is_acceptable_owner(self.id, n.owner))
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn roots(&self) -> BTreeSet<LogicalAddr> {
        self.state.lock().roots.clone()
    }

    pub fn root_count(&self) -> usize {
        self.state.lock().roots.len()
    }
}
