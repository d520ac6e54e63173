use crate::addr::LogicalAddr;
use crate::graph::NodeGraph;
use crate::item::Item;
use crate::reader::NodeReader;
use crate::structures::{BtrfsItemType, Key};
use crate::tree::RebuiltTree;
use log::warn;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// A want is a declaration that some item ought to exist in some tree.
/// Unsatisfied wants are what drive grafting: the resolver hunts the node
/// graph for scavenged subtrees that would supply the missing items.

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum OffsetMatch {
    Any,
    Exact(u64),
    /// half-open `[lo, hi)`
    Range(u64, u64),
    Name(Vec<u8>),
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct WantKey {
    pub object_id: u64,
    pub item_type: BtrfsItemType,
    pub offset: OffsetMatch,
}

impl WantKey {
    pub fn new(object_id: u64, item_type: BtrfsItemType, offset: OffsetMatch) -> WantKey {
        WantKey {
            object_id,
            item_type,
            offset,
        }
    }

    /// tree-key interval that could contain a satisfying item
    pub fn key_bounds(&self) -> (Key, Key) {
        let (lo, hi) = match &self.offset {
            OffsetMatch::Any | OffsetMatch::Name(_) => (0, u64::MAX),
            OffsetMatch::Exact(n) => (*n, *n),
            OffsetMatch::Range(lo, hi) => (*lo, hi.saturating_sub(1).max(*lo)),
        };
        (
            Key::new(self.object_id, self.item_type, lo),
            Key::new(self.object_id, self.item_type, hi),
        )
    }

    /// wants with zero candidates are only worth remembering when they
    /// would match a bounded set of keys
    pub fn cacheable_when_empty(&self) -> bool {
        matches!(self.offset, OffsetMatch::Any | OffsetMatch::Exact(_))
    }
}

/// Per-tree cache of wants we have already chased, so the driver never
/// recomputes the same candidate hunt twice.
#[derive(Default)]
pub struct WantCache {
    zero: HashSet<WantKey>,
    single: HashMap<WantKey, LogicalAddr>,
    multi: HashMap<WantKey, BTreeSet<LogicalAddr>>,
}

impl WantCache {
    pub fn contains(&self, want: &WantKey) -> bool {
        self.zero.contains(want)
            || self.single.contains_key(want)
            || self.multi.contains_key(want)
    }

    /// Record the candidate roots for a want. Returns false when the want
    /// was dropped instead of cached (unbounded match with no candidates).
    pub fn store(&mut self, want: WantKey, roots: &BTreeSet<LogicalAddr>) -> bool {
        match roots.len() {
            0 => {
                if !want.cacheable_when_empty() {
                    return false;
                }
                self.zero.insert(want);
            }
            1 => {
                self.single
                    .insert(want, *roots.iter().next().expect("len checked"));
            }
            _ => {
                self.multi.insert(want, roots.clone());
            }
        }
        true
    }

    /// Forget everything; used when the tree grows its first root and old
    /// negative answers stop being meaningful.
    pub fn drain(&mut self) -> Vec<WantKey> {
        let mut all: Vec<WantKey> = self.zero.drain().collect();
        all.extend(self.single.drain().map(|(k, _)| k));
        all.extend(self.multi.drain().map(|(k, _)| k));
        all
    }

    pub fn zero_len(&self) -> usize {
        self.zero.len()
    }
}

/// Is the want already met by the tree's accepted items?
pub fn want_satisfied(tree: &RebuiltTree, reader: &NodeReader, want: &WantKey) -> bool {
    let (lo, hi) = want.key_bounds();
    match &want.offset {
        OffsetMatch::Any | OffsetMatch::Exact(_) | OffsetMatch::Range(..) => {
            !tree.range(lo, hi).is_empty()
        }
        OffsetMatch::Name(name) => {
            for (_, ptr) in tree.range(lo, hi) {
                match tree.read_item(reader, ptr) {
                    Ok((_, item)) => {
                        if item_matches_name(&item, name) {
                            return true;
                        }
                    }
                    Err(e) => warn!("tree {}: unreadable item at {ptr:?}: {e}", tree.id),
                }
            }
            false
        }
    }
}

fn item_matches_name(item: &Item, name: &[u8]) -> bool {
    match item {
        Item::DirEnts(ents) => ents.iter().any(|e| e.name == name),
        Item::InodeRefs(refs) => refs.iter().any(|r| r.name == name),
        Item::RootRef { name: n, .. } | Item::RootBackRef { name: n, .. } => n == name,
        _ => false,
    }
}

/// The roots whose subtrees would satisfy the want: find candidate leaves
/// by key, filter name matches by body, then union their acceptable root
/// sets.
pub fn want_candidates(
    tree: &RebuiltTree,
    graph: &NodeGraph,
    reader: &NodeReader,
    want: &WantKey,
) -> BTreeSet<LogicalAddr> {
    let (lo, hi) = want.key_bounds();
    let mut leaves: BTreeSet<LogicalAddr> = BTreeSet::new();
    for (key, ptr) in tree.candidate_range(lo, hi) {
        if let OffsetMatch::Name(name) = &want.offset {
            match tree.read_item(reader, ptr) {
                Ok((_, item)) if item_matches_name(&item, name) => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!(
                        "tree {}: dropping unreadable candidate {key:?} at {ptr:?}: {e}",
                        tree.id
                    );
                    continue;
                }
            }
        }
        leaves.insert(ptr.node);
    }
    let mut roots = BTreeSet::new();
    for leaf in leaves {
        roots.extend(tree.leaf_to_roots(graph, leaf));
    }
    roots
}

/// Pick the roots to graft this round. Every want's candidate list may
/// contribute at most one accepted root; subject to that, maximize the
/// number of wants served, then prefer close CoW distance, then high
/// generation, then low laddr for determinism.
pub fn choose_roots(
    tree: &RebuiltTree,
    graph: &NodeGraph,
    lists: &BTreeMap<WantKey, BTreeSet<LogicalAddr>>,
) -> Vec<LogicalAddr> {
    #[derive(PartialEq, Eq, PartialOrd, Ord)]
    struct Score {
        count_desc: std::cmp::Reverse<usize>,
        distance: u64,
        generation_desc: std::cmp::Reverse<u64>,
        laddr: LogicalAddr,
    }

    let mut membership: HashMap<LogicalAddr, Vec<&WantKey>> = HashMap::new();
    for (want, roots) in lists {
        for root in roots {
            membership.entry(*root).or_default().push(want);
        }
    }

    let mut scored: Vec<(Score, LogicalAddr)> = membership
        .iter()
        .filter_map(|(root, wants)| {
            let node = graph.node(*root)?;
            let distance = graph
                .ancestry
                .cow_distance(tree.id, node.owner)
                .unwrap_or(u64::MAX);
            Some((
                Score {
                    count_desc: std::cmp::Reverse(wants.len()),
                    distance,
                    generation_desc: std::cmp::Reverse(node.generation),
                    laddr: *root,
                },
                *root,
            ))
        })
        .collect();
    scored.sort();

    let mut illegal: HashSet<LogicalAddr> = HashSet::new();
    let mut chosen = Vec::new();
    for (_, root) in scored {
        if illegal.contains(&root) {
            continue;
        }
        chosen.push(root);
        // accepting this root burns every list it sits on: their other
        // members must not also be accepted
        for want in &membership[&root] {
            for other in &lists[*want] {
                if *other != root {
                    illegal.insert(*other);
                }
            }
        }
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{LeafItem, NodeBody, ParsedNode};

    #[test]
    fn zero_candidates_tiering() {
        let mut cache = WantCache::default();
        let none = BTreeSet::new();
        let exact = WantKey::new(5, BtrfsItemType::INODE_ITEM, OffsetMatch::Exact(0));
        assert!(cache.store(exact.clone(), &none));
        assert!(cache.contains(&exact));
        assert_eq!(cache.zero_len(), 1);

        // an unbounded want with no candidates is not worth caching
        let range = WantKey::new(
            5,
            BtrfsItemType::EXTENT_DATA,
            OffsetMatch::Range(0, 4096),
        );
        assert!(!cache.store(range.clone(), &none));
        assert!(!cache.contains(&range));

        let name = WantKey::new(5, BtrfsItemType::DIR_ITEM, OffsetMatch::Name(b"x".to_vec()));
        assert!(!cache.store(name, &none));
    }

    #[test]
    fn single_and_multi_tiers() {
        let mut cache = WantCache::default();
        let one: BTreeSet<_> = [LogicalAddr(0x100)].into_iter().collect();
        let two: BTreeSet<_> = [LogicalAddr(0x100), LogicalAddr(0x200)].into_iter().collect();
        let w1 = WantKey::new(1, BtrfsItemType::INODE_ITEM, OffsetMatch::Any);
        let w2 = WantKey::new(2, BtrfsItemType::INODE_ITEM, OffsetMatch::Any);
        assert!(cache.store(w1.clone(), &one));
        assert!(cache.store(w2.clone(), &two));
        assert!(cache.contains(&w1));
        assert!(cache.contains(&w2));
        // storing again is harmless
        assert!(cache.store(w1.clone(), &one));
        assert_eq!(cache.drain().len(), 2);
        assert!(!cache.contains(&w1));
    }

    #[test]
    fn key_bounds_shapes() {
        let w = WantKey::new(9, BtrfsItemType::EXTENT_DATA, OffsetMatch::Range(100, 200));
        let (lo, hi) = w.key_bounds();
        assert_eq!(lo.offset, 100);
        assert_eq!(hi.offset, 199);
        let w = WantKey::new(9, BtrfsItemType::INODE_ITEM, OffsetMatch::Exact(3));
        let (lo, hi) = w.key_bounds();
        assert_eq!((lo.offset, hi.offset), (3, 3));
    }

    fn leaf(laddr: u64, gen: u64, owner: u64, objectids: &[u64]) -> ParsedNode {
        ParsedNode {
            laddr: LogicalAddr(laddr),
            level: 0,
            generation: gen,
            owner,
            body: NodeBody::Leaf(
                objectids
                    .iter()
                    .map(|o| LeafItem {
                        key: Key::new(*o, BtrfsItemType::INODE_ITEM, 0),
                        data: Vec::new(),
                    })
                    .collect(),
            ),
        }
    }

    #[test]
    fn resolver_prefers_roots_covering_more_wants() {
        let mut g = NodeGraph::new();
        // root 100 satisfies wants for 1 and 2; root 200 only want 1
        g.insert_node(&leaf(100, 5, 257, &[1, 2]));
        g.insert_node(&leaf(200, 9, 257, &[1]));
        g.final_check();
        let tree = RebuiltTree::new(257, None, None, &g);

        let mut lists = BTreeMap::new();
        let w1 = WantKey::new(1, BtrfsItemType::INODE_ITEM, OffsetMatch::Any);
        let w2 = WantKey::new(2, BtrfsItemType::INODE_ITEM, OffsetMatch::Any);
        lists.insert(
            w1,
            [LogicalAddr(100), LogicalAddr(200)].into_iter().collect(),
        );
        lists.insert(w2, [LogicalAddr(100)].into_iter().collect());

        let chosen = choose_roots(&tree, &g, &lists);
        // root 100 serves both wants; root 200 shares w1's list with it and
        // becomes illegal
        assert_eq!(chosen, vec![LogicalAddr(100)]);
    }

    #[test]
    fn resolver_no_two_roots_from_one_list() {
        let mut g = NodeGraph::new();
        g.insert_node(&leaf(100, 5, 257, &[1]));
        g.insert_node(&leaf(200, 9, 257, &[1]));
        g.insert_node(&leaf(300, 7, 257, &[2]));
        g.final_check();
        let tree = RebuiltTree::new(257, None, None, &g);

        let mut lists = BTreeMap::new();
        lists.insert(
            WantKey::new(1, BtrfsItemType::INODE_ITEM, OffsetMatch::Any),
            [LogicalAddr(100), LogicalAddr(200)].into_iter().collect(),
        );
        lists.insert(
            WantKey::new(2, BtrfsItemType::INODE_ITEM, OffsetMatch::Any),
            [LogicalAddr(300)].into_iter().collect(),
        );
        let chosen = choose_roots(&tree, &g, &lists);
        assert_eq!(chosen.len(), 2);
        // generation 9 beats generation 5 inside want 1's list
        assert!(chosen.contains(&LogicalAddr(200)));
        assert!(chosen.contains(&LogicalAddr(300)));
        assert!(!chosen.contains(&LogicalAddr(100)));
    }

    #[test]
    fn resolver_generation_tiebreak() {
        let mut g = NodeGraph::new();
        g.insert_node(&leaf(100, 5, 257, &[1]));
        g.insert_node(&leaf(200, 9, 257, &[1]));
        g.final_check();
        let tree = RebuiltTree::new(257, None, None, &g);
        let mut lists = BTreeMap::new();
        lists.insert(
            WantKey::new(1, BtrfsItemType::INODE_ITEM, OffsetMatch::Any),
            [LogicalAddr(100), LogicalAddr(200)].into_iter().collect(),
        );
        let chosen = choose_roots(&tree, &g, &lists);
        assert_eq!(chosen, vec![LogicalAddr(200)]);
    }
}
