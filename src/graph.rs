use crate::addr::LogicalAddr;
use crate::reader::{NodeBody, ParsedNode};
use crate::structures::Key;
use log::warn;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};

/// In-memory graph of every scavenged node.
///
/// Nodes carry only what the header and key list give us; item bodies are
/// re-read from disk when somebody actually wants them. Edges carry the
/// parent's assertions about the child, so a stale parent pointing at a
/// reallocated block is detectable without touching the disk again.

#[derive(Clone, Debug)]
pub struct GraphNode {
    pub laddr: LogicalAddr,
    pub level: u8,
    pub generation: u64,
    pub owner: u64,
    pub items: Vec<Key>,
    pub min_item_key: Option<Key>,
    pub max_item_key: Option<Key>,
}

#[derive(Clone, Debug)]
pub struct GraphEdge {
    pub from_node: LogicalAddr,
    pub from_slot: usize,
    pub to_node: LogicalAddr,
    pub to_level: u8,
    pub to_generation: u64,
    pub to_key: Key,
}

/// Snapshot parent relations between tree ids, learned as ROOT_ITEMs are
/// decoded. Interior-mutable because trees keep being discovered while the
/// node graph itself is long frozen.
#[derive(Default)]
pub struct TreeAncestry {
    parent: RwLock<HashMap<u64, u64>>,
}

impl TreeAncestry {
    pub fn set_parent(&self, child: u64, parent: u64) {
        if child == parent {
            return;
        }
        self.parent.write().insert(child, parent);
    }

    fn chain_distance(&self, from: u64, to: u64) -> Option<u64> {
        let parent = self.parent.read();
        let mut cur = from;
        let mut dist = 0_u64;
        let mut seen = HashSet::new();
        loop {
            if cur == to {
                return Some(dist);
            }
            if !seen.insert(cur) {
                return None; // parent loop in corrupt metadata
            }
            cur = *parent.get(&cur)?;
            dist += 1;
        }
    }

    /// steps along the snapshot-parent chain, whichever direction reaches;
    /// 0 iff equal, None when unrelated
    pub fn cow_distance(&self, a: u64, b: u64) -> Option<u64> {
        self.chain_distance(a, b).or_else(|| self.chain_distance(b, a))
    }

    /// is `owner` usable in a tree with id `tree`?
    pub fn is_acceptable_owner(&self, tree: u64, owner: u64) -> bool {
        self.chain_distance(tree, owner).is_some()
    }
}

#[derive(Default)]
pub struct NodeGraph {
    nodes: HashMap<LogicalAddr, GraphNode>,
    edges_out: HashMap<LogicalAddr, Vec<GraphEdge>>,
    edges_in: HashMap<LogicalAddr, Vec<LogicalAddr>>,
    bad: HashMap<LogicalAddr, String>,
    /// nodes on a pointer cycle; poisoned, never traversed
    cyclic: HashSet<LogicalAddr>,
    pub ancestry: TreeAncestry,
}

impl NodeGraph {
    pub fn new() -> NodeGraph {
        NodeGraph::default()
    }

    pub fn insert_node(&mut self, node: &ParsedNode) {
        let gn = GraphNode {
            laddr: node.laddr,
            level: node.level,
            generation: node.generation,
            owner: node.owner,
            items: if node.is_leaf() {
                node.item_keys()
            } else {
                Vec::new()
            },
            min_item_key: node.min_item_key(),
            max_item_key: node.max_item_key(),
        };
        if let NodeBody::Internal(ptrs) = &node.body {
            let edges: Vec<GraphEdge> = ptrs
                .iter()
                .enumerate()
                .map(|(slot, p)| GraphEdge {
                    from_node: node.laddr,
                    from_slot: slot,
                    to_node: p.blockptr,
                    to_level: node.level - 1,
                    to_generation: p.generation,
                    to_key: p.key,
                })
                .collect();
            self.edges_out.insert(node.laddr, edges);
        }
        self.nodes.insert(node.laddr, gn);
    }

    pub fn insert_bad_node(&mut self, laddr: LogicalAddr, why: String) {
        self.bad.insert(laddr, why);
    }

    pub fn node(&self, laddr: LogicalAddr) -> Option<&GraphNode> {
        self.nodes.get(&laddr)
    }

    pub fn is_bad(&self, laddr: LogicalAddr) -> bool {
        self.bad.contains_key(&laddr) || self.cyclic.contains(&laddr)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn bad_count(&self) -> usize {
        self.bad.len()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values().filter(|n| n.level == 0)
    }

    /// After all nodes are in: drop edges whose child is missing, bad, or
    /// inconsistent with the parent's assertions; find cycles; build the
    /// reverse index. Returns human-readable complaints.
    pub fn final_check(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut kept: HashMap<LogicalAddr, Vec<GraphEdge>> = HashMap::new();
        for (from, edges) in &self.edges_out {
            let mut ok = Vec::new();
            for e in edges {
                if let Some(why) = self.bad.get(&e.to_node) {
                    errors.push(format!(
                        "node {} slot {} points at bad node {} ({})",
                        from, e.from_slot, e.to_node, why
                    ));
                    continue;
                }
                let Some(child) = self.nodes.get(&e.to_node) else {
                    errors.push(format!(
                        "node {} slot {} points at unscavenged node {}",
                        from, e.from_slot, e.to_node
                    ));
                    continue;
                };
                let consistent = child.level == e.to_level
                    && child.generation == e.to_generation
                    && child.min_item_key == Some(e.to_key);
                if !consistent {
                    errors.push(format!(
                        "node {} slot {} expects ({}, gen {}, {:?}) but {} is (level {}, gen {}, {:?})",
                        from,
                        e.from_slot,
                        e.to_level,
                        e.to_generation,
                        e.to_key,
                        e.to_node,
                        child.level,
                        child.generation,
                        child.min_item_key,
                    ));
                    continue;
                }
                ok.push(e.clone());
            }
            kept.insert(*from, ok);
        }
        self.edges_out = kept;

        self.detect_cycles(&mut errors);

        let mut edges_in: HashMap<LogicalAddr, Vec<LogicalAddr>> = HashMap::new();
        for (from, edges) in &self.edges_out {
            if self.cyclic.contains(from) {
                continue;
            }
            for e in edges {
                edges_in.entry(e.to_node).or_default().push(*from);
            }
        }
        self.edges_in = edges_in;

        for err in &errors {
            warn!("node graph: {err}");
        }
        errors
    }

    /// Cycles can only appear through bugs or deliberate corruption; mark
    /// every participant so traversals never loop.
    fn detect_cycles(&mut self, errors: &mut Vec<String>) {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }
        let mut color: HashMap<LogicalAddr, Color> =
            self.nodes.keys().map(|k| (*k, Color::White)).collect();
        let mut cyclic = HashSet::new();

        let starts: Vec<LogicalAddr> = self.nodes.keys().copied().collect();
        for start in starts {
            if color[&start] != Color::White {
                continue;
            }
            // iterative dfs: (node, next child index)
            let mut stack: Vec<(LogicalAddr, usize)> = vec![(start, 0)];
            color.insert(start, Color::Grey);
            while let Some((cur, idx)) = stack.pop() {
                let next = self
                    .edges_out
                    .get(&cur)
                    .and_then(|edges| edges.get(idx))
                    .map(|e| e.to_node);
                match next {
                    None => {
                        color.insert(cur, Color::Black);
                    }
                    Some(child) => {
                        stack.push((cur, idx + 1));
                        match color.get(&child).copied() {
                            Some(Color::White) => {
                                color.insert(child, Color::Grey);
                                stack.push((child, 0));
                            }
                            Some(Color::Grey) => {
                                // back edge: everything on the stack from
                                // `child` up is on the cycle
                                errors.push(format!(
                                    "pointer cycle through {child} (reached from {cur})"
                                ));
                                let mut on_cycle = false;
                                for (n, _) in stack.iter() {
                                    if *n == child {
                                        on_cycle = true;
                                    }
                                    if on_cycle {
                                        cyclic.insert(*n);
                                    }
                                }
                                cyclic.insert(child);
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        self.cyclic = cyclic;
    }

    /// in-degree-0 ancestors of `laddr`: the candidate roots whose subtree
    /// contains it
    pub fn leaf_to_roots(&self, laddr: LogicalAddr) -> BTreeSet<LogicalAddr> {
        let mut roots = BTreeSet::new();
        if self.is_bad(laddr) || !self.nodes.contains_key(&laddr) {
            return roots;
        }
        let mut seen = HashSet::new();
        let mut queue = vec![laddr];
        seen.insert(laddr);
        while let Some(cur) = queue.pop() {
            let parents = self.edges_in.get(&cur);
            let usable: Vec<LogicalAddr> = parents
                .into_iter()
                .flatten()
                .filter(|p| !self.is_bad(**p))
                .copied()
                .collect();
            if usable.is_empty() {
                roots.insert(cur);
                continue;
            }
            for p in usable {
                if seen.insert(p) {
                    queue.push(p);
                }
            }
        }
        roots
    }

    /// scavenged roots (no in-edges) owned by `owner`, for bootstrapping a
    /// tree whose authoritative root block did not survive
    pub fn candidate_roots_owned_by(&self, owner: u64) -> Vec<&GraphNode> {
        self.nodes
            .values()
            .filter(|n| {
                n.owner == owner
                    && !self.is_bad(n.laddr)
                    && self.edges_in.get(&n.laddr).map_or(true, |v| v.is_empty())
            })
            .collect()
    }

    /// every node reachable downward from `root` through kept edges
    pub fn descendants(&self, root: LogicalAddr) -> Vec<LogicalAddr> {
        let mut out = Vec::new();
        if self.is_bad(root) || !self.nodes.contains_key(&root) {
            return out;
        }
        let mut seen = HashSet::new();
        let mut queue = vec![root];
        seen.insert(root);
        while let Some(cur) = queue.pop() {
            out.push(cur);
            for e in self.edges_out.get(&cur).into_iter().flatten() {
                if !self.is_bad(e.to_node)
                    && self.nodes.contains_key(&e.to_node)
                    && seen.insert(e.to_node)
                {
                    queue.push(e.to_node);
                }
            }
        }
        out
    }

    pub fn cow_distance(&self, owner_a: u64, owner_b: u64) -> Option<u64> {
        self.ancestry.cow_distance(owner_a, owner_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{KeyPtr, LeafItem};
    use crate::structures::BtrfsItemType;

    fn key(o: u64) -> Key {
        Key::new(o, BtrfsItemType::INODE_ITEM, 0)
    }

    fn leaf(laddr: u64, gen: u64, owner: u64, keys: &[u64]) -> ParsedNode {
        ParsedNode {
            laddr: LogicalAddr(laddr),
            level: 0,
            generation: gen,
            owner,
            body: NodeBody::Leaf(
                keys.iter()
                    .map(|o| LeafItem {
                        key: key(*o),
                        data: Vec::new(),
                    })
                    .collect(),
            ),
        }
    }

    fn internal(laddr: u64, gen: u64, owner: u64, children: &[(u64, u64, u64)]) -> ParsedNode {
        // children: (laddr, generation, first objectid)
        ParsedNode {
            laddr: LogicalAddr(laddr),
            level: 1,
            generation: gen,
            owner,
            body: NodeBody::Internal(
                children
                    .iter()
                    .map(|(l, g, o)| KeyPtr {
                        key: key(*o),
                        blockptr: LogicalAddr(*l),
                        generation: *g,
                    })
                    .collect(),
            ),
        }
    }

    #[test]
    fn leaf_to_roots_finds_independent_ancestors() {
        let mut g = NodeGraph::new();
        g.insert_node(&leaf(100, 5, 257, &[1, 2]));
        g.insert_node(&internal(200, 5, 257, &[(100, 5, 1)]));
        g.insert_node(&internal(300, 6, 257, &[(100, 5, 1)]));
        let errs = g.final_check();
        assert!(errs.is_empty());
        let roots = g.leaf_to_roots(LogicalAddr(100));
        assert_eq!(
            roots,
            [LogicalAddr(200), LogicalAddr(300)].into_iter().collect()
        );
        // a root is its own root
        assert_eq!(
            g.leaf_to_roots(LogicalAddr(200)),
            [LogicalAddr(200)].into_iter().collect()
        );
    }

    #[test]
    fn inconsistent_edge_dropped() {
        let mut g = NodeGraph::new();
        g.insert_node(&leaf(100, 5, 257, &[1]));
        // parent expects generation 9 but the child is generation 5
        g.insert_node(&internal(200, 9, 257, &[(100, 9, 1)]));
        let errs = g.final_check();
        assert_eq!(errs.len(), 1);
        // the stale parent no longer claims the leaf
        let roots = g.leaf_to_roots(LogicalAddr(100));
        assert_eq!(roots, [LogicalAddr(100)].into_iter().collect());
    }

    #[test]
    fn missing_child_reported() {
        let mut g = NodeGraph::new();
        g.insert_node(&internal(200, 5, 257, &[(999, 5, 1)]));
        let errs = g.final_check();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("unscavenged"));
    }

    #[test]
    fn bad_child_never_used() {
        let mut g = NodeGraph::new();
        g.insert_bad_node(LogicalAddr(100), "checksum mismatch".into());
        g.insert_node(&internal(200, 5, 257, &[(100, 5, 1)]));
        let errs = g.final_check();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("bad node"));
        assert!(g.leaf_to_roots(LogicalAddr(100)).is_empty());
    }

    #[test]
    fn pointer_loops_cannot_survive() {
        // a node claiming itself (or an ancestor) as a child: the edge
        // fails the level expectation, gets dropped, and traversal
        // terminates instead of looping
        let mut g = NodeGraph::new();
        g.insert_node(&internal(400, 5, 257, &[(400, 5, 1)]));
        let errs = g.final_check();
        assert_eq!(errs.len(), 1);
        assert_eq!(
            g.leaf_to_roots(LogicalAddr(400)),
            [LogicalAddr(400)].into_iter().collect()
        );
        assert_eq!(g.descendants(LogicalAddr(400)), vec![LogicalAddr(400)]);
    }

    #[test]
    fn cow_distance_symmetry() {
        let g = NodeGraph::new();
        g.ancestry.set_parent(258, 257);
        g.ancestry.set_parent(259, 258);
        assert_eq!(g.cow_distance(259, 257), Some(2));
        assert_eq!(g.cow_distance(257, 259), Some(2));
        assert_eq!(g.cow_distance(257, 257), Some(0));
        assert_eq!(g.cow_distance(5, 257), None);
    }

    #[test]
    fn acceptable_owner_follows_parent_chain() {
        let g = NodeGraph::new();
        g.ancestry.set_parent(258, 257);
        assert!(g.ancestry.is_acceptable_owner(258, 258));
        assert!(g.ancestry.is_acceptable_owner(258, 257));
        // the child's nodes are not acceptable in the parent
        assert!(!g.ancestry.is_acceptable_owner(257, 258));
    }
}
