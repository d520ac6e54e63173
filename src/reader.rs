use crate::addr::{LogicalAddr, QualifiedPaddr};
use crate::err::{RebuildError, Result};
use crate::fs::{csum_data, FsInfo};
use crate::structures::*;
use crate::volume::VolumeMapper;
use std::sync::Arc;

/// Loads one tree node from disk and validates it.
///
/// Validation order is fixed: header uuid, then checksum, then the node's
/// own idea of its address, then whatever the caller expected. The first
/// failure wins, and the error kind encodes which stage failed so the
/// scanner can tell "this was never a node" from "this was a node once".

#[derive(Clone, Copy, Default)]
pub struct NodeExpectations {
    pub laddr: Option<LogicalAddr>,
    pub level: Option<u8>,
    pub generation: Option<u64>,
    pub owner: Option<u64>,
    pub min_item_key: Option<Key>,
    pub max_item_key: Option<Key>,
}

impl NodeExpectations {
    pub fn at(laddr: LogicalAddr) -> NodeExpectations {
        NodeExpectations {
            laddr: Some(laddr),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct KeyPtr {
    pub key: Key,
    pub blockptr: LogicalAddr,
    pub generation: u64,
}

#[derive(Clone, Debug)]
pub struct LeafItem {
    pub key: Key,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub enum NodeBody {
    Internal(Vec<KeyPtr>),
    Leaf(Vec<LeafItem>),
}

#[derive(Clone, Debug)]
pub struct ParsedNode {
    pub laddr: LogicalAddr,
    pub level: u8,
    pub generation: u64,
    pub owner: u64,
    pub body: NodeBody,
}

impl ParsedNode {
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    pub fn item_keys(&self) -> Vec<Key> {
        match &self.body {
            NodeBody::Leaf(items) => items.iter().map(|i| i.key).collect(),
            NodeBody::Internal(ptrs) => ptrs.iter().map(|p| p.key).collect(),
        }
    }

    pub fn min_item_key(&self) -> Option<Key> {
        match &self.body {
            NodeBody::Leaf(items) => items.first().map(|i| i.key),
            NodeBody::Internal(ptrs) => ptrs.first().map(|p| p.key),
        }
    }

    pub fn max_item_key(&self) -> Option<Key> {
        match &self.body {
            NodeBody::Leaf(items) => items.last().map(|i| i.key),
            NodeBody::Internal(ptrs) => ptrs.last().map(|p| p.key),
        }
    }
}

pub struct NodeReader {
    fs: Arc<FsInfo>,
    mapper: Arc<VolumeMapper>,
}

impl NodeReader {
    pub fn new(fs: Arc<FsInfo>, mapper: Arc<VolumeMapper>) -> NodeReader {
        NodeReader { fs, mapper }
    }

    pub fn nodesize(&self) -> usize {
        self.fs.nodesize() as usize
    }

    pub fn sectorsize(&self) -> u64 {
        self.fs.sectorsize() as u64
    }

    pub fn csum_size(&self) -> usize {
        self.fs.csum_size()
    }

    pub fn read_node_at_physical(
        &self,
        paddr: QualifiedPaddr,
        exp: &NodeExpectations,
    ) -> Result<ParsedNode> {
        let dev = self.mapper.device(paddr.devid).ok_or_else(|| {
            RebuildError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("device {} not present", paddr.devid),
            ))
        })?;
        let block = dev
            .file
            .try_slice(paddr.paddr.0 as usize, self.nodesize())
            .ok_or_else(|| {
                RebuildError::NotANode(format!("{paddr} lies beyond the end of its device"))
            })?;
        self.validate_and_parse(block, exp)
    }

    pub fn read_node_at_logical(
        &self,
        laddr: LogicalAddr,
        exp: &NodeExpectations,
    ) -> Result<ParsedNode> {
        let mut exp = *exp;
        exp.laddr = Some(laddr);
        let mut block = vec![0_u8; self.nodesize()];
        self.mapper.read_at(&mut block, laddr)?;
        self.validate_and_parse(&block, &exp)
    }

    fn validate_and_parse(&self, block: &[u8], exp: &NodeExpectations) -> Result<ParsedNode> {
        let header: btrfs_header = parse_struct(block)
            .ok_or_else(|| RebuildError::NotANode("block shorter than a header".into()))?;

        // stage 1: the header uuid is the closest thing a node has to magic
        if header.fsid != self.fs.node_fsid() && header.fsid != self.fs.fsid {
            return Err(RebuildError::NotANode(format!(
                "header fsid {} is foreign",
                hex::encode(header.fsid)
            )));
        }

        // stage 2: checksum over everything after the csum field
        let bytenr = header.bytenr;
        let computed = csum_data(&block[BTRFS_CSUM_SIZE..], self.fs.csum_type())?;
        if computed != header.csum {
            return Err(RebuildError::NodeCorrupt(format!(
                "checksum mismatch on node claiming laddr {bytenr:#x}"
            )));
        }

        // stage 3: self-declared address vs where we expected it. A node
        // whose bytenr disagrees is some other (old, relocated) node, not a
        // corrupted one, and the scanner wants to know the difference.
        if let Some(want) = exp.laddr {
            if bytenr != want.0 {
                return Err(RebuildError::NotANode(format!(
                    "node at expected laddr {want} declares bytenr {bytenr:#x}"
                )));
            }
        }

        let node = self.parse_body(block, &header)?;

        // stage 4: caller expectations
        if let Some(level) = exp.level {
            if node.level != level {
                return Err(RebuildError::ExpectationMismatch {
                    field: "level",
                    expected: level.to_string(),
                    actual: node.level.to_string(),
                });
            }
        }
        if let Some(generation) = exp.generation {
            if node.generation != generation {
                return Err(RebuildError::ExpectationMismatch {
                    field: "generation",
                    expected: generation.to_string(),
                    actual: node.generation.to_string(),
                });
            }
        }
        if let Some(owner) = exp.owner {
            if node.owner != owner {
                return Err(RebuildError::ExpectationMismatch {
                    field: "owner",
                    expected: owner.to_string(),
                    actual: node.owner.to_string(),
                });
            }
        }
        if let Some(min) = exp.min_item_key {
            if node.min_item_key() != Some(min) {
                return Err(RebuildError::ExpectationMismatch {
                    field: "min item key",
                    expected: format!("{min:?}"),
                    actual: format!("{:?}", node.min_item_key()),
                });
            }
        }
        if let Some(max) = exp.max_item_key {
            if node.max_item_key().map_or(true, |k| k > max) {
                return Err(RebuildError::ExpectationMismatch {
                    field: "max item key",
                    expected: format!("<= {max:?}"),
                    actual: format!("{:?}", node.max_item_key()),
                });
            }
        }

        Ok(node)
    }

    fn parse_body(&self, block: &[u8], header: &btrfs_header) -> Result<ParsedNode> {
        let laddr = LogicalAddr(header.bytenr);
        let hdr_size = std::mem::size_of::<btrfs_header>();
        let nritems = header.nritems as usize;
        let body = if header.level > 0 {
            let per = std::mem::size_of::<btrfs_key_ptr>();
            if hdr_size + nritems * per > block.len() {
                return Err(RebuildError::NodeCorrupt(format!(
                    "internal node {laddr} claims {nritems} pointers"
                )));
            }
            let mut ptrs = Vec::with_capacity(nritems);
            for i in 0..nritems {
                let raw: btrfs_key_ptr = parse_struct(&block[hdr_size + i * per..])
                    .ok_or_else(|| RebuildError::NodeCorrupt("short key pointer".into()))?;
                let key = Key::try_from(raw.key).map_err(|t| {
                    RebuildError::NodeCorrupt(format!(
                        "node {laddr} slot {i}: unknown item type {t:#x}"
                    ))
                })?;
                ptrs.push(KeyPtr {
                    key,
                    blockptr: LogicalAddr(raw.blockptr),
                    generation: raw.generation,
                });
            }
            NodeBody::Internal(ptrs)
        } else {
            let per = std::mem::size_of::<btrfs_item>();
            if hdr_size + nritems * per > block.len() {
                return Err(RebuildError::NodeCorrupt(format!(
                    "leaf {laddr} claims {nritems} items"
                )));
            }
            let mut items = Vec::with_capacity(nritems);
            for i in 0..nritems {
                let raw: btrfs_item = parse_struct(&block[hdr_size + i * per..])
                    .ok_or_else(|| RebuildError::NodeCorrupt("short item header".into()))?;
                let key = Key::try_from(raw.key).map_err(|t| {
                    RebuildError::NodeCorrupt(format!(
                        "leaf {laddr} slot {i}: unknown item type {t:#x}"
                    ))
                })?;
                // item data offsets count from the end of the header
                let start = hdr_size + raw.offset as usize;
                let end = start + raw.size as usize;
                let data = block
                    .get(start..end)
                    .ok_or_else(|| {
                        RebuildError::NodeCorrupt(format!(
                            "leaf {laddr} slot {i}: data [{start}, {end}) escapes the node"
                        ))
                    })?
                    .to_vec();
                items.push(LeafItem { key, data });
            }
            NodeBody::Leaf(items)
        };
        Ok(ParsedNode {
            laddr,
            level: header.level,
            generation: header.generation,
            owner: header.owner,
            body,
        })
    }
}
