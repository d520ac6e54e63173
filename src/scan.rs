use crate::addr::{LogicalAddr, QualifiedPaddr};
use crate::err::Result;
use crate::fs::{csum_data, FsInfo};
use crate::structures::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Raw device sweep for anything that still looks like a tree node.
///
/// Every sector-aligned offset is tried: fsid gate first (cheap), then the
/// checksum over the whole would-be node. Survivors are reported with the
/// address the header claims, which is the only link back into the logical
/// space before the chunk map exists. The result is worth caching; a JSON
/// sidecar avoids re-sweeping terabytes on every run.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSighting {
    pub devid: u64,
    pub offset: u64,
    pub claimed_laddr: Option<LogicalAddr>,
}

impl NodeSighting {
    pub fn paddr(&self) -> QualifiedPaddr {
        QualifiedPaddr::new(self.devid, self.offset)
    }
}

fn superblock_zone(offset: u64) -> bool {
    for mirror in 0..BTRFS_SUPER_MIRROR_MAX {
        let sb = crate::fs::superblock_offset(mirror) as u64;
        if offset >= sb && offset < sb + BTRFS_SUPER_INFO_SIZE as u64 {
            return true;
        }
    }
    false
}

/// how many corrupt-looking blocks to complain about per device before
/// going quiet
const CORRUPT_WARN_LIMIT: usize = 20;

pub fn scan_devices(fs: &FsInfo) -> Result<Vec<NodeSighting>> {
    let mut sightings = Vec::new();
    let nodesize = fs.nodesize() as usize;
    let step = fs.sectorsize() as u64;
    let node_fsid = fs.node_fsid();
    for (devid, dev) in &fs.devid_map {
        let len = dev.file.len() as u64;
        let mut corrupt = 0_usize;
        let mut offset = 0_u64;
        info!("scanning device {} ({} bytes)", devid, len);
        while offset + nodesize as u64 <= len {
            if superblock_zone(offset) {
                offset += step;
                continue;
            }
            let block = dev.file.slice(offset as usize, nodesize);
            let header: btrfs_header = match parse_struct(block) {
                Some(h) => h,
                None => break,
            };
            if header.fsid != node_fsid && header.fsid != fs.fsid {
                offset += step;
                continue;
            }
            let claimed = header.bytenr;
            if csum_data(&block[BTRFS_CSUM_SIZE..], fs.csum_type())? != header.csum {
                corrupt += 1;
                if corrupt <= CORRUPT_WARN_LIMIT {
                    warn!(
                        "device {devid} offset {offset:#x}: fsid matches but checksum does not (claims laddr {claimed:#x})"
                    );
                }
                sightings.push(NodeSighting {
                    devid: *devid,
                    offset,
                    claimed_laddr: Some(LogicalAddr(claimed)),
                });
                offset += step;
                continue;
            }
            sightings.push(NodeSighting {
                devid: *devid,
                offset,
                claimed_laddr: Some(LogicalAddr(claimed)),
            });
            // a valid node occupies the whole nodesize; skip past it
            offset += nodesize as u64;
        }
        if corrupt > CORRUPT_WARN_LIMIT {
            warn!(
                "device {devid}: {} more corrupt blocks not reported",
                corrupt - CORRUPT_WARN_LIMIT
            );
        }
    }
    info!("scan found {} node sightings", sightings.len());
    Ok(sightings)
}

pub fn save_sightings(path: &Path, sightings: &[NodeSighting]) -> Result<()> {
    let json = serde_json::to_string(sightings)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)?;
    Ok(())
}

pub fn load_sightings(path: &Path) -> Result<Vec<NodeSighting>> {
    let json = std::fs::read_to_string(path)?;
    let sightings = serde_json::from_str(&json)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(sightings)
}
