use crate::addr::{LogicalAddr, QualifiedPaddr};
use crate::err::{RebuildError, Result};
use crate::fs::DeviceInfo;
use crate::structures::LE64;
use log::warn;
use more_asserts::*;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// The logical→physical map, rebuilt from whatever survives.
///
/// Mappings arrive from five sources of very different quality: the
/// superblock sys-chunk array, scavenged CHUNK_ITEMs, DEV_EXTENTs, raw
/// found-node sightings, and finally BLOCK_GROUP_ITEMs. They all funnel
/// through `add_mapping`, which merges overlaps and keeps the inverse
/// per-device map in lockstep.

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkMapping {
    pub laddr: LogicalAddr,
    pub size: u64,
    /// mirror-equivalent copies of the whole logical range; may be empty
    /// for a mapping learned only from a BLOCK_GROUP_ITEM
    pub stripes: BTreeSet<QualifiedPaddr>,
    pub flags: Option<u64>,
    pub size_locked: bool,
}

impl ChunkMapping {
    pub fn new(laddr: LogicalAddr, size: u64, stripes: BTreeSet<QualifiedPaddr>) -> ChunkMapping {
        ChunkMapping {
            laddr,
            size,
            stripes,
            flags: None,
            size_locked: false,
        }
    }

    pub fn with_flags(mut self, flags: u64) -> ChunkMapping {
        self.flags = Some(flags);
        self
    }

    pub fn locked(mut self) -> ChunkMapping {
        self.size_locked = true;
        self
    }

    pub fn end(&self) -> LogicalAddr {
        self.laddr + self.size
    }

    fn overlaps(&self, other: &ChunkMapping) -> bool {
        self.laddr < other.end() && other.laddr < self.end()
    }

    fn adjacent(&self, other: &ChunkMapping) -> bool {
        self.end() == other.laddr || other.end() == self.laddr
    }

    /// stripe set re-anchored so paddrs correspond to `start`
    fn stripes_at(&self, start: LogicalAddr) -> Option<BTreeSet<QualifiedPaddr>> {
        let delta = start - self.laddr;
        self.stripes
            .iter()
            .map(|s| s.checked_offset_by(delta))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DevExtMapping {
    pub paddr: QualifiedPaddr,
    pub laddr: LogicalAddr,
    pub size: u64,
    pub flags: Option<u64>,
    pub size_locked: bool,
}

impl DevExtMapping {
    fn end(&self) -> u64 {
        self.paddr.paddr.0 + self.size
    }
}

/// what `resolve` hands back for one logical address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    /// mirror set translated to the queried address
    pub mirrors: BTreeSet<QualifiedPaddr>,
    /// bytes for which that mirror set stays valid
    pub max_contiguous_len: u64,
    pub flags: Option<u64>,
}

#[derive(Default)]
struct Maps {
    chunks: BTreeMap<LogicalAddr, ChunkMapping>,
    devexts: BTreeMap<QualifiedPaddr, DevExtMapping>,
}

pub struct VolumeMapper {
    devices: RwLock<HashMap<LE64, Arc<DeviceInfo>>>,
    maps: RwLock<Maps>,
}

impl Default for VolumeMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeMapper {
    pub fn new() -> VolumeMapper {
        VolumeMapper {
            devices: RwLock::new(HashMap::new()),
            maps: RwLock::new(Maps::default()),
        }
    }

    pub fn add_physical_volume(&self, devid: u64, dev: Arc<DeviceInfo>) -> Result<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(&devid) {
            return Err(RebuildError::MappingConflict(format!(
                "device {devid} already registered"
            )));
        }
        devices.insert(devid, dev);
        Ok(())
    }

    pub fn device(&self, devid: u64) -> Option<Arc<DeviceInfo>> {
        self.devices.read().get(&devid).cloned()
    }

    /// Insert a mapping, merging with overlaps. Contradictions (conflicting
    /// translation on a device, conflicting flags, growing a size-locked
    /// mapping) reject the whole insert and leave the maps untouched.
    pub fn add_mapping(&self, m: ChunkMapping) -> Result<()> {
        if m.size == 0 {
            return Err(RebuildError::MappingConflict(format!(
                "zero-sized mapping at {}",
                m.laddr
            )));
        }
        let mut maps = self.maps.write();
        maps.add_mapping(m)?;
        maps.check_consistency();
        Ok(())
    }

    pub fn resolve(&self, laddr: LogicalAddr) -> Option<Resolved> {
        let maps = self.maps.read();
        let (_, chunk) = maps.chunk_containing(laddr)?;
        let delta = laddr - chunk.laddr;
        let mirrors = chunk
            .stripes
            .iter()
            .map(|s| s.offset_by(delta))
            .collect();
        Some(Resolved {
            mirrors,
            max_contiguous_len: chunk.end().0 - laddr.0,
            flags: chunk.flags,
        })
    }

    /// first mapped sub-range within `[laddr, laddr+size)`
    pub fn resolve_any(
        &self,
        laddr: LogicalAddr,
        size: u64,
    ) -> Option<(LogicalAddr, QualifiedPaddr)> {
        let maps = self.maps.read();
        let end = laddr + size;
        if let Some((_, chunk)) = maps.chunk_containing(laddr) {
            let delta = laddr - chunk.laddr;
            let first = chunk.stripes.iter().next()?.offset_by(delta);
            return Some((laddr, first));
        }
        let (_, chunk) = maps
            .chunks
            .range(laddr..end)
            .next()
            .map(|(k, v)| (*k, v))?;
        let first = *chunk.stripes.iter().next()?;
        Some((chunk.laddr, first))
    }

    pub fn un_resolve(&self, paddr: QualifiedPaddr) -> Option<LogicalAddr> {
        let maps = self.maps.read();
        let ext = maps.devext_containing(paddr)?;
        let delta = paddr.paddr - ext.paddr.paddr;
        Some(ext.laddr + delta)
    }

    /// Read `buf.len()` bytes at `laddr`, consulting every available mirror
    /// of every touched range and insisting they agree. Short reads at
    /// mapping boundaries are retried on the next mapping until the buffer
    /// is full or a hole is hit.
    pub fn read_at(&self, buf: &mut [u8], laddr: LogicalAddr) -> Result<()> {
        let mut filled = 0_usize;
        while filled < buf.len() {
            let at = laddr + filled as u64;
            let resolved = self.resolve(at).ok_or_else(|| {
                RebuildError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("logical address {at} not mapped"),
                ))
            })?;
            let step = (buf.len() - filled).min(resolved.max_contiguous_len as usize);
            assert_gt!(step, 0);
            let mut copied = false;
            for mirror in &resolved.mirrors {
                let Some(dev) = self.device(mirror.devid) else {
                    continue;
                };
                let Some(src) = dev.file.try_slice(mirror.paddr.0 as usize, step) else {
                    warn!("stripe {mirror} lies beyond the end of its device");
                    continue;
                };
                if !copied {
                    buf[filled..filled + step].copy_from_slice(src);
                    copied = true;
                } else if src != &buf[filled..filled + step] {
                    return Err(RebuildError::FsInconsistency(format!(
                        "mirrors disagree for logical range {at} + {step}"
                    )));
                }
            }
            if !copied {
                return Err(RebuildError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no mirror of {at} is on a present device"),
                )));
            }
            filled += step;
        }
        Ok(())
    }

    /// Write to every mirror of every touched range. Only the chunk-tree
    /// writer uses this.
    pub fn write_at(&self, buf: &[u8], laddr: LogicalAddr) -> Result<()> {
        let mut written = 0_usize;
        while written < buf.len() {
            let at = laddr + written as u64;
            let resolved = self.resolve(at).ok_or_else(|| {
                RebuildError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("logical address {at} not mapped"),
                ))
            })?;
            let step = (buf.len() - written).min(resolved.max_contiguous_len as usize);
            let mut hit = false;
            for mirror in &resolved.mirrors {
                let Some(dev) = self.device(mirror.devid) else {
                    continue;
                };
                dev.file
                    .write_at(mirror.paddr.0 as usize, &buf[written..written + step])?;
                hit = true;
            }
            if !hit {
                return Err(RebuildError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no mirror of {at} is on a present device"),
                )));
            }
            written += step;
        }
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.maps.read().chunks.len()
    }

    /// snapshot of the chunk map, for the chunk-tree writer and reports
    pub fn chunks(&self) -> Vec<ChunkMapping> {
        self.maps.read().chunks.values().cloned().collect()
    }
}

impl Maps {
    fn chunk_containing(&self, laddr: LogicalAddr) -> Option<(LogicalAddr, &ChunkMapping)> {
        let (k, v) = self.chunks.range(..=laddr).next_back()?;
        (laddr < v.end()).then_some((*k, v))
    }

    fn devext_containing(&self, paddr: QualifiedPaddr) -> Option<&DevExtMapping> {
        let from = QualifiedPaddr::new(paddr.devid, 0);
        let (_, v) = self.devexts.range(from..=paddr).next_back()?;
        (paddr.devid == v.paddr.devid && paddr.paddr.0 < v.end()).then_some(v)
    }

    fn add_mapping(&mut self, new: ChunkMapping) -> Result<()> {
        // gather everything that overlaps; entries are mutually disjoint so
        // anything overlapping the union also overlaps `new` itself, and
        // walking backwards can stop at the first entry ending before it
        let mut consumed: Vec<LogicalAddr> = Vec::new();
        for (k, c) in self.chunks.range(..new.end()).rev() {
            if c.end() <= new.laddr {
                break;
            }
            if c.overlaps(&new) {
                consumed.push(*k);
            }
        }

        let mut acc = new;
        for k in &consumed {
            acc = merge_overlapping(&acc, &self.chunks[k])?;
        }

        // contiguous neighbours fold in only when nothing distinguishes
        // them from the merged mapping
        loop {
            let left = self
                .chunks
                .range(..acc.laddr)
                .next_back()
                .filter(|(_, c)| c.adjacent(&acc) && adjacency_compatible(c, &acc))
                .map(|(k, _)| *k);
            let right = self
                .chunks
                .range(acc.end()..)
                .next()
                .filter(|(_, c)| c.adjacent(&acc) && adjacency_compatible(c, &acc))
                .map(|(k, _)| *k);
            let Some(k) = left.or(right) else { break };
            let merged = merge_adjacent(&acc, &self.chunks[&k])?;
            consumed.push(k);
            acc = merged;
        }

        // prospective dev extents, checked against the untouched remainder
        // of the devext map before anything mutates
        let removed: BTreeSet<QualifiedPaddr> = consumed
            .iter()
            .flat_map(|k| self.chunks[k].stripes.iter().copied())
            .collect();
        for stripe in &acc.stripes {
            let new_end = stripe.paddr.0 + acc.size;
            let dev_lo = QualifiedPaddr::new(stripe.devid, 0);
            let dev_hi = QualifiedPaddr::new(stripe.devid, u64::MAX);
            for (_, ext) in self.devexts.range(dev_lo..=dev_hi) {
                if removed.contains(&ext.paddr) {
                    continue;
                }
                if stripe.paddr.0 < ext.end() && ext.paddr.paddr.0 < new_end {
                    // physical overlap across distinct chunks: the logical
                    // translations cannot agree or the chunks would have
                    // merged above
                    return Err(RebuildError::MappingConflict(format!(
                        "devices disagree: {} maps both {} and {}",
                        stripe, ext.laddr, acc.laddr
                    )));
                }
            }
        }

        // all checks passed; mutate
        for k in &consumed {
            if let Some(old) = self.chunks.remove(k) {
                for stripe in &old.stripes {
                    self.devexts.remove(stripe);
                }
            }
        }
        for stripe in &acc.stripes {
            self.devexts.insert(
                *stripe,
                DevExtMapping {
                    paddr: *stripe,
                    laddr: acc.laddr,
                    size: acc.size,
                    flags: acc.flags,
                    size_locked: acc.size_locked,
                },
            );
        }
        self.chunks.insert(acc.laddr, acc);
        Ok(())
    }

    /// The dev-extent map must always be exactly what the chunk map
    /// implies. Divergence means the merge logic is broken, and quietly
    /// limping on would corrupt every physical read that follows.
    fn check_consistency(&self) {
        let mut reconstructed = BTreeMap::new();
        for chunk in self.chunks.values() {
            for stripe in &chunk.stripes {
                reconstructed.insert(
                    *stripe,
                    DevExtMapping {
                        paddr: *stripe,
                        laddr: chunk.laddr,
                        size: chunk.size,
                        flags: chunk.flags,
                        size_locked: chunk.size_locked,
                    },
                );
            }
        }
        assert!(
            reconstructed == self.devexts,
            "chunk map and dev-extent map diverged"
        );
    }
}

fn merge_flags(a: Option<u64>, b: Option<u64>) -> Result<Option<u64>> {
    match (a, b) {
        (Some(x), Some(y)) if x != y => Err(RebuildError::MappingConflict(format!(
            "flags disagree: {x:#x} vs {y:#x}"
        ))),
        (Some(x), _) => Ok(Some(x)),
        (_, y) => Ok(y),
    }
}

fn merge_overlapping(a: &ChunkMapping, b: &ChunkMapping) -> Result<ChunkMapping> {
    let start = a.laddr.min(b.laddr);
    let end = a.end().max(b.end());
    let size = end.0 - start.0;
    for locked in [a, b].into_iter().filter(|c| c.size_locked) {
        if size > locked.size {
            return Err(RebuildError::MappingConflict(format!(
                "merge would grow size-locked mapping at {} from {} to {}",
                locked.laddr, locked.size, size
            )));
        }
    }
    let mut stripes = a.stripes_at(start).ok_or_else(|| {
        RebuildError::MappingConflict(format!("stripe underflow translating {}", a.laddr))
    })?;
    let other = b.stripes_at(start).ok_or_else(|| {
        RebuildError::MappingConflict(format!("stripe underflow translating {}", b.laddr))
    })?;
    stripes.extend(other);
    Ok(ChunkMapping {
        laddr: start,
        size,
        stripes,
        flags: merge_flags(a.flags, b.flags)?,
        size_locked: a.size_locked || b.size_locked,
    })
}

fn adjacency_compatible(a: &ChunkMapping, b: &ChunkMapping) -> bool {
    if a.size_locked || b.size_locked {
        return false;
    }
    if matches!((a.flags, b.flags), (Some(x), Some(y)) if x != y) {
        return false;
    }
    let start = a.laddr.min(b.laddr);
    match (a.stripes_at(start), b.stripes_at(start)) {
        (Some(sa), Some(sb)) => sa == sb,
        _ => false,
    }
}

fn merge_adjacent(a: &ChunkMapping, b: &ChunkMapping) -> Result<ChunkMapping> {
    let start = a.laddr.min(b.laddr);
    let end = a.end().max(b.end());
    let stripes = a.stripes_at(start).ok_or_else(|| {
        RebuildError::MappingConflict(format!("stripe underflow translating {}", a.laddr))
    })?;
    Ok(ChunkMapping {
        laddr: start,
        size: end.0 - start.0,
        stripes,
        flags: merge_flags(a.flags, b.flags)?,
        size_locked: false,
    })
}
