use btrfs_rebuild::addr::{LogicalAddr, QualifiedPaddr};
use btrfs_rebuild::driver::{RebuildOptions, Rebuilder};
use btrfs_rebuild::fs::{self, csum_data, name_hash};
use btrfs_rebuild::scan;
use btrfs_rebuild::structures::*;
use std::io::Write;
use std::sync::Arc;

/// End-to-end scenarios against synthetic single-device images.
///
/// Each test writes a small "filesystem": a superblock whose sys-chunk
/// array maps one system chunk, plus hand-built tree nodes placed inside
/// that chunk. The rebuild then runs exactly as it would against a real
/// damaged device.

const DEVSIZE: usize = 32 << 20;
const NODESIZE: u32 = 16384;
const SECTORSIZE: u32 = 4096;
const FSID: BtrfsFsid = [0x42; 16];

const CHUNK_LADDR: u64 = 0x1000000;
const CHUNK_PADDR: u64 = 0x400000;
const CHUNK_SIZE: u64 = 0x1000000;

/// handy laddrs inside the mapped chunk, one node apart
const L0: u64 = CHUNK_LADDR;
const L1: u64 = CHUNK_LADDR + 0x8000;
const L2: u64 = CHUNK_LADDR + 0x10000;
const L3: u64 = CHUNK_LADDR + 0x18000;

fn zeroed<T: Copy>() -> T {
    let buf = vec![0_u8; std::mem::size_of::<T>()];
    parse_struct(&buf).expect("sized buffer")
}

fn leaf_bytes(laddr: u64, owner: u64, generation: u64, items: &[(Key, Vec<u8>)]) -> Vec<u8> {
    for w in items.windows(2) {
        assert!(w[0].0 < w[1].0, "leaf items must be key-sorted");
    }
    let nodesize = NODESIZE as usize;
    let hdr_size = std::mem::size_of::<btrfs_header>();
    let item_size = std::mem::size_of::<btrfs_item>();
    let mut block = vec![0_u8; nodesize];
    let mut data_end = nodesize;
    for (i, (key, body)) in items.iter().enumerate() {
        data_end -= body.len();
        block[data_end..data_end + body.len()].copy_from_slice(body);
        let item = btrfs_item {
            key: key.to_disk(),
            offset: (data_end - hdr_size) as u32,
            size: body.len() as u32,
        };
        let at = hdr_size + i * item_size;
        block[at..at + item_size].copy_from_slice(struct_bytes(&item));
    }
    let mut header: btrfs_header = zeroed();
    header.fsid = FSID;
    header.bytenr = laddr;
    header.generation = generation;
    header.owner = owner;
    header.nritems = items.len() as u32;
    header.level = 0;
    block[..hdr_size].copy_from_slice(struct_bytes(&header));
    let csum = csum_data(&block[BTRFS_CSUM_SIZE..], BtrfsCsumType::CRC32).unwrap();
    block[..BTRFS_CSUM_SIZE].copy_from_slice(&csum);
    block
}

fn super_block_bytes(root_laddr: u64, chunk_root_laddr: u64) -> Vec<u8> {
    let mut sb: btrfs_super_block = zeroed();
    sb.fsid = FSID;
    sb.bytenr = BTRFS_SUPER_INFO_OFFSET as u64;
    sb.magic = BTRFS_MAGIC;
    sb.generation = 100;
    sb.root = root_laddr;
    sb.chunk_root = chunk_root_laddr;
    sb.num_devices = 1;
    sb.sectorsize = SECTORSIZE;
    sb.nodesize = NODESIZE;
    sb.stripesize = SECTORSIZE;
    sb.csum_type = BtrfsCsumType::CRC32 as u16;
    sb.dev_item.devid = 1;
    sb.dev_item.fsid = FSID;
    sb.dev_item.uuid = [0x11; 16];
    sb.dev_item.total_bytes = DEVSIZE as u64;

    // one bootstrap system chunk
    let key = btrfs_disk_key {
        objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID,
        item_type: BtrfsItemType::CHUNK_ITEM as u8,
        offset: CHUNK_LADDR,
    };
    let chunk = btrfs_chunk {
        length: CHUNK_SIZE,
        owner: BTRFS_EXTENT_TREE_OBJECTID,
        stripe_len: 0x10000,
        r#type: BLOCK_GROUP_SYSTEM | BLOCK_GROUP_METADATA,
        io_align: SECTORSIZE,
        io_width: SECTORSIZE,
        sector_size: SECTORSIZE,
        num_stripes: 1,
        sub_stripes: 1,
    };
    let stripe = btrfs_stripe {
        devid: 1,
        offset: CHUNK_PADDR,
        dev_uuid: [0x11; 16],
    };
    let mut array = Vec::new();
    array.extend_from_slice(struct_bytes(&key));
    array.extend_from_slice(struct_bytes(&chunk));
    array.extend_from_slice(struct_bytes(&stripe));
    sb.sys_chunk_array[..array.len()].copy_from_slice(&array);
    sb.sys_chunk_array_size = array.len() as u32;

    let mut block = struct_bytes(&sb).to_vec();
    let csum = csum_data(&block[BTRFS_CSUM_SIZE..], BtrfsCsumType::CRC32).unwrap();
    block[..BTRFS_CSUM_SIZE].copy_from_slice(&csum);
    block
}

struct ImageBuilder {
    image: Vec<u8>,
}

impl ImageBuilder {
    fn new(root_laddr: u64) -> ImageBuilder {
        let mut image = vec![0_u8; DEVSIZE];
        let sb = super_block_bytes(root_laddr, CHUNK_LADDR + CHUNK_SIZE);
        image[BTRFS_SUPER_INFO_OFFSET..BTRFS_SUPER_INFO_OFFSET + sb.len()].copy_from_slice(&sb);
        ImageBuilder { image }
    }

    fn place(&mut self, laddr: u64, node: Vec<u8>) -> &mut Self {
        let paddr = (laddr - CHUNK_LADDR + CHUNK_PADDR) as usize;
        self.image[paddr..paddr + node.len()].copy_from_slice(&node);
        self
    }

    fn corrupt_byte(&mut self, laddr: u64, at: usize) -> &mut Self {
        let paddr = (laddr - CHUNK_LADDR + CHUNK_PADDR) as usize;
        self.image[paddr + at] ^= 0xff;
        self
    }

    fn build(&self) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&self.image).unwrap();
        tmp.flush().unwrap();
        tmp
    }
}

fn rebuild_image(tmp: &tempfile::NamedTempFile) -> Rebuilder {
    let fsinfo = Arc::new(fs::load_fs(&vec![tmp.path().to_path_buf()]).unwrap());
    let sightings = scan::scan_devices(&fsinfo).unwrap();
    let mut r = Rebuilder::new(fsinfo, &sightings, RebuildOptions::default()).unwrap();
    r.rebuild().unwrap();
    r
}

fn inode_body(mode: u32, size: u64) -> Vec<u8> {
    let mut inode: btrfs_inode_item = zeroed();
    inode.generation = 1;
    inode.size = size;
    inode.nlink = 1;
    inode.mode = mode;
    struct_bytes(&inode).to_vec()
}

fn root_item_body(bytenr: u64) -> Vec<u8> {
    let mut ri: btrfs_root_item = zeroed();
    ri.generation = 50;
    ri.root_dirid = 256;
    ri.bytenr = bytenr;
    ri.level = 0;
    struct_bytes(&ri).to_vec()
}

fn dirent_body(name: &[u8], target_ino: u64) -> Vec<u8> {
    let raw = btrfs_dir_item {
        location: Key::new(target_ino, BtrfsItemType::INODE_ITEM, 0).to_disk(),
        transid: 1,
        data_len: 0,
        name_len: name.len() as u16,
        r#type: 1,
    };
    let mut body = struct_bytes(&raw).to_vec();
    body.extend_from_slice(name);
    body
}

fn extent_data_body(disk_bytenr: u64, bytes: u64) -> Vec<u8> {
    let mut fe: btrfs_file_extent_item = zeroed();
    fe.generation = 1;
    fe.ram_bytes = bytes;
    fe.extent_type = FILE_EXTENT_REG;
    fe.disk_bytenr = disk_bytenr;
    fe.disk_num_bytes = bytes;
    fe.num_bytes = bytes;
    struct_bytes(&fe).to_vec()
}

fn key(objectid: u64, t: BtrfsItemType, offset: u64) -> Key {
    Key::new(objectid, t, offset)
}

#[test]
fn trivial_remap() {
    // superblock only: the sys-chunk maps, nothing is scavenged
    let tmp = ImageBuilder::new(0).build();
    let r = rebuild_image(&tmp);

    let resolved = r.mapper().resolve(LogicalAddr(CHUNK_LADDR)).unwrap();
    assert_eq!(
        resolved.mirrors,
        [QualifiedPaddr::new(1, CHUNK_PADDR)].into_iter().collect()
    );
    assert_eq!(resolved.max_contiguous_len, CHUNK_SIZE);

    let roots = r.list_roots();
    assert_eq!(roots.len(), 3);
    assert!(roots[&BTRFS_ROOT_TREE_OBJECTID].is_empty());
    assert!(roots[&BTRFS_CHUNK_TREE_OBJECTID].is_empty());
    assert!(roots[&BTRFS_BLOCK_GROUP_TREE_OBJECTID].is_empty());
    assert!(r.queues_empty());
}

#[test]
fn root_item_without_tree_reaches_fixed_point() {
    // one scavenged ROOT_ITEM for tree 257; nothing else of 257 survives
    let root_leaf = leaf_bytes(
        L0,
        BTRFS_ROOT_TREE_OBJECTID,
        5,
        &[(
            key(257, BtrfsItemType::ROOT_ITEM, 0),
            root_item_body(0x9999000), // points nowhere that survived
        )],
    );
    let tmp = ImageBuilder::new(L0).place(L0, root_leaf).build();
    let mut r = rebuild_image(&tmp);

    let roots = r.list_roots();
    assert_eq!(
        roots[&BTRFS_ROOT_TREE_OBJECTID],
        [LogicalAddr(L0)].into_iter().collect()
    );
    assert!(roots[&257].is_empty());
    assert!(r.queues_empty());

    // running again with no new scanner input changes nothing
    let before = r.list_roots();
    r.rebuild().unwrap();
    assert_eq!(before, r.list_roots());
    assert!(r.queues_empty());
}

#[test]
fn replacement_by_generation() {
    // the tree's declared root is the older of two surviving leaves for
    // the same key; settling pulls the newer one in
    let k = key(300, BtrfsItemType::INODE_ITEM, 0);
    let root_leaf = leaf_bytes(
        L0,
        BTRFS_ROOT_TREE_OBJECTID,
        5,
        &[(key(257, BtrfsItemType::ROOT_ITEM, 0), root_item_body(L1))],
    );
    let older = leaf_bytes(L1, 257, 10, &[(k, inode_body(S_IFREG | 0o644, 0))]);
    let newer = leaf_bytes(L2, 257, 20, &[(k, inode_body(S_IFREG | 0o644, 0))]);
    let tmp = ImageBuilder::new(L0)
        .place(L0, root_leaf)
        .place(L1, older)
        .place(L2, newer)
        .build();
    let r = rebuild_image(&tmp);

    let tree = r.forrest().get(257).unwrap();
    let ptr = tree.lookup(k).unwrap();
    assert_eq!(ptr.node, LogicalAddr(L2));
    assert_eq!(
        r.list_roots()[&257],
        [LogicalAddr(L1), LogicalAddr(L2)].into_iter().collect()
    );
}

#[test]
fn direntry_want_pulls_inode_leaf_in() {
    let hash = name_hash(b"file") as u64;
    let fs_leaf = leaf_bytes(
        L1,
        257,
        10,
        &[
            (key(256, BtrfsItemType::INODE_ITEM, 0), inode_body(S_IFDIR | 0o755, 0)),
            (key(256, BtrfsItemType::DIR_ITEM, hash), dirent_body(b"file", 300)),
        ],
    );
    let inode_leaf = leaf_bytes(
        L2,
        257,
        10,
        &[(key(300, BtrfsItemType::INODE_ITEM, 0), inode_body(S_IFREG | 0o644, 0))],
    );
    let root_leaf = leaf_bytes(
        L0,
        BTRFS_ROOT_TREE_OBJECTID,
        5,
        &[(key(257, BtrfsItemType::ROOT_ITEM, 0), root_item_body(L1))],
    );
    let tmp = ImageBuilder::new(L0)
        .place(L0, root_leaf)
        .place(L1, fs_leaf)
        .place(L2, inode_leaf)
        .build();
    let r = rebuild_image(&tmp);

    let tree = r.forrest().get(257).unwrap();
    assert!(tree.lookup(key(300, BtrfsItemType::INODE_ITEM, 0)).is_some());
    assert_eq!(
        r.list_roots()[&257],
        [LogicalAddr(L1), LogicalAddr(L2)].into_iter().collect()
    );
}

#[test]
fn direntry_hash_mismatch_pulls_nothing() {
    // key offset 0xDEAD is not crc32c("file"): the dirent is inconsistent
    // and must not produce a want for the inode it names
    let fs_leaf = leaf_bytes(
        L1,
        257,
        10,
        &[
            (key(256, BtrfsItemType::INODE_ITEM, 0), inode_body(S_IFDIR | 0o755, 0)),
            (key(256, BtrfsItemType::DIR_ITEM, 0xDEAD), dirent_body(b"file", 400)),
        ],
    );
    let orphan_inode_leaf = leaf_bytes(
        L2,
        257,
        10,
        &[(key(400, BtrfsItemType::INODE_ITEM, 0), inode_body(S_IFREG | 0o644, 0))],
    );
    let root_leaf = leaf_bytes(
        L0,
        BTRFS_ROOT_TREE_OBJECTID,
        5,
        &[(key(257, BtrfsItemType::ROOT_ITEM, 0), root_item_body(L1))],
    );
    let tmp = ImageBuilder::new(L0)
        .place(L0, root_leaf)
        .place(L1, fs_leaf)
        .place(L2, orphan_inode_leaf)
        .build();
    let r = rebuild_image(&tmp);

    let tree = r.forrest().get(257).unwrap();
    assert!(tree.lookup(key(400, BtrfsItemType::INODE_ITEM, 0)).is_none());
    assert_eq!(
        r.list_roots()[&257],
        [LogicalAddr(L1)].into_iter().collect()
    );
}

#[test]
fn corrupt_node_lands_in_bad_set_not_tree() {
    // the leaf the ROOT_ITEM points at has a flipped byte; its checksum
    // fails, it must never be grafted, and the rebuild still terminates
    let root_leaf = leaf_bytes(
        L0,
        BTRFS_ROOT_TREE_OBJECTID,
        5,
        &[(key(257, BtrfsItemType::ROOT_ITEM, 0), root_item_body(L1))],
    );
    let k = key(300, BtrfsItemType::INODE_ITEM, 0);
    let fs_leaf = leaf_bytes(L1, 257, 10, &[(k, inode_body(S_IFREG | 0o644, 0))]);
    let tmp = ImageBuilder::new(L0)
        .place(L0, root_leaf)
        .place(L1, fs_leaf)
        .corrupt_byte(L1, 200)
        .build();
    let r = rebuild_image(&tmp);

    let tree = r.forrest().get(257).unwrap();
    assert!(tree.lookup(k).is_none());
    assert!(r.list_roots()[&257].is_empty());
}

#[test]
fn csum_coverage_attaches_csum_tree() {
    let data_laddr = CHUNK_LADDR + 0x800000;
    let fs_leaf = leaf_bytes(
        L1,
        257,
        10,
        &[
            (
                key(300, BtrfsItemType::INODE_ITEM, 0),
                inode_body(S_IFREG | 0o644, 4096),
            ),
            (
                key(300, BtrfsItemType::EXTENT_DATA, 0),
                extent_data_body(data_laddr, 4096),
            ),
        ],
    );
    // one csum run covering exactly the extent's sectors
    let csum_leaf = leaf_bytes(
        L2,
        BTRFS_CSUM_TREE_OBJECTID,
        8,
        &[(
            key(BTRFS_EXTENT_CSUM_OBJECTID, BtrfsItemType::EXTENT_CSUM, data_laddr),
            vec![0xcc; 4],
        )],
    );
    let root_leaf = leaf_bytes(
        L0,
        BTRFS_ROOT_TREE_OBJECTID,
        5,
        &[(key(257, BtrfsItemType::ROOT_ITEM, 0), root_item_body(L1))],
    );
    let tmp = ImageBuilder::new(L0)
        .place(L0, root_leaf)
        .place(L1, fs_leaf)
        .place(L2, csum_leaf)
        .build();
    let r = rebuild_image(&tmp);

    assert_eq!(
        r.list_roots()[&BTRFS_CSUM_TREE_OBJECTID],
        [LogicalAddr(L2)].into_iter().collect()
    );
    let csum_tree = r.forrest().get(BTRFS_CSUM_TREE_OBJECTID).unwrap();
    assert!(csum_tree
        .lookup(key(
            BTRFS_EXTENT_CSUM_OBJECTID,
            BtrfsItemType::EXTENT_CSUM,
            data_laddr
        ))
        .is_some());
    assert!(r.queues_empty());
}

#[test]
fn read_write_round_trip_on_rebuilt_map() {
    let tmp = ImageBuilder::new(0).build();
    let r = rebuild_image(&tmp);
    let l = LogicalAddr(CHUNK_LADDR + 0x123000);
    let payload = b"rebuilt mapping round trip";
    r.mapper().write_at(payload, l).unwrap();
    let mut back = vec![0_u8; payload.len()];
    r.mapper().read_at(&mut back, l).unwrap();
    assert_eq!(&back, payload);
    // and the inverse map agrees
    let resolved = r.mapper().resolve(l).unwrap();
    let stripe = resolved.mirrors.iter().next().unwrap();
    assert_eq!(r.mapper().un_resolve(*stripe), Some(l));
}

#[test]
fn node_list_cache_reproduces_rebuild() {
    let root_leaf = leaf_bytes(
        L0,
        BTRFS_ROOT_TREE_OBJECTID,
        5,
        &[(key(257, BtrfsItemType::ROOT_ITEM, 0), root_item_body(L3))],
    );
    let fs_leaf = leaf_bytes(
        L3,
        257,
        10,
        &[(key(300, BtrfsItemType::INODE_ITEM, 0), inode_body(S_IFREG | 0o644, 0))],
    );
    let tmp = ImageBuilder::new(L0)
        .place(L0, root_leaf)
        .place(L3, fs_leaf)
        .build();

    let fsinfo = Arc::new(fs::load_fs(&vec![tmp.path().to_path_buf()]).unwrap());
    let sightings = scan::scan_devices(&fsinfo).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("nodes.json");
    scan::save_sightings(&cache, &sightings).unwrap();
    let reloaded = scan::load_sightings(&cache).unwrap();
    assert_eq!(sightings, reloaded);

    let mut r = Rebuilder::new(fsinfo, &reloaded, RebuildOptions::default()).unwrap();
    r.rebuild().unwrap();
    assert_eq!(
        r.list_roots()[&257],
        [LogicalAddr(L3)].into_iter().collect()
    );
}
