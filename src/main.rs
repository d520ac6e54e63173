use anyhow::*;
use btrfs_rebuild::driver::{RebuildOptions, Rebuilder};
use btrfs_rebuild::{chunk_writer, dump, fs, scan};
use clap::Parser;
use std::sync::Arc;

/// rebuild the trees of a damaged, unmounted btrfs filesystem and report
/// what could be reattached
///
/// Each available block device in the filesystem should be specified on
/// the command line. Upper trees are assumed damaged; the logical address
/// map is reconstructed from whatever chunk items, dev extents, block
/// groups and stray nodes survive, and the trees are regrown in memory
/// from scavenged subtrees. Nothing is written unless --write-chunk-tree
/// is given.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Params {
    #[clap(required = true)]
    paths: Vec<std::path::PathBuf>,

    /// reuse a cached node list instead of sweeping the devices
    #[arg(long)]
    nodes: Option<std::path::PathBuf>,

    /// write the node list found by the sweep to this file
    #[arg(long)]
    save_nodes: Option<std::path::PathBuf>,

    /// items buffered between the reader and the processor
    #[arg(long, default_value_t = 300)]
    channel_cap: usize,

    /// write the reconstructed chunk tree back to the devices
    #[arg(long)]
    write_chunk_tree: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Params::parse();

    let fs = Arc::new(fs::load_fs(&args.paths)?);
    dump::dump_sb(&fs.master_sb);
    for (devid, di) in fs.devid_map.iter() {
        println!("devid {} is {}", devid, di.path.display());
    }
    let num_devices = fs.master_sb.num_devices;
    println!("{}/{} devices present", fs.devid_map.len(), num_devices);

    let sightings = match &args.nodes {
        Some(path) => scan::load_sightings(path)?,
        None => {
            let found = scan::scan_devices(&fs)?;
            if let Some(path) = &args.save_nodes {
                scan::save_sightings(path, &found)?;
            }
            found
        }
    };
    println!("{} node sightings", sightings.len());

    let opts = RebuildOptions {
        channel_cap: args.channel_cap,
        ..Default::default()
    };
    let mut rebuilder = Rebuilder::new(Arc::clone(&fs), &sightings, opts)?;
    rebuilder.rebuild()?;

    dump::dump_roots(&rebuilder.list_roots());
    dump::dump_tree_contents(rebuilder.forrest());

    if args.write_chunk_tree {
        chunk_writer::write_chunk_tree(&fs, rebuilder.mapper())?;
        println!("chunk tree written back");
    }

    Ok(())
}
