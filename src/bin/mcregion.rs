//! Prints what a region file holds.
//!
//! `mcregion <world dir | region file> [config.json]`

use mcstore::region::{list_regions, region_path, BufferPool, RegionFile};
use mcstore::{LocalPos, RegionPos, StorageConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn summarize(path: &Path, config: &StorageConfig, pool: &Arc<BufferPool>) -> Result<(), mcstore::RegionError> {
    let region = RegionFile::open(path, config.region_options(), pool.clone())?;
    let mut chunks = 0;
    let mut legacy = 0;
    let mut corrupt = 0;
    for local in LocalPos::all() {
        let range = region.entry(local);
        if range.is_empty() {
            continue;
        }
        match region.read(local)? {
            Some(input) => {
                chunks += 1;
                if input.format() != mcstore::region::Format::CURRENT {
                    legacy += 1;
                }
                log::debug!(
                    "({:2}, {:2}) sectors {}+{} {:?} written at {}",
                    local.x(),
                    local.z(),
                    range.offset,
                    range.count,
                    input.format(),
                    region.timestamp(local)
                );
            }
            None => corrupt += 1,
        }
    }
    println!(
        "{}: {chunks} chunks ({legacy} legacy, {corrupt} corrupt), {}/{} sectors used",
        path.display(),
        region.used_sectors(),
        region.sector_count()
    );
    region.close()
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let mut args = std::env::args_os().skip(1);
    let Some(target) = args.next().map(PathBuf::from) else {
        eprintln!("usage: mcregion <world dir | region file> [config.json]");
        std::process::exit(2);
    };
    let config = match args.next() {
        Some(path) => StorageConfig::from_json_file(path)?,
        None => StorageConfig::default(),
    };
    let pool = Arc::new(BufferPool::new());

    let files: Vec<PathBuf> = if target.is_dir() {
        list_regions(&target, &config.extension)?
            .into_iter()
            .map(|pos: RegionPos| region_path(&target, pos, &config.extension))
            .collect()
    } else {
        vec![target]
    };
    if files.is_empty() {
        println!("no region files");
    }
    for file in files {
        if let Err(e) = summarize(&file, &config, &pool) {
            log::error!("{}: {e}", file.display());
        }
    }
    Ok(())
}
