use clap::Parser;
use flatfs::superblock::SuperBlock;
use flatfs::{BlockDevice, FileDisk, FileSystem, MountOptions, BLOCK_SIZE};
use log::info;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_BLOCKS: u32 = 1000;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to the disk image
    #[arg(short, long)]
    disk: PathBuf,

    /// Image size in blocks; a new image defaults to 1000, an existing one
    /// keeps its size unless this is given
    #[arg(short, long)]
    blocks: Option<u32>,

    /// Number of inodes (maximum number of files, root directory included)
    #[arg(short, long, default_value_t = 64)]
    inodes: u16,

    /// Overwrite an image that already holds a file system
    #[arg(short, long)]
    force: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();

    let disk = if cli.disk.exists() {
        let disk = FileDisk::open(&cli.disk)?;
        if !cli.force && SuperBlock::read(&disk)?.is_valid(disk.block_count()) {
            eprintln!(
                "{} already contains a file system; use --force to overwrite it",
                cli.disk.display()
            );
            std::process::exit(1);
        }
        match cli.blocks {
            Some(blocks) if blocks != disk.block_count() => {
                drop(disk);
                FileDisk::create(&cli.disk, blocks)?
            }
            _ => disk,
        }
    } else {
        FileDisk::create(&cli.disk, cli.blocks.unwrap_or(DEFAULT_BLOCKS))?
    };

    let total_blocks = disk.block_count();
    println!(
        "Formatting {} ({} bytes, {} blocks)...",
        cli.disk.display(),
        total_blocks as u64 * BLOCK_SIZE as u64,
        total_blocks
    );

    let options = MountOptions {
        default_inodes: cli.inodes,
        format_if_invalid: true,
    };
    let fs = FileSystem::mount_with(Arc::new(disk), options)?;
    fs.format(cli.inodes)?;
    fs.sync()?;

    let stats = fs.stats()?;
    info!("formatted {} with {:?}", cli.disk.display(), stats);
    println!(
        "Inodes: {}, data blocks: {}..{}, free: {}",
        stats.total_inodes, stats.data_start, stats.total_blocks, stats.free_blocks
    );
    fs.unmount()?;

    println!("Format complete.");

    Ok(())
}
