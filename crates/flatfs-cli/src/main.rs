use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flatfs::{FileDisk, FileSystem, MountOptions, OpenMode, BLOCK_SIZE};
use log::debug;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a disk image created by mkfs
    #[arg(short, long, global = true, default_value = "disk.img")]
    disk: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List files with their sizes
    Ls,
    /// Copy a host file into the image
    Put {
        /// File on the host
        host: PathBuf,
        /// Name inside the image (defaults to the host file name)
        name: Option<String>,
    },
    /// Print a file to stdout
    Cat { name: String },
    /// Delete a file
    Rm { name: String },
    /// Show a file's inode number and size
    Stat { name: String },
    /// Show disk geometry and usage
    Info,
}

fn read_file(fs: &FileSystem, name: &str) -> Result<Vec<u8>> {
    let fd = fs.open(name, OpenMode::Read)?;
    let mut data = vec![0u8; fs.fsize(&fd)? as usize];
    let read = fs.read(&fd, &mut data);
    fs.close(&fd)?;
    data.truncate(read?);
    Ok(data)
}

fn file_size(fs: &FileSystem, name: &str) -> Result<(u16, u32)> {
    let fd = fs.open(name, OpenMode::Read)?;
    let size = fs.fsize(&fd);
    fs.close(&fd)?;
    Ok((fd.inumber(), size?))
}

/// Copies `data` into `name` and syncs, also when the write stops part way,
/// so the bytes that did land stay reachable.
fn put(fs: &FileSystem, name: &str, data: &[u8]) -> Result<usize> {
    let fd = fs.open(name, OpenMode::Write)?;
    let written = fs.write(&fd, data);
    fs.close(&fd)?;
    fs.sync()?;
    written.with_context(|| format!("writing {}", name))
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    let disk = FileDisk::open(&cli.disk)
        .with_context(|| format!("cannot open disk image {}", cli.disk.display()))?;
    let options = MountOptions {
        format_if_invalid: false,
        ..MountOptions::default()
    };
    let fs = FileSystem::mount_with(Arc::new(disk), options)
        .with_context(|| format!("cannot mount {}", cli.disk.display()))?;

    match cli.command {
        Commands::Ls => {
            for (_, name) in fs.list() {
                let (inumber, size) = file_size(&fs, &name)?;
                println!("{:>4} {:>8} {}", inumber, size, name);
            }
        }
        Commands::Put { host, name } => {
            let data = std::fs::read(&host)
                .with_context(|| format!("cannot read {}", host.display()))?;
            let name = match name {
                Some(name) => name,
                None => host
                    .file_name()
                    .context("host path has no file name")?
                    .to_string_lossy()
                    .into_owned(),
            };
            let written = put(&fs, &name, &data)?;
            debug!("copied {} bytes into {:?}", written, name);
            fs.unmount()?;
        }
        Commands::Cat { name } => {
            let data = read_file(&fs, &name)?;
            std::io::stdout().write_all(&data)?;
        }
        Commands::Rm { name } => {
            fs.delete(&name)?;
            fs.unmount()?;
        }
        Commands::Stat { name } => {
            let (inumber, size) = file_size(&fs, &name)?;
            println!("name:   {}", name);
            println!("inode:  {}", inumber);
            println!("size:   {} bytes", size);
            println!("blocks: {}", (size as usize).div_ceil(BLOCK_SIZE));
        }
        Commands::Info => {
            let stats = fs.stats()?;
            println!("blocks:      {} x {} bytes", stats.total_blocks, BLOCK_SIZE);
            println!("inodes:      {}", stats.total_inodes);
            println!("data start:  {}", stats.data_start);
            println!("free blocks: {}", stats.free_blocks);
            println!("files:       {}", stats.files);
        }
    }

    Ok(())
}
