use anyhow::{bail, Context};
use clap::Parser;
use nimbus_fs::{NUM_SECTORS, SECTOR_SIZE};
use nimbus_kernel::fs::FileSystem;
use nimbus_vm::Disk;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "Create and format a Nimbus disk image")]
struct Cli {
    /// Path to the disk image
    #[arg(short, long)]
    disk: PathBuf,

    /// Overwrite an existing image
    #[arg(short, long)]
    force: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.disk.exists() && !cli.force {
        bail!("{} already exists (use --force to overwrite)", cli.disk.display());
    }

    let fs = FileSystem::format(Disk::create(&cli.disk))
        .with_context(|| format!("formatting {}", cli.disk.display()))?;
    fs.sync()
        .with_context(|| format!("writing {}", cli.disk.display()))?;

    println!(
        "formatted {} ({} sectors of {} bytes)",
        cli.disk.display(),
        NUM_SECTORS,
        SECTOR_SIZE
    );
    Ok(())
}
