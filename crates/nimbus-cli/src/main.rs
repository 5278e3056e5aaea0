use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use nimbus_fs::FileKind;
use nimbus_kernel::Kernel;
use nimbus_vm::{Disk, Machine};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "The Nimbus teaching OS on a simulated MIPS machine")]
struct Cli {
    /// Disk image holding the file system
    #[arg(short, long)]
    disk: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format the disk image, destroying its contents
    Format,
    /// Run a NOFF executable stored in the file system
    Run {
        /// Path of the executable inside the file system
        path: String,
    },
    /// Create an empty file
    Create { path: String },
    /// Create a directory
    Mkdir { path: String },
    /// Remove a file
    Remove { path: String },
    /// List a directory (the root by default)
    Ls { path: Option<String> },
    /// Print a file's contents
    Cat { path: String },
    /// Dump file-system metadata
    Print,
    /// Copy a host file into the file system
    CopyIn { host: PathBuf, path: String },
    /// Copy a file out to the host
    CopyOut { path: String, host: PathBuf },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let format = matches!(cli.command, Commands::Format);
    let disk = if format {
        Disk::create(&cli.disk)
    } else {
        Disk::open(&cli.disk)
            .with_context(|| format!("opening disk image {}", cli.disk.display()))?
    };
    let mut kernel = Kernel::new(disk, format)
        .with_context(|| format!("mounting {}", cli.disk.display()))?;

    match cli.command {
        Commands::Format => {
            println!("formatted {}", cli.disk.display());
        }
        Commands::Run { path } => {
            let mut machine = Machine::new();
            kernel
                .start_initial(&mut machine, &path)
                .with_context(|| format!("loading {path}"))?;
            info!("running {path}");
            machine.run(&mut kernel).context("machine fault")?;
        }
        Commands::Create { path } => {
            kernel.fs.create(&path, 0, FileKind::Regular)?;
        }
        Commands::Mkdir { path } => {
            kernel.fs.create(&path, 0, FileKind::Directory)?;
        }
        Commands::Remove { path } => {
            if !kernel.fs.remove(&path)? {
                println!("{path} is open; removal deferred to the last close");
            }
        }
        Commands::Ls { path } => {
            for name in kernel.fs.list(path.as_deref())? {
                println!("{name}");
            }
        }
        Commands::Cat { path } => {
            let contents = kernel.fs.cat(&path)?;
            std::io::stdout().write_all(&contents)?;
        }
        Commands::Print => {
            print!("{}", kernel.fs.print()?);
        }
        Commands::CopyIn { host, path } => {
            let bytes =
                fs::read(&host).with_context(|| format!("reading {}", host.display()))?;
            kernel.fs.create(&path, bytes.len() as u32, FileKind::Regular)?;
            let mut file = kernel.fs.open(&path)?;
            kernel.fs.write_at(&mut file, &bytes, 0)?;
            kernel.fs.close(file);
        }
        Commands::CopyOut { path, host } => {
            let contents = kernel.fs.cat(&path)?;
            fs::write(&host, contents)
                .with_context(|| format!("writing {}", host.display()))?;
        }
    }

    kernel.fs.sync().context("flushing the disk image")?;
    Ok(())
}
