use std::fs;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

/// Decrypt and extract PlayStation PKG archives
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract a PKG file into a directory tree or a ZIP archive
    #[command(alias = "x")]
    Unpack {
        /// Input PKG file
        input: PathBuf,
        /// Output directory
        output: PathBuf,
        /// License in zRIF format
        #[arg(short, long)]
        license: Option<String>,
        /// Create a ZIP archive instead of a directory tree
        #[arg(short, long, default_value_t = false)]
        zip: bool,
    },
    /// Decode a zRIF license string into a raw rif file
    RifDecode {
        /// zRIF string
        zrif: String,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Encode a raw rif file into a zRIF license string
    RifEncode {
        /// Input rif file
        input: PathBuf,
    },
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match args.command {
        Commands::Unpack {
            input,
            output,
            license,
            zip,
        } => {
            let file = fs::File::open(&input)
                .with_context(|| format!("cannot open {}", input.display()))?;
            let mut pkg = pkgrip::Reader::new(BufReader::new(file), license.as_deref())?;

            info!(
                "unpacking {} \"{}\" ({})",
                pkg.package_type(),
                pkg.title(),
                pkg.title_id()
            );

            if zip {
                let path = pkg.unpack_to_zip(&output)?;
                info!("wrote {}", path.display());
            } else {
                pkg.unpack_to_dir(&output)?;
            }

            if pkg.is_valid() {
                info!("PKG hash check OK");
            } else {
                warn!("PKG SHA1 check failed");
                warn!("actual:   {}", hex(pkg.calculated_hash().unwrap_or_default()));
                warn!("expected: {}", hex(pkg.file_hash().unwrap_or_default()));
            }
        }
        Commands::RifDecode { zrif, output } => {
            let rif = pkgrip::license::decode(&zrif, 0)?;
            match output {
                Some(path) => fs::write(&path, &rif)
                    .with_context(|| format!("cannot write {}", path.display()))?,
                None => io::stdout().write_all(&rif)?,
            }
        }
        Commands::RifEncode { input } => {
            let rif = fs::read(&input)
                .with_context(|| format!("cannot read {}", input.display()))?;
            println!("{}", pkgrip::license::encode(&rif)?);
        }
    }

    Ok(())
}
