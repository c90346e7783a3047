use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use docker2oci::{ConvertOptions, Converter, Notifier, UnknownEntryPolicy};

/// Version line for `--version`, including the image-spec revision produced.
const LONG_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (OCI image-spec 1.1.0)");

#[derive(Parser)]
#[command(author, version, long_version = LONG_VERSION, about, long_about = None)]
struct Cli {
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Also switches to text-based progress"
    )]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a `docker save` archive into an OCI image layout
    Convert {
        #[arg(help = "Directory to create the OCI image layout in (must not exist)")]
        output: PathBuf,

        #[arg(
            short,
            long,
            help = "Archive to read; reads stdin when omitted or \"-\""
        )]
        input: Option<PathBuf>,

        #[arg(
            long,
            help = "Fail on archive entries that are not files, directories or links"
        )]
        strict: bool,

        #[arg(long, help = "Re-hash every blob after the layout is written")]
        verify: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let notifier = Notifier::new(cli.verbose);
    notifier.install_global_logger()?;

    match cli.command {
        Commands::Convert {
            output,
            input,
            strict,
            verify,
        } => {
            let options = ConvertOptions {
                unknown_entries: if strict {
                    UnknownEntryPolicy::Reject
                } else {
                    UnknownEntryPolicy::Warn
                },
                verify,
            };
            debug!("Output directory: {}", output.display());
            debug!("Options: {:?}", options);

            let converter = Converter::new(options, notifier);
            let index = match input.as_deref().filter(|p| *p != Path::new("-")) {
                Some(path) => {
                    info!("Reading archive from {}", path.display());
                    let file = File::open(path)
                        .with_context(|| format!("Failed to open archive: {}", path.display()))?;
                    converter.convert(BufReader::new(file), &output)?
                }
                None => {
                    info!("Reading archive from stdin");
                    converter.convert(io::stdin().lock(), &output)?
                }
            };

            info!(
                "Wrote {} image(s) to {}",
                index.manifests().len(),
                output.display()
            );
        }
    }

    Ok(())
}
