//! Binary entry point for the `bsdiff` delta encoder.
//!
//! `bsdiff OLD NEW DELTA [ENCODING]` writes a delta file taking OLD to NEW.
//! Exit code 0 means a usable delta was written, 1 means the delta file
//! holds only the full-download sentinel and the consumer should ship NEW
//! whole; anything else is an error.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context};
use clap::Parser;

use bsdiff::{make_bsdiff_delta, DeltaOutcome, Encoding};

#[derive(Parser)]
#[command(
    name = "bsdiff",
    version,
    about = "Creates a binary diff DELTAFILE from OLDFILE to NEWFILE"
)]
struct Args {
    /// File the receiver already has.
    oldfile: PathBuf,
    /// File the delta reconstructs.
    newfile: PathBuf,
    /// Delta output path; must not already exist.
    deltafile: PathBuf,
    /// Permitted block encoding: raw, bzip2, gzip, xz, zeros or any.
    /// 'raw' forces no compression.
    #[arg(default_value = "any")]
    encoding: String,
}

fn run(args: &Args) -> anyhow::Result<DeltaOutcome> {
    let enc: Encoding = args
        .encoding
        .parse()
        .map_err(|_| anyhow!("unknown encoding algorithm '{}'", args.encoding))?;
    make_bsdiff_delta(&args.oldfile, &args.newfile, &args.deltafile, enc)
        .with_context(|| format!("failed to create delta {}", args.deltafile.display()))
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(DeltaOutcome::Delta) => ExitCode::SUCCESS,
        Ok(DeltaOutcome::FullDownload) => ExitCode::from(1),
        Err(e) => {
            eprintln!("bsdiff: {e:#}");
            ExitCode::from(255)
        }
    }
}
