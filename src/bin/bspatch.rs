//! Binary entry point for the `bspatch` delta applier.
//!
//! `bspatch OLD NEW DELTA` applies DELTA to OLD and writes NEW, which must
//! not already exist. Exit code 0 means NEW was written; 254 means the
//! delta demands a full download of NEW (sentinel delta, or a delta too
//! short to carry a header); anything else is an error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use bsdiff::{apply_bsdiff_delta, BspatchError};

/// Exit status for the full-download condition, the C-convention -2 seen
/// as a process status byte.
const FULL_DOWNLOAD_STATUS: u8 = 254;

#[derive(Parser)]
#[command(
    name = "bspatch",
    version,
    about = "Applies the binary diff DELTAFILE to OLDFILE, producing NEWFILE"
)]
struct Args {
    /// File the delta was generated against.
    oldfile: PathBuf,
    /// Output path; must not already exist.
    newfile: PathBuf,
    /// Delta input path.
    deltafile: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match apply_bsdiff_delta(&args.oldfile, &args.newfile, &args.deltafile) {
        Ok(()) => ExitCode::SUCCESS,
        Err(BspatchError::FullDownloadRequired) => {
            eprintln!("bspatch: full download required");
            ExitCode::from(FULL_DOWNLOAD_STATUS)
        }
        Err(e) => {
            eprintln!("bspatch: failed to apply delta: {e}");
            ExitCode::from(255)
        }
    }
}
