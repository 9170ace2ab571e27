//! Process-wide encode statistics.
//!
//! Diagnostic counters only — they are not part of the delta contract.
//! Updates are atomic so concurrent encodes may run in separate threads,
//! but no ordering is promised between a counter update and the encode
//! that produced it.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::header::Encoding;

static FILES: AtomicU64 = AtomicU64::new(0);
static NEW_BYTES: AtomicU64 = AtomicU64::new(0);
static OUTPUT_BYTES: AtomicU64 = AtomicU64::new(0);
static NONE_BLOCKS: AtomicU64 = AtomicU64::new(0);
static GZIP_BLOCKS: AtomicU64 = AtomicU64::new(0);
static BZIP2_BLOCKS: AtomicU64 = AtomicU64::new(0);
static XZ_BLOCKS: AtomicU64 = AtomicU64::new(0);
static ZEROS_BLOCKS: AtomicU64 = AtomicU64::new(0);
static FULL_DOWNLOADS: AtomicU64 = AtomicU64::new(0);

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Deltas written (full downloads excluded).
    pub files: u64,
    /// Total new-file bytes consumed.
    pub new_bytes: u64,
    /// Total delta bytes produced (header + blocks).
    pub output_bytes: u64,
    /// Blocks written per encoding.
    pub none_blocks: u64,
    pub gzip_blocks: u64,
    pub bzip2_blocks: u64,
    pub xz_blocks: u64,
    pub zeros_blocks: u64,
    /// Deltas abandoned for the full-download sentinel because the encoded
    /// result was too large.
    pub full_downloads: u64,
}

/// Returns the current counter values.
pub fn snapshot() -> Snapshot {
    Snapshot {
        files: FILES.load(Ordering::Relaxed),
        new_bytes: NEW_BYTES.load(Ordering::Relaxed),
        output_bytes: OUTPUT_BYTES.load(Ordering::Relaxed),
        none_blocks: NONE_BLOCKS.load(Ordering::Relaxed),
        gzip_blocks: GZIP_BLOCKS.load(Ordering::Relaxed),
        bzip2_blocks: BZIP2_BLOCKS.load(Ordering::Relaxed),
        xz_blocks: XZ_BLOCKS.load(Ordering::Relaxed),
        zeros_blocks: ZEROS_BLOCKS.load(Ordering::Relaxed),
        full_downloads: FULL_DOWNLOADS.load(Ordering::Relaxed),
    }
}

/// Records one written delta: sizes plus one count per block encoding.
pub(crate) fn record_delta(new_bytes: u64, output_bytes: u64, encodings: [Encoding; 3]) {
    FILES.fetch_add(1, Ordering::Relaxed);
    NEW_BYTES.fetch_add(new_bytes, Ordering::Relaxed);
    OUTPUT_BYTES.fetch_add(output_bytes, Ordering::Relaxed);
    for enc in encodings {
        let counter = match enc {
            Encoding::None => &NONE_BLOCKS,
            Encoding::Gzip => &GZIP_BLOCKS,
            Encoding::Bzip2 => &BZIP2_BLOCKS,
            Encoding::Xz => &XZ_BLOCKS,
            Encoding::Zeros => &ZEROS_BLOCKS,
            Encoding::Any => continue,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Records a delta abandoned in favor of a full download.
pub(crate) fn record_full_download() {
    FULL_DOWNLOADS.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_delta_counts_each_block_encoding() {
        let before = snapshot();
        record_delta(1000, 120, [Encoding::None, Encoding::Xz, Encoding::Zeros]);
        let after = snapshot();
        assert_eq!(after.files - before.files, 1);
        assert_eq!(after.new_bytes - before.new_bytes, 1000);
        assert_eq!(after.output_bytes - before.output_bytes, 120);
        assert_eq!(after.none_blocks - before.none_blocks, 1);
        assert_eq!(after.xz_blocks - before.xz_blocks, 1);
        assert_eq!(after.zeros_blocks - before.zeros_blocks, 1);
    }

    #[test]
    fn record_full_download_counts() {
        let before = snapshot();
        record_full_download();
        assert_eq!(snapshot().full_downloads - before.full_downloads, 1);
    }
}
