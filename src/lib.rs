// bsdiff v2.x binary delta codec

pub mod diff;
pub mod header;
pub mod patch;
pub mod recompress;
pub mod search;
pub mod stats;
pub mod sufsort;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level re-exports for the two operations and their vocabulary.
// ─────────────────────────────────────────────────────────────────────────────

/// Generate a delta file from an (old, new) file pair.
pub use diff::make_bsdiff_delta;
/// Encoder result: a usable delta, or the full-download sentinel.
pub use diff::DeltaOutcome;
/// Delta generation failure.
pub use diff::BsdiffError;

/// Rebuild the new file from the old file plus a delta.
pub use patch::apply_bsdiff_delta;
/// Delta application failure, including the distinct full-download case.
pub use patch::BspatchError;

/// Per-block encoding tag; also the CLI permission vocabulary via
/// [`std::str::FromStr`].
pub use header::Encoding;
/// The 16-bit per-block encoding bitfield carried in delta headers.
pub use header::EncodingFlags;

/// Suffix sorting over the old file, exposed for direct index reuse.
pub use sufsort::qsufsort;
