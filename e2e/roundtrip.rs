// e2e/roundtrip.rs — encode-then-apply round trips at the library level.
//
// Drives make_bsdiff_delta and apply_bsdiff_delta through temp-dir file
// pairs covering the interesting input shapes: empty old file, all-zero
// files, single-byte edits, appended tails, disjoint contents, and the
// full-download fallback.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use bsdiff::{apply_bsdiff_delta, make_bsdiff_delta, BspatchError, DeltaOutcome, Encoding};

/// Deterministic pseudo-random bytes (xorshift32).
fn random_bytes(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// Writes `old` and `new` into a fresh TempDir and returns the dir plus
/// the three working paths.
fn workspace(old: &[u8], new: &[u8]) -> (TempDir, PathBuf, PathBuf, PathBuf) {
    let dir = TempDir::new().unwrap();
    let old_path = dir.path().join("old");
    let new_path = dir.path().join("new");
    let delta_path = dir.path().join("delta");
    fs::write(&old_path, old).unwrap();
    fs::write(&new_path, new).unwrap();
    (dir, old_path, new_path, delta_path)
}

/// Encodes, applies, and asserts the rebuilt file equals `new`.
fn assert_roundtrip(old_path: &Path, new_path: &Path, delta_path: &Path, enc: Encoding) {
    let outcome = make_bsdiff_delta(old_path, new_path, delta_path, enc).unwrap();
    assert_eq!(outcome, DeltaOutcome::Delta);

    let rebuilt_path = delta_path.with_extension("rebuilt");
    apply_bsdiff_delta(old_path, &rebuilt_path, delta_path).unwrap();
    assert_eq!(
        fs::read(&rebuilt_path).unwrap(),
        fs::read(new_path).unwrap(),
        "rebuilt file must match the new file byte for byte"
    );
}

// ── 1. Empty old file → full-download sentinel ───────────────────────────────

#[test]
fn test_empty_old_file_yields_full_download_sentinel() {
    let (_dir, old, new, delta) = workspace(b"", b"hello world");
    let outcome = make_bsdiff_delta(&old, &new, &delta, Encoding::Any).unwrap();
    assert_eq!(outcome, DeltaOutcome::FullDownload);
    assert_eq!(fs::read(&delta).unwrap(), b"FULLV20U");

    let rebuilt = delta.with_extension("rebuilt");
    assert!(matches!(
        apply_bsdiff_delta(&old, &rebuilt, &delta),
        Err(BspatchError::FullDownloadRequired)
    ));
    assert!(!rebuilt.exists());
}

// ── 2. All-zero files → ZEROS diff block ─────────────────────────────────────

#[test]
fn test_identical_zero_files_use_zeros_diff_block() {
    let zeros = vec![0u8; 256];
    let (_dir, old, new, delta) = workspace(&zeros, &zeros);
    assert_roundtrip(&old, &new, &delta, Encoding::Any);

    let bytes = fs::read(&delta).unwrap();
    assert_eq!(&bytes[0..8], b"BSDIFF4V", "small header expected");
    let header = bsdiff::header::SmallHeader::from_bytes(&bytes).unwrap();
    assert_eq!(
        header.encoding.get(bsdiff::header::Block::Diff),
        Encoding::Zeros
    );
    assert_eq!(header.diff_length, 8, "ZEROS payload is one 64-bit length");

    // The 8-byte payload decodes to the zero-run length.
    let diff_off = header.offset_to_first_block as usize + header.control_length as usize;
    let run = u64::from_le_bytes(bytes[diff_off..diff_off + 8].try_into().unwrap());
    assert_eq!(run, 256);
}

// ── 3. Single-byte edit → compact delta ──────────────────────────────────────

#[test]
fn test_single_byte_flip_makes_compact_delta() {
    let old = random_bytes(0xa5a5_0001, 1000);
    let mut new = old.clone();
    new[500] ^= 0xff;

    let (_dir, old_path, new_path, delta_path) = workspace(&old, &new);
    assert_roundtrip(&old_path, &new_path, &delta_path, Encoding::Any);

    let delta_size = fs::metadata(&delta_path).unwrap().len();
    assert!(delta_size < 200, "one-byte edit took {delta_size} bytes");
}

// ── 4. Appended tail on a large uniform file → large header ──────────────────

#[test]
fn test_appended_tail_uses_large_header() {
    let old = vec![b'A'; 100 * 1024];
    let mut new = old.clone();
    new.extend_from_slice(&[b'B'; 50]);

    let (_dir, old_path, new_path, delta_path) = workspace(&old, &new);
    assert_roundtrip(&old_path, &new_path, &delta_path, Encoding::Any);

    let bytes = fs::read(&delta_path).unwrap();
    assert_eq!(&bytes[0..8], b"BSDIFF4U", "large header expected");
    let header = bsdiff::header::LargeHeader::from_bytes(&bytes).unwrap();
    // One near-full-length match plus a short extra run: a single triple.
    assert_eq!(header.control_length, 24);
    assert!(header.extra_length > 0);
}

// ── 5. Nothing in common → full download ─────────────────────────────────────

#[test]
fn test_unrelated_incompressible_files_fall_back_to_full_download() {
    // Unrelated incompressible inputs: essentially the whole new file
    // lands in the extra block, no codec can shrink it, and the delta
    // loses to a plain download.
    let old = random_bytes(0x1111_2222, 10 * 1024);
    let new = random_bytes(0x3333_4444, 10 * 1024);

    let (_dir, old_path, new_path, delta_path) = workspace(&old, &new);
    let outcome = make_bsdiff_delta(&old_path, &new_path, &delta_path, Encoding::Any).unwrap();
    assert_eq!(outcome, DeltaOutcome::FullDownload);
    assert_eq!(fs::read(&delta_path).unwrap(), b"FULLV20U");
}

// ── 6. Identity ──────────────────────────────────────────────────────────────

#[test]
fn test_identity_delta_is_smaller_than_input() {
    let content: Vec<u8> = b"identity round trip over a compressible body\n"
        .iter()
        .copied()
        .cycle()
        .take(4096)
        .collect();
    let (_dir, old, new, delta) = workspace(&content, &content);
    assert_roundtrip(&old, &new, &delta, Encoding::Any);
    assert!(fs::metadata(&delta).unwrap().len() < content.len() as u64);
}

// ── 7. New file below the minimum diff size ──────────────────────────────────

#[test]
fn test_tiny_new_file_yields_full_download_sentinel() {
    let (_dir, old, new, delta) = workspace(&[7u8; 1024], &[7u8; 199]);
    let outcome = make_bsdiff_delta(&old, &new, &delta, Encoding::Any).unwrap();
    assert_eq!(outcome, DeltaOutcome::FullDownload);
    assert_eq!(fs::metadata(&delta).unwrap().len(), 8);
}

// ── 8. Round trips across input shapes and encodings ─────────────────────────

#[test]
fn test_roundtrip_shifted_window() {
    let old = random_bytes(0x5555_0001, 32 * 1024);
    let mut new = old[512..].to_vec();
    new.extend_from_slice(&random_bytes(0x5555_0002, 700));

    let (_dir, old_path, new_path, delta_path) = workspace(&old, &new);
    assert_roundtrip(&old_path, &new_path, &delta_path, Encoding::Any);
}

#[test]
fn test_roundtrip_scattered_edits() {
    let old = random_bytes(0x6666_0001, 48 * 1024);
    let mut new = old.clone();
    for i in (0..new.len()).step_by(1111) {
        new[i] = new[i].wrapping_add(1);
    }

    let (_dir, old_path, new_path, delta_path) = workspace(&old, &new);
    assert_roundtrip(&old_path, &new_path, &delta_path, Encoding::Any);
}

#[test]
fn test_roundtrip_forced_raw_encoding() {
    let old = random_bytes(0x7777_0001, 8 * 1024);
    let mut new = old.clone();
    new[4096] ^= 0x42;

    let (_dir, old_path, new_path, delta_path) = workspace(&old, &new);
    assert_roundtrip(&old_path, &new_path, &delta_path, Encoding::None);

    // raw forces every block uncompressed.
    let bytes = fs::read(&delta_path).unwrap();
    let header = bsdiff::header::SmallHeader::from_bytes(&bytes).unwrap();
    for block in [
        bsdiff::header::Block::Control,
        bsdiff::header::Block::Diff,
        bsdiff::header::Block::Extra,
    ] {
        assert_eq!(header.encoding.get(block), Encoding::None);
    }
}

#[test]
fn test_roundtrip_forced_single_codecs() {
    let old = random_bytes(0x8888_0001, 16 * 1024);
    let mut new = Vec::new();
    new.extend_from_slice(&old[..8 * 1024]);
    new.extend_from_slice(b"a fresh run of text stitched between the halves");
    new.extend_from_slice(&old[8 * 1024..]);

    for enc in [Encoding::Gzip, Encoding::Bzip2, Encoding::Xz] {
        let (_dir, old_path, new_path, delta_path) = workspace(&old, &new);
        assert_roundtrip(&old_path, &new_path, &delta_path, enc);
    }
}

// ── 9. Directory input → full download ───────────────────────────────────────

#[test]
fn test_directory_input_yields_full_download_sentinel() {
    let dir = TempDir::new().unwrap();
    let old_dir = dir.path().join("old_dir");
    fs::create_dir(&old_dir).unwrap();
    let new_path = dir.path().join("new");
    fs::write(&new_path, random_bytes(0x9999_0001, 4096)).unwrap();
    let delta_path = dir.path().join("delta");

    let outcome = make_bsdiff_delta(&old_dir, &new_path, &delta_path, Encoding::Any).unwrap();
    assert_eq!(outcome, DeltaOutcome::FullDownload);
    assert_eq!(fs::read(&delta_path).unwrap(), b"FULLV20U");
}

// ── 10. Delta file must not pre-exist ────────────────────────────────────────

#[test]
fn test_existing_delta_path_is_an_error() {
    let old = random_bytes(0xaaaa_0001, 4096);
    let mut new = old.clone();
    new[100] ^= 1;
    let (_dir, old_path, new_path, delta_path) = workspace(&old, &new);
    fs::write(&delta_path, b"occupied").unwrap();

    assert!(make_bsdiff_delta(&old_path, &new_path, &delta_path, Encoding::Any).is_err());
    assert_eq!(fs::read(&delta_path).unwrap(), b"occupied");
}
