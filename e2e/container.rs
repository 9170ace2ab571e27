// e2e/container.rs — delta container format checks.
//
// Verifies what a delta file looks like on disk: magic selection, header
// geometry against the real file size, encode determinism, and rejection
// of damaged containers.

use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

use bsdiff::header::{Block, LargeHeader, SmallHeader};
use bsdiff::{apply_bsdiff_delta, make_bsdiff_delta, BspatchError, DeltaOutcome, Encoding};

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

fn encode(old: &[u8], new: &[u8], enc: Encoding) -> (TempDir, PathBuf, Vec<u8>) {
    let dir = TempDir::new().unwrap();
    let old_path = dir.path().join("old");
    let new_path = dir.path().join("new");
    let delta_path = dir.path().join("delta");
    fs::write(&old_path, old).unwrap();
    fs::write(&new_path, new).unwrap();
    let outcome = make_bsdiff_delta(&old_path, &new_path, &delta_path, enc).unwrap();
    assert_eq!(outcome, DeltaOutcome::Delta);
    let bytes = fs::read(&delta_path).unwrap();
    (dir, delta_path, bytes)
}

// ── 1. Small-header geometry tiles the file ──────────────────────────────────

#[test]
fn test_small_header_geometry_matches_file_size() {
    let old = random_bytes(0x0c0ffee1, 4096);
    let mut new = old.clone();
    new[2000] ^= 0x10;
    let (_dir, _path, bytes) = encode(&old, &new, Encoding::Any);

    assert_eq!(&bytes[0..8], b"BSDIFF4V");
    let h = SmallHeader::from_bytes(&bytes).unwrap();
    let expected = h.offset_to_first_block as u64
        + h.control_length as u64
        + h.diff_length as u64
        + h.extra_length as u64;
    assert_eq!(expected, bytes.len() as u64);
    assert_eq!(h.old_file_length as usize, old.len());
    assert_eq!(h.new_file_length as usize, new.len());
}

// ── 2. Large-header geometry tiles the file ──────────────────────────────────

#[test]
fn test_large_header_geometry_matches_file_size() {
    let old = random_bytes(0x0c0ffee2, 80 * 1024);
    let mut new = old.clone();
    new.extend_from_slice(b"tail");
    let (_dir, _path, bytes) = encode(&old, &new, Encoding::Any);

    assert_eq!(&bytes[0..8], b"BSDIFF4U");
    let h = LargeHeader::from_bytes(&bytes).unwrap();
    let expected =
        h.offset_to_first_block as u64 + h.control_length as u64 + h.diff_length + h.extra_length;
    assert_eq!(expected, bytes.len() as u64);
    assert_eq!(h.old_file_length as usize, old.len());
    assert_eq!(h.new_file_length as usize, new.len());
    assert_eq!(h.mtime, 0, "mtime is always written as zero");
}

// ── 3. One file over the small limit forces the large layout ─────────────────

#[test]
fn test_small_layout_requires_both_files_under_64k() {
    let old = random_bytes(0x0c0ffee3, 70 * 1024);
    let new = old[..32 * 1024].to_vec();
    let (_dir, _path, bytes) = encode(&old, &new, Encoding::Any);
    assert_eq!(&bytes[0..8], b"BSDIFF4U");
}

// ── 4. Determinism ───────────────────────────────────────────────────────────

#[test]
fn test_encoding_is_deterministic() {
    let old = random_bytes(0x0c0ffee4, 24 * 1024);
    let mut new = Vec::new();
    new.extend_from_slice(&old[1024..20 * 1024]);
    new.extend_from_slice(&random_bytes(0x0c0ffee5, 500));
    new.extend_from_slice(&old[..1024]);

    let (_d1, _p1, first) = encode(&old, &new, Encoding::Any);
    let (_d2, _p2, second) = encode(&old, &new, Encoding::Any);
    assert_eq!(first, second, "same inputs must produce identical deltas");
}

// ── 5. Truncated delta is rejected, nothing written ──────────────────────────

#[test]
fn test_truncated_delta_is_rejected() {
    let old = random_bytes(0x0c0ffee6, 4096);
    let mut new = old.clone();
    new[1] ^= 1;
    let (dir, delta_path, bytes) = encode(&old, &new, Encoding::Any);

    fs::write(&delta_path, &bytes[..bytes.len() - 1]).unwrap();
    let rebuilt = dir.path().join("rebuilt");
    let old_path = dir.path().join("old");
    assert!(matches!(
        apply_bsdiff_delta(&old_path, &rebuilt, &delta_path),
        Err(BspatchError::Corrupt(_))
    ));
    assert!(!rebuilt.exists(), "no partial output may be left behind");
}

// ── 6. Header length-field tampering is rejected ─────────────────────────────

#[test]
fn test_tampered_block_length_is_rejected() {
    let old = random_bytes(0x0c0ffee7, 4096);
    let mut new = old.clone();
    new[2] ^= 1;
    let (dir, delta_path, mut bytes) = encode(&old, &new, Encoding::Any);

    // Bump the small header's diff_length so the blocks no longer tile
    // the file.
    bytes[10] = bytes[10].wrapping_add(1);
    fs::write(&delta_path, &bytes).unwrap();

    let rebuilt = dir.path().join("rebuilt");
    let old_path = dir.path().join("old");
    assert!(matches!(
        apply_bsdiff_delta(&old_path, &rebuilt, &delta_path),
        Err(BspatchError::Corrupt(_))
    ));
}

// ── 7. Old file mismatch is rejected ─────────────────────────────────────────

#[test]
fn test_wrong_old_file_size_is_rejected() {
    let old = random_bytes(0x0c0ffee8, 4096);
    let mut new = old.clone();
    new[3] ^= 1;
    let (dir, delta_path, _bytes) = encode(&old, &new, Encoding::Any);

    let shorter = dir.path().join("shorter");
    fs::write(&shorter, &old[..old.len() - 10]).unwrap();
    let rebuilt = dir.path().join("rebuilt");
    assert!(matches!(
        apply_bsdiff_delta(&shorter, &rebuilt, &delta_path),
        Err(BspatchError::Corrupt(_))
    ));
}

// ── 8. Existing output path is refused ───────────────────────────────────────

#[test]
fn test_apply_refuses_existing_new_file() {
    let old = random_bytes(0x0c0ffee9, 4096);
    let mut new = old.clone();
    new[4] ^= 1;
    let (dir, delta_path, _bytes) = encode(&old, &new, Encoding::Any);

    let old_path = dir.path().join("old");
    let occupied = dir.path().join("occupied");
    fs::write(&occupied, b"already here").unwrap();
    assert!(apply_bsdiff_delta(&old_path, &occupied, &delta_path).is_err());
    assert_eq!(fs::read(&occupied).unwrap(), b"already here");
}

// ── 9. Applied file carries the encoded mode ─────────────────────────────────

#[cfg(unix)]
#[test]
fn test_apply_restores_file_mode() {
    use std::os::unix::fs::PermissionsExt;

    let old = random_bytes(0x0c0ffeea, 4096);
    let mut new = old.clone();
    new[5] ^= 1;

    let dir = TempDir::new().unwrap();
    let old_path = dir.path().join("old");
    let new_path = dir.path().join("new");
    let delta_path = dir.path().join("delta");
    fs::write(&old_path, &old).unwrap();
    fs::write(&new_path, &new).unwrap();
    fs::set_permissions(&new_path, fs::Permissions::from_mode(0o640)).unwrap();

    let outcome = make_bsdiff_delta(&old_path, &new_path, &delta_path, Encoding::Any).unwrap();
    assert_eq!(outcome, DeltaOutcome::Delta);

    let rebuilt = dir.path().join("rebuilt");
    apply_bsdiff_delta(&old_path, &rebuilt, &delta_path).unwrap();
    let mode = fs::metadata(&rebuilt).unwrap().permissions().mode();
    assert_eq!(mode & 0o7777, 0o640);
}

// ── 10. Control stream shape under raw encoding ──────────────────────────────

#[test]
fn test_raw_control_stream_is_whole_triples() {
    let old = random_bytes(0x0c0ffeeb, 16 * 1024);
    let mut new = Vec::new();
    new.extend_from_slice(&old[4096..]);
    new.extend_from_slice(&old[..4096]);
    let (_dir, _path, bytes) = encode(&old, &new, Encoding::None);

    let h = SmallHeader::from_bytes(&bytes).unwrap();
    assert_eq!(h.encoding.get(Block::Control), Encoding::None);
    assert_eq!(
        h.control_length % 24,
        0,
        "raw control block must be whole 24-byte triples"
    );
}
