// e2e/cli_integration.rs — CLI integration tests.
//
// Tests the `bsdiff` and `bspatch` binaries as black-box CLI tools using
// std::process::Command. Covers argument parsing, exit codes, the
// full-download exit status, and a whole-pipeline roundtrip.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

/// Locate a binary produced by Cargo.
fn cargo_bin(env_key: &str, name: &str) -> PathBuf {
    // CARGO_BIN_EXE_<name> is set by Cargo when running integration tests.
    // Fall back to walking up from the test binary location.
    if let Ok(p) = std::env::var(env_key) {
        return PathBuf::from(p);
    }
    let mut p = std::env::current_exe().unwrap();
    p.pop(); // remove test binary filename
    if p.ends_with("deps") {
        p.pop();
    }
    p.push(name);
    p
}

fn bsdiff_bin() -> PathBuf {
    cargo_bin("CARGO_BIN_EXE_bsdiff", "bsdiff")
}

fn bspatch_bin() -> PathBuf {
    cargo_bin("CARGO_BIN_EXE_bspatch", "bspatch")
}

/// Create a TempDir containing an (old, new) file pair with a small edit.
fn make_file_pair() -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().unwrap();
    let old_path = dir.path().join("old.bin");
    let new_path = dir.path().join("new.bin");
    let old: Vec<u8> = b"updateable payload line\n"
        .iter()
        .copied()
        .cycle()
        .take(8 * 1024)
        .collect();
    let mut new = old.clone();
    new[4000] = b'#';
    new.extend_from_slice(b"appended release notes\n");
    fs::write(&old_path, &old).unwrap();
    fs::write(&new_path, &new).unwrap();
    (dir, old_path, new_path)
}

// ── 1. Diff / patch roundtrip ────────────────────────────────────────────────

#[test]
fn test_cli_diff_patch_roundtrip() {
    let (dir, old, new) = make_file_pair();
    let delta = dir.path().join("delta");
    let rebuilt = dir.path().join("rebuilt.bin");

    let status = Command::new(bsdiff_bin())
        .args([&old, &new, &delta])
        .status()
        .expect("failed to run bsdiff");
    assert!(status.success(), "bsdiff should exit 0");
    assert!(delta.exists(), "delta file should exist");

    let status = Command::new(bspatch_bin())
        .args([&old, &rebuilt, &delta])
        .status()
        .expect("failed to run bspatch");
    assert!(status.success(), "bspatch should exit 0");

    assert_eq!(
        fs::read(&new).unwrap(),
        fs::read(&rebuilt).unwrap(),
        "roundtrip output must match the new file"
    );
}

// ── 2. Explicit encoding argument ────────────────────────────────────────────

#[test]
fn test_cli_encoding_argument() {
    for enc in ["raw", "bzip2", "gzip", "xz", "zeros", "any"] {
        let (dir, old, new) = make_file_pair();
        let delta = dir.path().join("delta");
        let status = Command::new(bsdiff_bin())
            .args([old.to_str().unwrap(), new.to_str().unwrap()])
            .args([delta.to_str().unwrap(), enc])
            .status()
            .expect("failed to run bsdiff");
        assert!(status.success(), "encoding '{enc}' should be accepted");
    }
}

// ── 3. Unknown encoding is an error ──────────────────────────────────────────

#[test]
fn test_cli_unknown_encoding_fails() {
    let (dir, old, new) = make_file_pair();
    let delta = dir.path().join("delta");
    let output = Command::new(bsdiff_bin())
        .args([old.to_str().unwrap(), new.to_str().unwrap()])
        .args([delta.to_str().unwrap(), "lz77"])
        .output()
        .expect("failed to run bsdiff");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("unknown encoding"),
        "stderr should name the bad encoding; got: {stderr}"
    );
    assert!(!delta.exists(), "no delta may be written on a bad encoding");
}

// ── 4. Missing arguments print usage ─────────────────────────────────────────

#[test]
fn test_cli_missing_arguments_show_usage() {
    for bin in [bsdiff_bin(), bspatch_bin()] {
        let output = Command::new(&bin)
            .output()
            .expect("failed to run binary without args");
        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(
            stderr.to_lowercase().contains("usage"),
            "missing-args stderr should contain usage; got: {stderr}"
        );
    }
}

// ── 5. Full-download sentinel exit codes ─────────────────────────────────────

#[test]
fn test_cli_full_download_exit_codes() {
    let dir = TempDir::new().unwrap();
    let old = dir.path().join("old.bin");
    let new = dir.path().join("new.bin");
    let delta = dir.path().join("delta");
    fs::write(&old, b"").unwrap();
    fs::write(&new, b"hello world").unwrap();

    // Empty old file: bsdiff exits 1 and writes the 8-byte sentinel.
    let status = Command::new(bsdiff_bin())
        .args([&old, &new, &delta])
        .status()
        .expect("failed to run bsdiff");
    assert_eq!(status.code(), Some(1));
    assert_eq!(fs::read(&delta).unwrap(), b"FULLV20U");

    // bspatch reports the distinct full-download status.
    let rebuilt = dir.path().join("rebuilt.bin");
    let status = Command::new(bspatch_bin())
        .args([&old, &rebuilt, &delta])
        .status()
        .expect("failed to run bspatch");
    assert_eq!(status.code(), Some(254));
    assert!(!rebuilt.exists());
}

// ── 6. Corrupt delta exits non-zero ──────────────────────────────────────────

#[test]
fn test_cli_corrupt_delta_fails() {
    let (dir, old, _new) = make_file_pair();
    let delta = dir.path().join("delta");
    fs::write(&delta, b"BSDIFFXXnot a real delta").unwrap();

    let rebuilt = dir.path().join("rebuilt.bin");
    let status = Command::new(bspatch_bin())
        .args([&old, &rebuilt, &delta])
        .status()
        .expect("failed to run bspatch");
    assert!(!status.success());
    assert_ne!(status.code(), Some(254));
    assert!(!rebuilt.exists());
}

// ── 7. --version ─────────────────────────────────────────────────────────────

#[test]
fn test_cli_version() {
    for bin in [bsdiff_bin(), bspatch_bin()] {
        let output = Command::new(&bin)
            .arg("--version")
            .output()
            .expect("failed to run --version");
        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(
            stdout.contains("1.0.2"),
            "--version stdout should contain the crate version; got: {stdout}"
        );
    }
}
