//! Delta generation.
//!
//! Walks the new file with the suffix-index matcher, carves it into
//! approximately-matching segments, and emits the three delta streams:
//!
//! - *control* — (diff_len, extra_len, old_seek) triples, 24 bytes each;
//! - *diff*    — new-minus-old byte differences over the fuzzy regions;
//! - *extra*   — literal new-file bytes nothing in the old file resembles.
//!
//! Segment boundaries are fuzzy: each emitted run is extended forward from
//! the previous anchor and backward from the next exact match as long as at
//! least every other byte still agrees (the `2·matches − length` score),
//! and an overlap between the two extents is split where the forward side
//! stops outscoring the backward side. The streams then go through
//! [`crate::recompress::make_small`] and are framed by the small or large
//! header, or abandoned for the full-download sentinel when a delta cannot
//! beat shipping the new file whole.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::{debug, info};

use crate::header::{
    Block, Encoding, EncodingFlags, LargeHeader, SmallHeader, LARGE_HEADER_SIZE, MAGIC_FULLDL,
    MAX_FILE_SIZE, SMALL_HEADER_SIZE,
};
use crate::recompress::make_small;
use crate::search::{search, Match};
use crate::stats;
use crate::sufsort::{qsufsort, SortError};

/// A match must clear the continue-the-previous-run score by this margin
/// before it is worth starting a new segment.
const MIN_MATCH_GAIN: i64 = 8;

/// New files below this size always ship whole; tiny deltas are not worth
/// their framing.
const MIN_DIFF_SIZE: u64 = 200;

/// Deltas above this fraction of the new file's size lose to a full
/// download.
const MAX_DELTA_RATIO: f64 = 0.90;

/// Both input files must be below this size for the small header layout.
const SMALL_FILE_LIMIT: u64 = 65536;

// ─────────────────────────────────────────────────────────────────────────────
// Outcome and errors
// ─────────────────────────────────────────────────────────────────────────────

/// What the encoder wrote to the delta path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// A usable delta.
    Delta,
    /// Only the 8-byte full-download sentinel; the consumer must fetch the
    /// new file whole.
    FullDownload,
}

/// Delta generation failure.
#[derive(Debug)]
pub enum BsdiffError {
    Io(io::Error),
    Sort(SortError),
    /// The control stream outgrew its headroom, which a well-formed walk of
    /// the new file cannot do.
    ControlOverflow,
    Codec(io::Error),
}

impl fmt::Display for BsdiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BsdiffError::Io(e) => write!(f, "delta i/o error: {e}"),
            BsdiffError::Sort(e) => write!(f, "{e}"),
            BsdiffError::ControlOverflow => f.write_str("control block exceeded its headroom"),
            BsdiffError::Codec(e) => write!(f, "block compression failed: {e}"),
        }
    }
}

impl std::error::Error for BsdiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BsdiffError::Io(e) | BsdiffError::Codec(e) => Some(e),
            BsdiffError::Sort(e) => Some(e),
            BsdiffError::ControlOverflow => None,
        }
    }
}

impl From<io::Error> for BsdiffError {
    fn from(e: io::Error) -> Self {
        BsdiffError::Io(e)
    }
}

impl From<SortError> for BsdiffError {
    fn from(e: SortError) -> Self {
        BsdiffError::Sort(e)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream generation
// ─────────────────────────────────────────────────────────────────────────────

/// The three uncompressed delta streams for one (old, new) pair.
#[derive(Debug, Default)]
struct DeltaStreams {
    control: Vec<u8>,
    diff: Vec<u8>,
    extra: Vec<u8>,
}

/// Runs the matcher across `new` and emits the control/diff/extra streams.
///
/// `index` is the suffix index over `old`. Stream buffers carry
/// `new.len() + 25` bytes of headroom: up to one full control triple beyond
/// the new-file size.
fn generate_streams(index: &[i64], old: &[u8], new: &[u8]) -> Result<DeltaStreams, BsdiffError> {
    let oldsize = old.len() as i64;
    let newsize = new.len() as i64;
    let headroom = new.len() + 25;

    let mut streams = DeltaStreams {
        control: Vec::with_capacity(headroom),
        diff: Vec::with_capacity(headroom),
        extra: Vec::with_capacity(headroom),
    };

    let mut scan = 0i64;
    let mut m = Match::default();
    let mut lastscan = 0i64;
    let mut lastpos = 0i64;
    let mut lastoffset = 0i64;

    while scan < newsize {
        let mut oldscore = 0i64;

        scan += m.len;
        let mut peek = scan;
        while scan < newsize {
            m = search(index, old, &new[scan as usize..]);

            // Count how much of the candidate window the previous run
            // would cover by simply continuing at its old-file offset.
            while peek < scan + m.len {
                let old_at = peek + lastoffset;
                if (0..oldsize).contains(&old_at) && old[old_at as usize] == new[peek as usize] {
                    oldscore += 1;
                }
                peek += 1;
            }

            if (m.len == oldscore && m.len != 0) || m.len > oldscore + MIN_MATCH_GAIN {
                break;
            }

            let old_at = scan + lastoffset;
            if (0..oldsize).contains(&old_at) && old[old_at as usize] == new[scan as usize] {
                oldscore -= 1;
            }
            scan += 1;
        }

        if m.len != oldscore || scan == newsize {
            // Fuzzy-forward extent from the previous anchor: the longest
            // prefix where matches still outweigh mismatches, earliest
            // peak wins.
            let mut s = 0i64;
            let mut best_s = 0i64;
            let mut lenf = 0i64;
            let mut i = 0i64;
            while lastscan + i < scan && lastpos + i < oldsize {
                if old[(lastpos + i) as usize] == new[(lastscan + i) as usize] {
                    s += 1;
                }
                i += 1;
                if s * 2 - i > best_s * 2 - lenf {
                    best_s = s;
                    lenf = i;
                }
            }

            // Fuzzy-backward extent from the next exact match; empty when
            // the scan ran off the end of the new file.
            let mut lenb = 0i64;
            if scan < newsize {
                let mut s = 0i64;
                let mut best_s = 0i64;
                let mut i = 1i64;
                while scan >= lastscan + i && m.pos >= i {
                    if old[(m.pos - i) as usize] == new[(scan - i) as usize] {
                        s += 1;
                    }
                    if s * 2 - i > best_s * 2 - lenb {
                        best_s = s;
                        lenb = i;
                    }
                    i += 1;
                }
            }

            // The extents may claim the same new-file bytes; find the
            // split where handing bytes to the backward side stops
            // paying.
            if lastscan + lenf > scan - lenb {
                let overlap = (lastscan + lenf) - (scan - lenb);
                let mut s = 0i64;
                let mut best_s = 0i64;
                let mut lens = 0i64;
                for i in 0..overlap {
                    if new[(lastscan + lenf - overlap + i) as usize]
                        == old[(lastpos + lenf - overlap + i) as usize]
                    {
                        s += 1;
                    }
                    if new[(scan - lenb + i) as usize] == old[(m.pos - lenb + i) as usize] {
                        s -= 1;
                    }
                    if s > best_s {
                        best_s = s;
                        lens = i + 1;
                    }
                }
                lenf += lens - overlap;
                lenb -= lens;
            }

            for i in 0..lenf {
                streams
                    .diff
                    .push(new[(lastscan + i) as usize].wrapping_sub(old[(lastpos + i) as usize]));
            }
            let extra_len = (scan - lenb) - (lastscan + lenf);
            for i in 0..extra_len {
                streams.extra.push(new[(lastscan + lenf + i) as usize]);
            }

            if streams.control.len() + 24 > headroom {
                return Err(BsdiffError::ControlOverflow);
            }
            streams.control.extend_from_slice(&lenf.to_le_bytes());
            streams.control.extend_from_slice(&extra_len.to_le_bytes());
            streams
                .control
                .extend_from_slice(&((m.pos - lenb) - (lastpos + lenf)).to_le_bytes());

            debug!(
                "segment: diff {lenf} extra {extra_len} seek {}",
                (m.pos - lenb) - (lastpos + lenf)
            );

            lastscan = scan - lenb;
            lastpos = m.pos - lenb;
            lastoffset = m.pos - scan;
        }
    }

    Ok(streams)
}

// ─────────────────────────────────────────────────────────────────────────────
// Container write
// ─────────────────────────────────────────────────────────────────────────────

/// Creates `path` exclusively and writes only the full-download sentinel.
fn write_full_download(path: &Path) -> io::Result<()> {
    let mut f = OpenOptions::new().write(true).create_new(true).open(path)?;
    f.write_all(MAGIC_FULLDL)
}

/// Reads a whole file into a heap buffer, verifying the expected length.
fn read_file(f: &mut File, len: u64) -> io::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(len as usize);
    f.read_to_end(&mut data)?;
    if data.len() as u64 != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "file changed size while reading",
        ));
    }
    Ok(data)
}

/// Generates a delta taking `old_path` to `new_path`, written to
/// `delta_path` (which must not already exist). `enc` limits which block
/// encodings the recompressor may pick; [`Encoding::Any`] permits all.
///
/// Returns [`DeltaOutcome::FullDownload`] when no usable delta exists: the
/// old file is empty, an input is a directory or oversized, the new file
/// is below the minimum diff size, or the encoded delta came out larger
/// than [`MAX_DELTA_RATIO`] of the new file.
pub fn make_bsdiff_delta(
    old_path: &Path,
    new_path: &Path,
    delta_path: &Path,
    enc: Encoding,
) -> Result<DeltaOutcome, BsdiffError> {
    let old_stat = std::fs::symlink_metadata(old_path)?;
    let new_stat = std::fs::symlink_metadata(new_path)?;

    // Directories and oversized inputs cannot be diffed; the consumer
    // falls back to a whole-file transfer.
    if old_stat.is_dir()
        || new_stat.is_dir()
        || old_stat.len() > MAX_FILE_SIZE
        || new_stat.len() > MAX_FILE_SIZE
    {
        write_full_download(delta_path)?;
        return Ok(DeltaOutcome::FullDownload);
    }

    let smallfile = old_stat.len() < SMALL_FILE_LIMIT && new_stat.len() < SMALL_FILE_LIMIT;

    let mut old_file = File::open(old_path)?;
    let oldsize = old_file.metadata()?.len();

    // An empty old file gives the matcher nothing to work with.
    if oldsize == 0 {
        write_full_download(delta_path)?;
        return Ok(DeltaOutcome::FullDownload);
    }

    let old_data = read_file(&mut old_file, oldsize)?;
    drop(old_file);

    let index = qsufsort(&old_data)?;

    let mut new_file = File::open(new_path)?;
    let new_meta = new_file.metadata()?;
    let newsize = new_meta.len();

    if newsize < MIN_DIFF_SIZE {
        write_full_download(delta_path)?;
        return Ok(DeltaOutcome::FullDownload);
    }

    let new_data = read_file(&mut new_file, newsize)?;
    drop(new_file);

    let streams = generate_streams(&index, &old_data, &new_data)?;
    drop(index);

    let (cb, c_enc) = make_small(streams.control, enc, Block::Control).map_err(BsdiffError::Codec)?;
    let (db, d_enc) = make_small(streams.diff, enc, Block::Diff).map_err(BsdiffError::Codec)?;
    let (eb, e_enc) = make_small(streams.extra, enc, Block::Extra).map_err(BsdiffError::Codec)?;

    let mut delta = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(delta_path)?;

    let mut encoding = EncodingFlags::default();
    encoding.set(Block::Control, c_enc);
    encoding.set(Block::Diff, d_enc);
    encoding.set(Block::Extra, e_enc);

    // The narrow header fields must hold the real file sizes, which can
    // trail the initial stat when the input is a symlink.
    let small_layout = smallfile
        && oldsize < SMALL_FILE_LIMIT
        && newsize < SMALL_FILE_LIMIT
        && cb.len() < 256
        && db.len() < SMALL_FILE_LIMIT as usize
        && eb.len() < SMALL_FILE_LIMIT as usize;
    let first_block = if small_layout {
        SMALL_HEADER_SIZE
    } else {
        LARGE_HEADER_SIZE
    };

    let total = (first_block + cb.len() + db.len() + eb.len()) as u64;
    if total as f64 > MAX_DELTA_RATIO * newsize as f64 && enc != Encoding::None {
        delta.write_all(MAGIC_FULLDL)?;
        stats::record_full_download();
        info!(
            "delta of {total} bytes loses to downloading {newsize}; wrote full-download sentinel"
        );
        return Ok(DeltaOutcome::FullDownload);
    }

    if small_layout {
        let header = SmallHeader {
            offset_to_first_block: SMALL_HEADER_SIZE as u8,
            control_length: cb.len() as u8,
            diff_length: db.len() as u16,
            extra_length: eb.len() as u16,
            old_file_length: oldsize as u16,
            new_file_length: newsize as u16,
            file_mode: new_meta.mode(),
            file_owner: new_meta.uid(),
            file_group: new_meta.gid(),
            encoding,
        };
        delta.write_all(&header.to_bytes())?;
    } else {
        let header = LargeHeader {
            offset_to_first_block: LARGE_HEADER_SIZE as u8,
            control_length: cb.len() as u32,
            diff_length: db.len() as u64,
            extra_length: eb.len() as u64,
            old_file_length: oldsize,
            new_file_length: newsize,
            mtime: 0,
            file_mode: new_meta.mode(),
            file_owner: new_meta.uid(),
            file_group: new_meta.gid(),
            encoding,
        };
        delta.write_all(&header.to_bytes())?;
    }

    delta.write_all(&cb)?;
    if !db.is_empty() {
        delta.write_all(&db)?;
    }
    if !eb.is_empty() {
        delta.write_all(&eb)?;
    }

    stats::record_delta(newsize, total, [c_enc, d_enc, e_enc]);
    info!(
        "delta {total} bytes for {newsize} new bytes ({c_enc}/{d_enc}/{e_enc}, {} header)",
        if small_layout { "small" } else { "large" }
    );

    Ok(DeltaOutcome::Delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::read_le64_signed;

    /// Replays raw streams against `old` without any container framing.
    fn replay(streams: &DeltaStreams, old: &[u8], newsize: usize) -> Vec<u8> {
        let mut new = vec![0u8; newsize];
        let mut newpos = 0usize;
        let mut oldpos = 0i64;
        let mut diff_off = 0usize;
        let mut extra_off = 0usize;

        for triple in streams.control.chunks_exact(24) {
            let diff_len = read_le64_signed(triple, 0) as usize;
            let extra_len = read_le64_signed(triple, 8) as usize;
            let seek = read_le64_signed(triple, 16);

            for i in 0..diff_len {
                let mut b = streams.diff[diff_off + i];
                let o = oldpos + i as i64;
                if (0..old.len() as i64).contains(&o) {
                    b = b.wrapping_add(old[o as usize]);
                }
                new[newpos + i] = b;
            }
            diff_off += diff_len;
            newpos += diff_len;
            oldpos += diff_len as i64;

            new[newpos..newpos + extra_len]
                .copy_from_slice(&streams.extra[extra_off..extra_off + extra_len]);
            extra_off += extra_len;
            newpos += extra_len;
            oldpos += seek;
        }

        assert_eq!(newpos, newsize, "control stream must cover the new file");
        assert_eq!(diff_off, streams.diff.len());
        assert_eq!(extra_off, streams.extra.len());
        new
    }

    fn streams_for(old: &[u8], new: &[u8]) -> DeltaStreams {
        let index = qsufsort(old).unwrap();
        generate_streams(&index, old, new).unwrap()
    }

    #[test]
    fn identical_files_replay_exactly() {
        let old: Vec<u8> = (0..=255u8).cycle().take(2048).collect();
        let streams = streams_for(&old, &old);
        assert_eq!(replay(&streams, &old, old.len()), old);
        // One segment covering the file: the whole diff stream is zeros.
        assert_eq!(streams.diff.iter().filter(|&&b| b != 0).count(), 0);
        assert!(streams.extra.is_empty());
    }

    #[test]
    fn single_byte_flip_replays_exactly() {
        let mut state = 0x1234_5678u32;
        let old: Vec<u8> = (0..1000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        let mut new = old.clone();
        new[500] ^= 0x5a;

        let streams = streams_for(&old, &new);
        assert_eq!(replay(&streams, &old, new.len()), new);
        // A one-byte edit needs only a couple of control triples.
        assert!(streams.control.len() <= 48, "{}", streams.control.len());
    }

    #[test]
    fn appended_tail_lands_in_streams() {
        let old = vec![b'A'; 4096];
        let mut new = old.clone();
        new.extend_from_slice(&[b'B'; 50]);

        let streams = streams_for(&old, &new);
        assert_eq!(replay(&streams, &old, new.len()), new);
    }

    #[test]
    fn disjoint_inputs_replay_exactly() {
        let old = vec![0x00u8; 1024];
        let new = vec![0xffu8; 1024];
        let streams = streams_for(&old, &new);
        assert_eq!(replay(&streams, &old, new.len()), new);
    }

    #[test]
    fn interleaved_edits_replay_exactly() {
        let mut state = 0x0bad_cafeu32;
        let old: Vec<u8> = (0..8192)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        // Shift a window, splice in foreign bytes, flip scattered bytes.
        let mut new = Vec::new();
        new.extend_from_slice(&old[100..4000]);
        new.extend_from_slice(b"spliced-in run that the old file never contained");
        new.extend_from_slice(&old[4000..]);
        for i in (0..new.len()).step_by(977) {
            new[i] = new[i].wrapping_add(13);
        }

        let streams = streams_for(&old, &new);
        assert_eq!(replay(&streams, &old, new.len()), new);
    }

    #[test]
    fn empty_new_file_produces_empty_streams() {
        let old = b"some old content".to_vec();
        let streams = streams_for(&old, b"");
        assert!(streams.control.is_empty());
        assert!(streams.diff.is_empty());
        assert!(streams.extra.is_empty());
    }
}
