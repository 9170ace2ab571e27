//! Delta application.
//!
//! Reads the container magic, parses the matching header layout, then opens
//! three logical readers over the delta file — one per block, each
//! positioned at its absolute offset and wrapped in the decoder its
//! encoding flag names. Control triples are replayed to rebuild the new
//! file: diff bytes are added (mod 256) to old bytes, extra bytes are
//! copied literally, and the seek word repositions the old-file cursor
//! between segments. Every position update is bounds-checked before use.

use std::fmt;
use std::fs::{File, OpenOptions, Permissions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use log::debug;
use nix::unistd::{Gid, Uid};
use xz2::read::XzDecoder;

use crate::header::{
    read_le64, read_le64_signed, Block, Encoding, EncodingFlags, LargeHeader, SmallHeader,
    LARGE_HEADER_SIZE, MAGIC_DIR, MAGIC_FULLDL, MAGIC_LARGE, MAGIC_SMALL, MAX_FILE_SIZE,
    SMALL_HEADER_SIZE,
};

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Delta application failure.
#[derive(Debug)]
pub enum BspatchError {
    Io(io::Error),
    /// The delta's magic matches no known layout.
    BadMagic,
    /// The delta is a directory marker, which carries no payload to apply.
    DirectoryDelta,
    /// The delta is the full-download sentinel (or too short to carry any
    /// header); the new file must be fetched whole.
    FullDownloadRequired,
    /// The header or block data contradicts itself.
    Corrupt(&'static str),
}

impl fmt::Display for BspatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BspatchError::Io(e) => write!(f, "patch i/o error: {e}"),
            BspatchError::BadMagic => f.write_str("unrecognized delta magic"),
            BspatchError::DirectoryDelta => f.write_str("directory deltas carry no payload"),
            BspatchError::FullDownloadRequired => f.write_str("full download required"),
            BspatchError::Corrupt(what) => write!(f, "corrupt delta: {what}"),
        }
    }
}

impl std::error::Error for BspatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BspatchError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for BspatchError {
    fn from(e: io::Error) -> Self {
        BspatchError::Io(e)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Header dispatch
// ─────────────────────────────────────────────────────────────────────────────

/// Header fields shared by both layouts, widened to their wire maxima.
#[derive(Debug, Clone, Copy)]
struct DeltaGeometry {
    data_offset: u64,
    control_length: u64,
    diff_length: u64,
    extra_length: u64,
    old_file_length: u64,
    new_file_length: u64,
    file_mode: u32,
    file_owner: u32,
    file_group: u32,
    encoding: EncodingFlags,
}

impl From<LargeHeader> for DeltaGeometry {
    fn from(h: LargeHeader) -> Self {
        DeltaGeometry {
            data_offset: h.offset_to_first_block as u64,
            control_length: h.control_length as u64,
            diff_length: h.diff_length,
            extra_length: h.extra_length,
            old_file_length: h.old_file_length,
            new_file_length: h.new_file_length,
            file_mode: h.file_mode,
            file_owner: h.file_owner,
            file_group: h.file_group,
            encoding: h.encoding,
        }
    }
}

impl From<SmallHeader> for DeltaGeometry {
    fn from(h: SmallHeader) -> Self {
        DeltaGeometry {
            data_offset: h.offset_to_first_block as u64,
            control_length: h.control_length as u64,
            diff_length: h.diff_length as u64,
            extra_length: h.extra_length as u64,
            old_file_length: h.old_file_length as u64,
            new_file_length: h.new_file_length as u64,
            file_mode: h.file_mode,
            file_owner: h.file_owner,
            file_group: h.file_group,
            encoding: h.encoding,
        }
    }
}

/// Validates the header against the delta file itself: the three block
/// lengths must tile the file exactly behind the header, every length must
/// be representable as a signed offset, and ZEROS is meaningless for the
/// control block.
fn check_geometry(geom: &DeltaGeometry, delta_size: u64) -> Result<(), BspatchError> {
    let lengths = [
        geom.control_length,
        geom.diff_length,
        geom.extra_length,
        geom.old_file_length,
        geom.new_file_length,
    ];
    if lengths.iter().any(|&l| l > i64::MAX as u64) {
        return Err(BspatchError::Corrupt("length field out of range"));
    }

    let expected = geom
        .data_offset
        .checked_add(geom.control_length)
        .and_then(|s| s.checked_add(geom.diff_length))
        .and_then(|s| s.checked_add(geom.extra_length))
        .ok_or(BspatchError::Corrupt("block lengths overflow"))?;
    if expected != delta_size {
        return Err(BspatchError::Corrupt("block lengths disagree with file size"));
    }

    if geom.encoding.get(Block::Control) == Encoding::Zeros {
        return Err(BspatchError::Corrupt("control block cannot use ZEROS"));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Block readers
// ─────────────────────────────────────────────────────────────────────────────

/// Sequential reader over one delta block, decoding according to the
/// block's encoding flag.
enum BlockReader {
    Raw(File),
    Gzip(Box<GzDecoder<File>>),
    Bzip2(Box<BzDecoder<File>>),
    Xz(Box<XzDecoder<File>>),
    /// A stored zero run. The run length is read lazily from the first
    /// 8 bytes of the block; thereafter reads drain it.
    Zeros { file: File, remaining: Option<u64> },
}

impl BlockReader {
    /// Opens the delta at `path`, seeks to the block's absolute `offset`,
    /// and wraps the file in the decoder for `method`.
    fn open(
        path: &Path,
        offset: u64,
        method: Encoding,
        block: Block,
    ) -> Result<Self, BspatchError> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        match method {
            Encoding::None => Ok(BlockReader::Raw(file)),
            Encoding::Gzip => Ok(BlockReader::Gzip(Box::new(GzDecoder::new(file)))),
            Encoding::Bzip2 => Ok(BlockReader::Bzip2(Box::new(BzDecoder::new(file)))),
            Encoding::Xz => Ok(BlockReader::Xz(Box::new(XzDecoder::new(file)))),
            Encoding::Zeros if block != Block::Control => Ok(BlockReader::Zeros {
                file,
                remaining: None,
            }),
            _ => Err(BspatchError::Corrupt("block encoding missing or invalid")),
        }
    }

    /// Reads exactly `buf.len()` decoded bytes; anything short is an error.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), BspatchError> {
        if buf.is_empty() {
            return Ok(());
        }
        match self {
            BlockReader::Raw(f) => f.read_exact(buf)?,
            BlockReader::Gzip(d) => d.read_exact(buf)?,
            BlockReader::Bzip2(d) => d.read_exact(buf)?,
            BlockReader::Xz(d) => d.read_exact(buf)?,
            BlockReader::Zeros { file, remaining } => {
                let run = match *remaining {
                    Some(run) => run,
                    None => {
                        let mut len_buf = [0u8; 8];
                        file.read_exact(&mut len_buf)?;
                        read_le64(&len_buf, 0)
                    }
                };
                let wanted = buf.len() as u64;
                if run < wanted {
                    return Err(BspatchError::Corrupt("zero run over-drained"));
                }
                buf.fill(0);
                *remaining = Some(run - wanted);
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replay
// ─────────────────────────────────────────────────────────────────────────────

fn apply_geometry(
    geom: DeltaGeometry,
    old_path: &Path,
    new_path: &Path,
    delta_path: &Path,
) -> Result<(), BspatchError> {
    if geom.new_file_length > MAX_FILE_SIZE {
        return Err(BspatchError::Corrupt("new file length over the size limit"));
    }

    let mut control = BlockReader::open(
        delta_path,
        geom.data_offset,
        geom.encoding.get(Block::Control),
        Block::Control,
    )?;
    let mut diff = BlockReader::open(
        delta_path,
        geom.data_offset + geom.control_length,
        geom.encoding.get(Block::Diff),
        Block::Diff,
    )?;
    let mut extra = BlockReader::open(
        delta_path,
        geom.data_offset + geom.control_length + geom.diff_length,
        geom.encoding.get(Block::Extra),
        Block::Extra,
    )?;

    let mut old_file = File::open(old_path)?;
    let old_meta = old_file.metadata()?;
    if old_meta.len() != geom.old_file_length {
        return Err(BspatchError::Corrupt("old file length disagrees with header"));
    }
    let mut old_data = Vec::with_capacity(old_meta.len() as usize);
    old_file.read_to_end(&mut old_data)?;
    drop(old_file);

    let oldsize = old_data.len() as i64;
    let newsize = geom.new_file_length as i64;
    let mut new_data = vec![0u8; newsize as usize];

    let mut oldpos = 0i64;
    let mut newpos = 0i64;
    let mut triple = [0u8; 24];
    while newpos < newsize {
        // One control triple drives one segment: a diff run, an extra run,
        // and a seek of the old-file cursor.
        control.read_exact(&mut triple)?;
        let diff_len = read_le64_signed(&triple, 0);
        let extra_len = read_le64_signed(&triple, 8);
        let seek = read_le64_signed(&triple, 16);

        if diff_len < 0 || newpos + diff_len > newsize || newpos + diff_len < 0 {
            return Err(BspatchError::Corrupt("diff run out of bounds"));
        }
        diff.read_exact(&mut new_data[newpos as usize..(newpos + diff_len) as usize])?;

        // Diff bytes are offsets from the old data; old indices that fall
        // outside the old file contribute nothing.
        for i in 0..diff_len {
            let o = oldpos + i;
            if (0..oldsize).contains(&o) {
                let b = &mut new_data[(newpos + i) as usize];
                *b = b.wrapping_add(old_data[o as usize]);
            }
        }
        newpos += diff_len;
        oldpos += diff_len;

        if extra_len < 0 || newpos + extra_len > newsize || newpos + extra_len < 0 {
            return Err(BspatchError::Corrupt("extra run out of bounds"));
        }
        if oldpos + seek > oldsize || oldpos + seek < 0 {
            return Err(BspatchError::Corrupt("old seek out of bounds"));
        }
        extra.read_exact(&mut new_data[newpos as usize..(newpos + extra_len) as usize])?;
        newpos += extra_len;
        oldpos += seek;
    }
    drop(old_data);

    debug!(
        "replayed {} control bytes into {} new bytes",
        geom.control_length, newsize
    );

    let mut new_file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(new_path)?;
    if let Err(e) = new_file.write_all(&new_data) {
        drop(new_file);
        let _ = std::fs::remove_file(new_path);
        return Err(BspatchError::Io(e));
    }
    drop(new_file);

    nix::unistd::chown(
        new_path,
        Some(Uid::from_raw(geom.file_owner)),
        Some(Gid::from_raw(geom.file_group)),
    )
    .map_err(|e| BspatchError::Io(e.into()))?;
    std::fs::set_permissions(new_path, Permissions::from_mode(geom.file_mode))?;

    Ok(())
}

/// Applies the delta at `delta_path` to `old_path`, creating `new_path`
/// (which must not already exist).
///
/// [`BspatchError::FullDownloadRequired`] reports the two conditions the
/// caller handles by fetching the new file whole: the full-download
/// sentinel, and a delta too short to carry any header.
pub fn apply_bsdiff_delta(
    old_path: &Path,
    new_path: &Path,
    delta_path: &Path,
) -> Result<(), BspatchError> {
    let mut delta = File::open(delta_path)?;
    let delta_size = delta.metadata()?.len();
    if delta_size < 8 {
        return Err(BspatchError::FullDownloadRequired);
    }

    let mut magic = [0u8; 8];
    delta.read_exact(&mut magic)?;

    let geom: DeltaGeometry = if magic == *MAGIC_LARGE {
        let mut buf = [0u8; LARGE_HEADER_SIZE];
        buf[..8].copy_from_slice(&magic);
        delta.read_exact(&mut buf[8..])?;
        LargeHeader::from_bytes(&buf)
            .ok_or(BspatchError::Corrupt("short large header"))?
            .into()
    } else if magic == *MAGIC_SMALL {
        let mut buf = [0u8; SMALL_HEADER_SIZE];
        buf[..8].copy_from_slice(&magic);
        delta.read_exact(&mut buf[8..])?;
        SmallHeader::from_bytes(&buf)
            .ok_or(BspatchError::Corrupt("short small header"))?
            .into()
    } else if magic == *MAGIC_DIR {
        return Err(BspatchError::DirectoryDelta);
    } else if magic == *MAGIC_FULLDL {
        return Err(BspatchError::FullDownloadRequired);
    } else {
        return Err(BspatchError::BadMagic);
    };
    drop(delta);

    check_geometry(&geom, delta_size)?;
    apply_geometry(geom, old_path, new_path, delta_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(control: u64, diff: u64, extra: u64) -> DeltaGeometry {
        let mut encoding = EncodingFlags::default();
        encoding.set(Block::Control, Encoding::None);
        encoding.set(Block::Diff, Encoding::None);
        encoding.set(Block::Extra, Encoding::None);
        DeltaGeometry {
            data_offset: LARGE_HEADER_SIZE as u64,
            control_length: control,
            diff_length: diff,
            extra_length: extra,
            old_file_length: 100,
            new_file_length: 100,
            file_mode: 0o100644,
            file_owner: 0,
            file_group: 0,
            encoding,
        }
    }

    #[test]
    fn geometry_must_tile_the_file() {
        let geom = geometry(24, 100, 0);
        let good = LARGE_HEADER_SIZE as u64 + 124;
        assert!(check_geometry(&geom, good).is_ok());
        assert!(matches!(
            check_geometry(&geom, good - 1),
            Err(BspatchError::Corrupt(_))
        ));
        assert!(matches!(
            check_geometry(&geom, good + 1),
            Err(BspatchError::Corrupt(_))
        ));
    }

    #[test]
    fn geometry_rejects_unsigned_overflow() {
        let mut geom = geometry(24, 100, 0);
        geom.diff_length = u64::MAX - 16;
        assert!(check_geometry(&geom, 1000).is_err());
    }

    #[test]
    fn zeros_reader_decodes_run_length_then_drains() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block");
        std::fs::write(&path, 40u64.to_le_bytes()).unwrap();

        let mut reader = BlockReader::open(&path, 0, Encoding::Zeros, Block::Diff).unwrap();
        let mut buf = [0xffu8; 24];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0u8; 24]);

        let mut rest = [0xffu8; 16];
        reader.read_exact(&mut rest).unwrap();
        assert_eq!(rest, [0u8; 16]);

        // The run is exhausted; one more byte must fail.
        let mut over = [0u8; 1];
        assert!(matches!(
            reader.read_exact(&mut over),
            Err(BspatchError::Corrupt(_))
        ));
    }

    #[test]
    fn zeros_reader_rejected_for_control() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block");
        std::fs::write(&path, 8u64.to_le_bytes()).unwrap();
        assert!(matches!(
            BlockReader::open(&path, 0, Encoding::Zeros, Block::Control),
            Err(BspatchError::Corrupt(_))
        ));
    }

    #[test]
    fn short_delta_requests_full_download() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        let delta = dir.path().join("delta");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&delta, b"BSDIFF").unwrap();
        assert!(matches!(
            apply_bsdiff_delta(&old, &new, &delta),
            Err(BspatchError::FullDownloadRequired)
        ));
        assert!(!new.exists());
    }

    #[test]
    fn directory_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        let delta = dir.path().join("delta");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&delta, MAGIC_DIR).unwrap();
        assert!(matches!(
            apply_bsdiff_delta(&old, &new, &delta),
            Err(BspatchError::DirectoryDelta)
        ));
    }

    #[test]
    fn unknown_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        let delta = dir.path().join("delta");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&delta, b"NOTADIFF").unwrap();
        assert!(matches!(
            apply_bsdiff_delta(&old, &new, &delta),
            Err(BspatchError::BadMagic)
        ));
    }
}
