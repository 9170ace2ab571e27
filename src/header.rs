//! Delta container vocabulary: magic strings, block encodings, the 16-bit
//! per-block encoding bitfield, and the two packed header layouts.
//!
//! All multi-byte fields are little-endian and packed (no padding). Two
//! header variants exist: the large layout (v2.0) with 64-bit block lengths,
//! and the small layout (v2.1) whose narrow fields cover deltas between
//! files under 64 KiB.

use std::fmt;
use std::str::FromStr;

// ─────────────────────────────────────────────────────────────────────────────
// Size limits and magic strings
// ─────────────────────────────────────────────────────────────────────────────

/// Largest file size the codec will process, on either side: 512 MiB.
pub const MAX_FILE_SIZE: u64 = 512 * 1024 * 1024;

/// Magic for the large-header (v2.0) delta layout.
pub const MAGIC_LARGE: &[u8; 8] = b"BSDIFF4U";
/// Magic for the small-header (v2.1) delta layout.
pub const MAGIC_SMALL: &[u8; 8] = b"BSDIFF4V";
/// Directory marker; carries mode/owner/group only and no block payload.
/// Recognized on apply and rejected — no producer exists.
pub const MAGIC_DIR: &[u8; 8] = b"DIR_V20U";
/// Full-download sentinel: the delta consists of this magic alone and the
/// consumer must fetch the new file whole.
pub const MAGIC_FULLDL: &[u8; 8] = b"FULLV20U";

/// Wire size of the large header, magic included.
pub const LARGE_HEADER_SIZE: usize = 67;
/// Wire size of the small header, magic included.
pub const SMALL_HEADER_SIZE: usize = 32;

// ─────────────────────────────────────────────────────────────────────────────
// Block encodings
// ─────────────────────────────────────────────────────────────────────────────

/// Identifies the three delta payload blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Control,
    Diff,
    Extra,
}

/// Encoding applied to one payload block, or permitted by the caller.
///
/// `Any` is only meaningful as a permission: it lets the recompressor pick
/// whichever codec wins. `Zeros` is a pseudo-codec for all-zero diff/extra
/// blocks, stored as the 8-byte little-endian length of the original run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Any,
    None,
    Bzip2,
    Gzip,
    Xz,
    Zeros,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Encoding::Any => "any",
            Encoding::None => "raw",
            Encoding::Bzip2 => "bzip2",
            Encoding::Gzip => "gzip",
            Encoding::Xz => "xz",
            Encoding::Zeros => "zeros",
        };
        f.write_str(name)
    }
}

impl FromStr for Encoding {
    type Err = UnknownEncoding;

    /// Parses the CLI vocabulary. `raw` forces no compression; `any`
    /// permits every codec.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Encoding::None),
            "bzip2" => Ok(Encoding::Bzip2),
            "gzip" => Ok(Encoding::Gzip),
            "xz" => Ok(Encoding::Xz),
            "zeros" => Ok(Encoding::Zeros),
            "any" => Ok(Encoding::Any),
            _ => Err(UnknownEncoding),
        }
    }
}

/// Error returned when an encoding word is not part of the CLI vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownEncoding;

impl fmt::Display for UnknownEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown encoding algorithm")
    }
}

impl std::error::Error for UnknownEncoding {}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding flags bitfield
// ─────────────────────────────────────────────────────────────────────────────

/// 16-bit bitfield recording the chosen encoding of each block.
///
/// Bit layout (bit 0 = LSB):
///
/// | bits  | stream  | meaning                      |
/// |-------|---------|------------------------------|
/// | 0..3  | control | none / bzip2 / gzip / xz     |
/// | 4     | —       | reserved                     |
/// | 5..9  | diff    | none / bzip2 / gzip / xz / zeros |
/// | 10..14| extra   | none / bzip2 / gzip / xz / zeros |
/// | 15    | —       | reserved                     |
///
/// Valid output sets exactly one bit per stream. `Zeros` never applies to
/// the control stream; reading a flags word with no bit set for a stream
/// yields `Encoding::Any`, which the applier rejects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodingFlags(pub u16);

impl EncodingFlags {
    fn base_bit(block: Block) -> u16 {
        match block {
            Block::Control => 0,
            Block::Diff => 5,
            Block::Extra => 10,
        }
    }

    /// Records `enc` as the chosen encoding of `block`. `Any` records
    /// nothing; `Zeros` on the control block records nothing.
    pub fn set(&mut self, block: Block, enc: Encoding) {
        let base = Self::base_bit(block);
        let offset = match enc {
            Encoding::None => 0,
            Encoding::Bzip2 => 1,
            Encoding::Gzip => 2,
            Encoding::Xz => 3,
            Encoding::Zeros if block != Block::Control => 4,
            _ => return,
        };
        self.0 |= 1 << (base + offset);
    }

    /// Returns the encoding recorded for `block`, scanning the stream's bits
    /// in none/bzip2/gzip/xz/zeros order. `Any` means "no bit set".
    pub fn get(&self, block: Block) -> Encoding {
        let base = Self::base_bit(block);
        if self.0 & (1 << base) != 0 {
            Encoding::None
        } else if self.0 & (1 << (base + 1)) != 0 {
            Encoding::Bzip2
        } else if self.0 & (1 << (base + 2)) != 0 {
            Encoding::Gzip
        } else if self.0 & (1 << (base + 3)) != 0 {
            Encoding::Xz
        } else if block != Block::Control && self.0 & (1 << (base + 4)) != 0 {
            Encoding::Zeros
        } else {
            Encoding::Any
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Header layouts
// ─────────────────────────────────────────────────────────────────────────────

/// Large (v2.0) header. `mtime` is carried on the wire but always written
/// as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LargeHeader {
    pub offset_to_first_block: u8,
    pub control_length: u32,
    pub diff_length: u64,
    pub extra_length: u64,
    pub old_file_length: u64,
    pub new_file_length: u64,
    pub mtime: u64,
    pub file_mode: u32,
    pub file_owner: u32,
    pub file_group: u32,
    pub encoding: EncodingFlags,
}

impl LargeHeader {
    /// Serializes the header, magic included.
    pub fn to_bytes(&self) -> [u8; LARGE_HEADER_SIZE] {
        let mut buf = [0u8; LARGE_HEADER_SIZE];
        buf[0..8].copy_from_slice(MAGIC_LARGE);
        buf[8] = self.offset_to_first_block;
        buf[9..13].copy_from_slice(&self.control_length.to_le_bytes());
        buf[13..21].copy_from_slice(&self.diff_length.to_le_bytes());
        buf[21..29].copy_from_slice(&self.extra_length.to_le_bytes());
        buf[29..37].copy_from_slice(&self.old_file_length.to_le_bytes());
        buf[37..45].copy_from_slice(&self.new_file_length.to_le_bytes());
        buf[45..53].copy_from_slice(&self.mtime.to_le_bytes());
        buf[53..57].copy_from_slice(&self.file_mode.to_le_bytes());
        buf[57..61].copy_from_slice(&self.file_owner.to_le_bytes());
        buf[61..65].copy_from_slice(&self.file_group.to_le_bytes());
        buf[65..67].copy_from_slice(&self.encoding.0.to_le_bytes());
        buf
    }

    /// Parses a header from `buf`, which must start at the magic.
    /// Returns `None` when `buf` is too short.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < LARGE_HEADER_SIZE {
            return None;
        }
        Some(LargeHeader {
            offset_to_first_block: buf[8],
            control_length: read_le32(buf, 9),
            diff_length: read_le64(buf, 13),
            extra_length: read_le64(buf, 21),
            old_file_length: read_le64(buf, 29),
            new_file_length: read_le64(buf, 37),
            mtime: read_le64(buf, 45),
            file_mode: read_le32(buf, 53),
            file_owner: read_le32(buf, 57),
            file_group: read_le32(buf, 61),
            encoding: EncodingFlags(u16::from_le_bytes([buf[65], buf[66]])),
        })
    }
}

/// Small (v2.1) header, usable when both files are under 64 KiB and the
/// encoded blocks fit its narrow length fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmallHeader {
    pub offset_to_first_block: u8,
    pub control_length: u8,
    pub diff_length: u16,
    pub extra_length: u16,
    pub old_file_length: u16,
    pub new_file_length: u16,
    pub file_mode: u32,
    pub file_owner: u32,
    pub file_group: u32,
    pub encoding: EncodingFlags,
}

impl SmallHeader {
    /// Serializes the header, magic included.
    pub fn to_bytes(&self) -> [u8; SMALL_HEADER_SIZE] {
        let mut buf = [0u8; SMALL_HEADER_SIZE];
        buf[0..8].copy_from_slice(MAGIC_SMALL);
        buf[8] = self.offset_to_first_block;
        buf[9] = self.control_length;
        buf[10..12].copy_from_slice(&self.diff_length.to_le_bytes());
        buf[12..14].copy_from_slice(&self.extra_length.to_le_bytes());
        buf[14..16].copy_from_slice(&self.old_file_length.to_le_bytes());
        buf[16..18].copy_from_slice(&self.new_file_length.to_le_bytes());
        buf[18..22].copy_from_slice(&self.file_mode.to_le_bytes());
        buf[22..26].copy_from_slice(&self.file_owner.to_le_bytes());
        buf[26..30].copy_from_slice(&self.file_group.to_le_bytes());
        buf[30..32].copy_from_slice(&self.encoding.0.to_le_bytes());
        buf
    }

    /// Parses a header from `buf`, which must start at the magic.
    /// Returns `None` when `buf` is too short.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < SMALL_HEADER_SIZE {
            return None;
        }
        Some(SmallHeader {
            offset_to_first_block: buf[8],
            control_length: buf[9],
            diff_length: u16::from_le_bytes([buf[10], buf[11]]),
            extra_length: u16::from_le_bytes([buf[12], buf[13]]),
            old_file_length: u16::from_le_bytes([buf[14], buf[15]]),
            new_file_length: u16::from_le_bytes([buf[16], buf[17]]),
            file_mode: read_le32(buf, 18),
            file_owner: read_le32(buf, 22),
            file_group: read_le32(buf, 26),
            encoding: EncodingFlags(u16::from_le_bytes([buf[30], buf[31]])),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Byte-order helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Read a little-endian `u32` from `src` at byte `offset`.
#[inline]
pub fn read_le32(src: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        src[offset],
        src[offset + 1],
        src[offset + 2],
        src[offset + 3],
    ])
}

/// Read a little-endian `u64` from `src` at byte `offset`.
#[inline]
pub fn read_le64(src: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes([
        src[offset],
        src[offset + 1],
        src[offset + 2],
        src[offset + 3],
        src[offset + 4],
        src[offset + 5],
        src[offset + 6],
        src[offset + 7],
    ])
}

/// Read a little-endian `i64` (control-triple word) from `src` at `offset`.
#[inline]
pub fn read_le64_signed(src: &[u8], offset: usize) -> i64 {
    read_le64(src, offset) as i64
}

/// Write a little-endian `i64` (control-triple word) into `dst` at `offset`.
#[inline]
pub fn write_le64_signed(dst: &mut [u8], offset: usize, value: i64) {
    dst[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes_match_wire_layout() {
        let large = LargeHeader::default().to_bytes();
        assert_eq!(large.len(), 67);
        let small = SmallHeader::default().to_bytes();
        assert_eq!(small.len(), 32);
    }

    #[test]
    fn large_header_roundtrip() {
        let hdr = LargeHeader {
            offset_to_first_block: LARGE_HEADER_SIZE as u8,
            control_length: 48,
            diff_length: 100_000,
            extra_length: 12,
            old_file_length: 70_000,
            new_file_length: 100_050,
            mtime: 0,
            file_mode: 0o100644,
            file_owner: 1000,
            file_group: 1000,
            encoding: {
                let mut e = EncodingFlags::default();
                e.set(Block::Control, Encoding::None);
                e.set(Block::Diff, Encoding::Xz);
                e.set(Block::Extra, Encoding::Gzip);
                e
            },
        };
        let bytes = hdr.to_bytes();
        assert_eq!(&bytes[0..8], MAGIC_LARGE);
        assert_eq!(LargeHeader::from_bytes(&bytes), Some(hdr));
    }

    #[test]
    fn small_header_roundtrip() {
        let hdr = SmallHeader {
            offset_to_first_block: SMALL_HEADER_SIZE as u8,
            control_length: 24,
            diff_length: 64,
            extra_length: 0,
            old_file_length: 64,
            new_file_length: 64,
            file_mode: 0o100600,
            file_owner: 0,
            file_group: 0,
            encoding: {
                let mut e = EncodingFlags::default();
                e.set(Block::Control, Encoding::None);
                e.set(Block::Diff, Encoding::Zeros);
                e.set(Block::Extra, Encoding::None);
                e
            },
        };
        let bytes = hdr.to_bytes();
        assert_eq!(&bytes[0..8], MAGIC_SMALL);
        assert_eq!(SmallHeader::from_bytes(&bytes), Some(hdr));
    }

    #[test]
    fn flags_one_bit_per_stream() {
        let mut e = EncodingFlags::default();
        e.set(Block::Control, Encoding::Gzip);
        e.set(Block::Diff, Encoding::Zeros);
        e.set(Block::Extra, Encoding::Bzip2);
        assert_eq!(e.0, (1 << 2) | (1 << 9) | (1 << 11));
        assert_eq!(e.get(Block::Control), Encoding::Gzip);
        assert_eq!(e.get(Block::Diff), Encoding::Zeros);
        assert_eq!(e.get(Block::Extra), Encoding::Bzip2);
    }

    #[test]
    fn zeros_never_recorded_for_control() {
        let mut e = EncodingFlags::default();
        e.set(Block::Control, Encoding::Zeros);
        assert_eq!(e.0, 0);
        assert_eq!(e.get(Block::Control), Encoding::Any);
    }

    #[test]
    fn unset_stream_reads_back_as_any() {
        let e = EncodingFlags::default();
        assert_eq!(e.get(Block::Diff), Encoding::Any);
    }

    #[test]
    fn encoding_cli_vocabulary() {
        assert_eq!("raw".parse::<Encoding>(), Ok(Encoding::None));
        assert_eq!("bzip2".parse::<Encoding>(), Ok(Encoding::Bzip2));
        assert_eq!("gzip".parse::<Encoding>(), Ok(Encoding::Gzip));
        assert_eq!("xz".parse::<Encoding>(), Ok(Encoding::Xz));
        assert_eq!("zeros".parse::<Encoding>(), Ok(Encoding::Zeros));
        assert_eq!("any".parse::<Encoding>(), Ok(Encoding::Any));
        assert!("deflate".parse::<Encoding>().is_err());
    }
}
