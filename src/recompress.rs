//! Per-block codec selection.
//!
//! Each of the three delta blocks is offered to the codecs admitted by the
//! caller's encoding permission and the smallest result wins, with
//! asymmetric penalties that bias the choice toward cheap-to-decode output:
//! gzip must merely be smaller, xz must beat the running best by 1% plus 64
//! bytes, and bzip2 by 5% plus 512 bytes (the flat penalty is waived for
//! all-zero input, where bzip2 excels). An all-zero diff or extra block
//! short-circuits to the ZEROS pseudo-codec: the 8-byte length of the run.

use std::io::{self, Write};
use std::sync::Mutex;

use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use log::debug;
use xz2::stream::{Check, Stream};
use xz2::write::XzEncoder;

use crate::header::{Block, Encoding};

/// Preset modifier selecting the slower, stronger xz encoder variant.
const XZ_PRESET_EXTREME: u32 = 1 << 31;

/// Flat size penalty applied to bzip2 candidates, charged for its
/// decompression cost.
const BZIP2_PENALTY: f64 = 512.0;

/// The xz encoder is not reentrant under the preset used here; every
/// encode in the process takes this lock around the xz call.
static XZ_ENCODER_LOCK: Mutex<()> = Mutex::new(());

/// Offers `buf` to the codecs admitted by `permitted` and returns the
/// winning bytes with their encoding tag. The input buffer is returned
/// unchanged (tagged `None`) when nothing beats it.
///
/// A candidate that fails to come in under its threshold is simply
/// discarded; only a genuine codec failure is an error.
pub fn make_small(
    buf: Vec<u8>,
    permitted: Encoding,
    block: Block,
) -> io::Result<(Vec<u8>, Encoding)> {
    if permitted == Encoding::None || buf.is_empty() {
        return Ok((buf, Encoding::None));
    }

    let nonzero = buf.iter().filter(|&&b| b != 0).count();
    let mut bzip2_penalty = BZIP2_PENALTY;
    if nonzero == 0 {
        if permitted == Encoding::Any && block != Block::Control {
            let run = buf.len() as u64;
            debug!("{block:?} block: {run} zero bytes stored as ZEROS run");
            return Ok((run.to_le_bytes().to_vec(), Encoding::Zeros));
        }
        bzip2_penalty = 0.0;
    }

    // Every candidate compresses the original block; "best" tracks only
    // the size each later candidate has to beat.
    let source = buf;
    let mut best_len = source.len();
    let mut winner: Option<(Vec<u8>, Encoding)> = None;

    // gzip first: fast to decode and compresses well.
    if matches!(permitted, Encoding::Any | Encoding::Gzip) {
        let gz = gzip_compress(&source)?;
        if gz.len() < best_len {
            best_len = gz.len();
            winner = Some((gz, Encoding::Gzip));
        }
    }

    // xz decodes slower but wins on larger blocks; it must beat the
    // running best by a margin that covers its decompression cost.
    if matches!(permitted, Encoding::Any | Encoding::Xz) {
        let xz = xz_compress(&source)?;
        if 1.01 * xz.len() as f64 + 64.0 < best_len as f64 {
            best_len = xz.len();
            winner = Some((xz, Encoding::Xz));
        }
    }

    // bzip2 is the slowest of the set to decode, but for some inputs does
    // really well; it pays the largest margin.
    if matches!(permitted, Encoding::Any | Encoding::Bzip2) {
        let bz = bzip2_compress(&source)?;
        if 1.05 * bz.len() as f64 + bzip2_penalty < best_len as f64 {
            winner = Some((bz, Encoding::Bzip2));
        }
    }

    let (best, smallest) = winner.unwrap_or((source, Encoding::None));
    debug!("{block:?} block: {} bytes as {smallest}", best.len());
    Ok((best, smallest))
}

/// Deflate with a gzip wrapper at maximum level. The wrapper (not bare
/// zlib framing) is what the block readers on the apply side expect.
fn gzip_compress(source: &[u8]) -> io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(
        Vec::with_capacity(source.len() / 2 + 64),
        flate2::Compression::new(9),
    );
    enc.write_all(source)?;
    enc.finish()
}

/// xz stream, preset 9 extreme. CRC32 is the cheapest check the format
/// decoders accept.
fn xz_compress(source: &[u8]) -> io::Result<Vec<u8>> {
    let _serialized = XZ_ENCODER_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let stream = Stream::new_easy_encoder(9 | XZ_PRESET_EXTREME, Check::Crc32)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let mut enc = XzEncoder::new_stream(Vec::with_capacity(source.len() / 2 + 128), stream);
    enc.write_all(source)?;
    enc.finish()
}

/// bzip2 at the largest block size.
fn bzip2_compress(source: &[u8]) -> io::Result<Vec<u8>> {
    let mut enc = BzEncoder::new(
        Vec::with_capacity(source.len() / 2 + 64),
        bzip2::Compression::best(),
    );
    enc.write_all(source)?;
    enc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn decode(bytes: &[u8], enc: Encoding) -> Vec<u8> {
        let mut out = Vec::new();
        match enc {
            Encoding::None => out.extend_from_slice(bytes),
            Encoding::Gzip => {
                flate2::read::GzDecoder::new(bytes)
                    .read_to_end(&mut out)
                    .unwrap();
            }
            Encoding::Bzip2 => {
                bzip2::read::BzDecoder::new(bytes)
                    .read_to_end(&mut out)
                    .unwrap();
            }
            Encoding::Xz => {
                xz2::read::XzDecoder::new(bytes)
                    .read_to_end(&mut out)
                    .unwrap();
            }
            Encoding::Zeros => {
                let run = u64::from_le_bytes(bytes.try_into().unwrap());
                out = vec![0u8; run as usize];
            }
            Encoding::Any => panic!("make_small returned Any"),
        }
        out
    }

    #[test]
    fn raw_permission_returns_input_untouched() {
        let buf = vec![7u8; 4096];
        let (out, enc) = make_small(buf.clone(), Encoding::None, Block::Diff).unwrap();
        assert_eq!(enc, Encoding::None);
        assert_eq!(out, buf);
    }

    #[test]
    fn empty_block_is_left_alone() {
        let (out, enc) = make_small(Vec::new(), Encoding::Any, Block::Extra).unwrap();
        assert_eq!(enc, Encoding::None);
        assert!(out.is_empty());
    }

    #[test]
    fn zero_diff_block_collapses_to_run_length() {
        let (out, enc) = make_small(vec![0u8; 64], Encoding::Any, Block::Diff).unwrap();
        assert_eq!(enc, Encoding::Zeros);
        assert_eq!(out, 64u64.to_le_bytes());
    }

    #[test]
    fn zero_control_block_never_uses_zeros() {
        let (out, enc) = make_small(vec![0u8; 4096], Encoding::Any, Block::Control).unwrap();
        assert_ne!(enc, Encoding::Zeros);
        assert_eq!(decode(&out, enc), vec![0u8; 4096]);
    }

    #[test]
    fn zeros_shortcut_requires_any_permission() {
        let (out, enc) = make_small(vec![0u8; 4096], Encoding::Gzip, Block::Diff).unwrap();
        assert_eq!(enc, Encoding::Gzip);
        assert_eq!(decode(&out, enc), vec![0u8; 4096]);
    }

    #[test]
    fn compressible_block_shrinks_and_roundtrips() {
        let buf: Vec<u8> = b"delta codec delta codec "
            .iter()
            .copied()
            .cycle()
            .take(8192)
            .collect();
        let (out, enc) = make_small(buf.clone(), Encoding::Any, Block::Extra).unwrap();
        assert_ne!(enc, Encoding::None);
        assert!(out.len() < buf.len());
        assert_eq!(decode(&out, enc), buf);
    }

    #[test]
    fn incompressible_short_block_stays_raw() {
        // Too short for any codec to amortize its framing.
        let mut state = 0xdeadbeefu32;
        let buf: Vec<u8> = (0..24)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        let (out, enc) = make_small(buf.clone(), Encoding::Any, Block::Diff).unwrap();
        assert_eq!(enc, Encoding::None);
        assert_eq!(out, buf);
    }

    #[test]
    fn forced_codec_is_honored_or_skipped() {
        let buf: Vec<u8> = b"abcd".iter().copied().cycle().take(4096).collect();
        for forced in [Encoding::Gzip, Encoding::Bzip2, Encoding::Xz] {
            let (out, enc) = make_small(buf.clone(), forced, Block::Extra).unwrap();
            assert!(enc == forced || enc == Encoding::None);
            assert_eq!(decode(&out, enc), buf);
        }
    }

    #[test]
    fn zeros_permission_admits_no_codec() {
        // `zeros` as the permitted tag admits neither the codecs nor the
        // run-length shortcut, so blocks pass through untouched.
        let (out, enc) = make_small(vec![0u8; 256], Encoding::Zeros, Block::Diff).unwrap();
        assert_eq!(enc, Encoding::None);
        assert_eq!(out, vec![0u8; 256]);
    }
}
