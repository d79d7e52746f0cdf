//! Bitwise delta codec for runs of input frames.
//!
//! Each frame is encoded as the set of bits that differ from the frame before
//! it. The input is split into groups of [`GROUP_BITS`] bits; for every group
//! the encoder writes one entry per changed bit and then a stop bit:
//!
//! ```text
//! entry := 1 <value:1> <index:4>
//! group := entry* 0
//! frame := group{ceil(input_bits / GROUP_BITS)}
//! ```
//!
//! The first frame of a run is diffed against a baseline (the last frame the
//! peer acknowledged, zeroes if none). Redundantly resending the whole
//! unacknowledged run is what makes the stream survive packet loss.
//!
//! # Note
//!
//! These types are re-exported in [`__internal`](crate::__internal) for testing.
//! They are not part of the stable public API.

use std::error::Error;
use std::fmt;

use crate::network::bits::{BitReader, BitWriter};
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::BastionError;

/// Width of the bit index written for each changed bit.
pub const INDEX_BITS: usize = 4;

/// Bits covered by one encoding group.
pub const GROUP_BITS: usize = 16;

/// Largest input frame the codec accepts, in bytes.
pub const MAX_INPUT_BYTES: usize = 64;

const _: () = assert!(GROUP_BITS <= 1 << INDEX_BITS, "group must be addressable by the index nibble");

// =============================================================================
// Compression Error Types
// =============================================================================

/// Failure of the delta codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CompressionError {
    /// The bit buffer ran out mid-frame. The frame was not written.
    BufferOverflow {
        /// Bits the frame needed.
        needed: usize,
        /// Bits that were left.
        remaining: usize,
    },
    /// The stream ended in the middle of a frame.
    TruncatedStream {
        /// Bit position where decoding stopped.
        position: usize,
    },
    /// A frame or baseline had the wrong length.
    FrameSizeMismatch {
        /// The codec's input size.
        expected: usize,
        /// The length that was supplied.
        actual: usize,
    },
    /// The input size is zero or above [`MAX_INPUT_BYTES`].
    InputSizeOutOfRange {
        /// The rejected size.
        size: usize,
    },
    /// A decoded bit index points past the end of the input.
    BitIndexOutOfRange {
        /// Absolute bit position within the frame.
        bit: usize,
        /// Number of bits in a frame.
        frame_bits: usize,
    },
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferOverflow { needed, remaining } => write!(
                f,
                "bit buffer overflow: frame needs {} bits, {} remaining",
                needed, remaining
            ),
            Self::TruncatedStream { position } => {
                write!(f, "delta stream truncated at bit {}", position)
            },
            Self::FrameSizeMismatch { expected, actual } => write!(
                f,
                "frame size mismatch: expected {} bytes, got {}",
                expected, actual
            ),
            Self::InputSizeOutOfRange { size } => write!(
                f,
                "input size {} is outside 1..={}",
                size, MAX_INPUT_BYTES
            ),
            Self::BitIndexOutOfRange { bit, frame_bits } => write!(
                f,
                "bit index {} out of range for a {}-bit frame",
                bit, frame_bits
            ),
        }
    }
}

impl Error for CompressionError {}

impl From<CompressionError> for BastionError {
    fn from(err: CompressionError) -> Self {
        Self::SerializationError {
            context: err.to_string(),
        }
    }
}

fn check_input_size(size: usize) -> Result<(), CompressionError> {
    if size == 0 || size > MAX_INPUT_BYTES {
        return Err(CompressionError::InputSizeOutOfRange { size });
    }
    Ok(())
}

fn bit_at(bytes: &[u8], bit: usize) -> bool {
    bytes
        .get(bit / 8)
        .is_some_and(|byte| (byte >> (bit % 8)) & 1 == 1)
}

fn set_bit(bytes: &mut [u8], bit: usize, value: bool) {
    if let Some(byte) = bytes.get_mut(bit / 8) {
        let mask = 1u8 << (bit % 8);
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

/// Result of encoding a run of frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRun {
    /// Packed diff stream.
    pub bits: Vec<u8>,
    /// Meaningful bits in `bits`.
    pub num_bits: usize,
    /// How many frames were written.
    pub frames: usize,
}

// =============================================================================
// Encoder
// =============================================================================

/// Writes a run of frames as deltas against a running baseline.
#[derive(Debug, Clone)]
pub struct DeltaEncoder {
    input_size: usize,
    baseline: Vec<u8>,
    writer: BitWriter,
    frames: usize,
}

impl DeltaEncoder {
    /// Creates an encoder for `input_size`-byte frames that writes at most `max_bits`.
    ///
    /// # Errors
    ///
    /// Fails if `input_size` is zero or above [`MAX_INPUT_BYTES`], or if
    /// `baseline` is not exactly `input_size` bytes.
    pub fn new(input_size: usize, baseline: &[u8], max_bits: usize) -> Result<Self, CompressionError> {
        check_input_size(input_size)?;
        if baseline.len() != input_size {
            return Err(CompressionError::FrameSizeMismatch {
                expected: input_size,
                actual: baseline.len(),
            });
        }
        Ok(Self {
            input_size,
            baseline: baseline.to_vec(),
            writer: BitWriter::with_capacity(max_bits),
            frames: 0,
        })
    }

    /// Appends one frame.
    ///
    /// On [`CompressionError::BufferOverflow`] the stream is rolled back to the
    /// previous frame boundary, so everything already pushed stays decodable.
    ///
    /// # Errors
    ///
    /// Overflow, or a frame of the wrong length.
    pub fn push(&mut self, frame: &[u8]) -> Result<(), CompressionError> {
        if frame.len() != self.input_size {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InputCodec,
                "delta encoder: frame length {} doesn't match input size {}",
                frame.len(),
                self.input_size
            );
            return Err(CompressionError::FrameSizeMismatch {
                expected: self.input_size,
                actual: frame.len(),
            });
        }

        let mark = self.writer.len();
        let frame_bits = self.input_size * 8;
        let mut group_start = 0;
        while group_start < frame_bits {
            let group_end = (group_start + GROUP_BITS).min(frame_bits);
            for bit in group_start..group_end {
                let value = bit_at(frame, bit);
                if value != bit_at(&self.baseline, bit) {
                    let ok = self.writer.write_bit(true)
                        && self.writer.write_bit(value)
                        && self.writer.write_bits((bit - group_start) as u32, INDEX_BITS);
                    if !ok {
                        return Err(self.overflow(mark, frame));
                    }
                }
            }
            if !self.writer.write_bit(false) {
                return Err(self.overflow(mark, frame));
            }
            group_start = group_end;
        }

        self.baseline.copy_from_slice(frame);
        self.frames += 1;
        Ok(())
    }

    fn overflow(&mut self, mark: usize, frame: &[u8]) -> CompressionError {
        let remaining = self.writer.capacity() - mark;
        self.writer.truncate(mark);
        CompressionError::BufferOverflow {
            needed: encoded_frame_bits(&self.baseline, frame),
            remaining,
        }
    }

    /// Frames written so far.
    #[must_use]
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Bits written so far.
    #[must_use]
    pub fn bit_len(&self) -> usize {
        self.writer.len()
    }

    /// Finishes the run.
    #[must_use]
    pub fn finish(self) -> EncodedRun {
        let (bits, num_bits) = self.writer.into_parts();
        EncodedRun {
            bits,
            num_bits,
            frames: self.frames,
        }
    }
}

/// Number of bits one frame costs when diffed against `baseline`.
#[must_use]
pub fn encoded_frame_bits(baseline: &[u8], frame: &[u8]) -> usize {
    let frame_bits = frame.len() * 8;
    let changed = (0..frame_bits)
        .filter(|&bit| bit_at(frame, bit) != bit_at(baseline, bit))
        .count();
    changed * (2 + INDEX_BITS) + frame_bits.div_ceil(GROUP_BITS)
}

/// Bits the costliest `input_size`-byte frame can take: every bit flipped.
///
/// A run budget below this may be unable to carry even one frame.
#[must_use]
pub const fn max_frame_bits(input_size: usize) -> usize {
    let frame_bits = input_size * 8;
    frame_bits * (2 + INDEX_BITS) + frame_bits.div_ceil(GROUP_BITS)
}

/// Encodes as many of `frames` as fit in `max_bits`.
///
/// Returns the run and whether every frame made it. A `false` means the
/// caller must keep the tail (`frames[run.frames..]`) for a later send.
///
/// # Errors
///
/// Propagates construction errors and frame length mismatches.
pub fn encode_run<'a, I>(
    input_size: usize,
    baseline: &[u8],
    frames: I,
    max_bits: usize,
) -> Result<(EncodedRun, bool), CompressionError>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut encoder = DeltaEncoder::new(input_size, baseline, max_bits)?;
    for frame in frames {
        match encoder.push(frame) {
            Ok(()) => {},
            Err(CompressionError::BufferOverflow { .. }) => return Ok((encoder.finish(), false)),
            Err(err) => return Err(err),
        }
    }
    Ok((encoder.finish(), true))
}

// =============================================================================
// Decoder
// =============================================================================

/// Reads frames back out of a diff stream.
#[derive(Debug, Clone)]
pub struct DeltaDecoder<'a> {
    reader: BitReader<'a>,
    baseline: Vec<u8>,
    input_size: usize,
}

impl<'a> DeltaDecoder<'a> {
    /// Creates a decoder over the first `num_bits` bits of `bits`, starting from `baseline`.
    ///
    /// # Errors
    ///
    /// Fails on an out-of-range input size or a baseline of the wrong length.
    pub fn new(
        input_size: usize,
        baseline: &[u8],
        bits: &'a [u8],
        num_bits: usize,
    ) -> Result<Self, CompressionError> {
        check_input_size(input_size)?;
        if baseline.len() != input_size {
            return Err(CompressionError::FrameSizeMismatch {
                expected: input_size,
                actual: baseline.len(),
            });
        }
        Ok(Self {
            reader: BitReader::new(bits, num_bits),
            baseline: baseline.to_vec(),
            input_size,
        })
    }

    /// Whether the whole stream has been consumed.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.reader.is_exhausted()
    }

    /// The frame the next diff is applied to.
    #[must_use]
    pub fn baseline(&self) -> &[u8] {
        &self.baseline
    }

    /// Decodes the next frame, `None` at the end of the stream.
    ///
    /// # Errors
    ///
    /// A stream that ends mid-frame or names a bit outside the frame.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CompressionError> {
        if self.reader.is_exhausted() {
            return Ok(None);
        }
        self.read_frame(true)?;
        Ok(Some(self.baseline.clone()))
    }

    /// Consumes `n` frames without applying them to the baseline.
    ///
    /// Used for frames the receiver already has. The baseline must already be
    /// the frame just before the first frame that will be read afterward.
    /// Returns how many frames were actually skipped.
    ///
    /// # Errors
    ///
    /// Same as [`next_frame`](Self::next_frame).
    pub fn skip(&mut self, n: usize) -> Result<usize, CompressionError> {
        let mut skipped = 0;
        while skipped < n && !self.reader.is_exhausted() {
            self.read_frame(false)?;
            skipped += 1;
        }
        Ok(skipped)
    }

    fn read_frame(&mut self, apply: bool) -> Result<(), CompressionError> {
        let frame_bits = self.input_size * 8;
        let mut group_start = 0;
        while group_start < frame_bits {
            loop {
                let position = self.reader.position();
                let more = self
                    .reader
                    .read_bit()
                    .ok_or(CompressionError::TruncatedStream { position })?;
                if !more {
                    break;
                }
                let value = self
                    .reader
                    .read_bit()
                    .ok_or(CompressionError::TruncatedStream { position })?;
                let index = self
                    .reader
                    .read_bits(INDEX_BITS)
                    .ok_or(CompressionError::TruncatedStream { position })?;
                let bit = group_start + index as usize;
                if bit >= frame_bits {
                    return Err(CompressionError::BitIndexOutOfRange { bit, frame_bits });
                }
                if apply {
                    set_bit(&mut self.baseline, bit, value);
                }
            }
            group_start += GROUP_BITS;
        }
        Ok(())
    }
}

/// Decodes every frame in a stream.
///
/// # Errors
///
/// Construction or stream errors from [`DeltaDecoder`].
pub fn decode_run(
    input_size: usize,
    baseline: &[u8],
    bits: &[u8],
    num_bits: usize,
) -> Result<Vec<Vec<u8>>, CompressionError> {
    let mut decoder = DeltaDecoder::new(input_size, baseline, bits, num_bits)?;
    let mut frames = Vec::new();
    while let Some(frame) = decoder.next_frame()? {
        frames.push(frame);
    }
    Ok(frames)
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod compression_tests {
    use super::*;

    fn as_slices(frames: &[Vec<u8>]) -> impl Iterator<Item = &[u8]> {
        frames.iter().map(Vec::as_slice)
    }

    #[test]
    fn test_encode_decode() {
        let baseline = vec![0, 0, 0, 1];
        let frames = vec![
            vec![0, 0, 1, 0],
            vec![0, 0, 1, 1],
            vec![0, 1, 0, 0],
            vec![0, 1, 0, 1],
            vec![0, 1, 1, 0],
        ];

        let (run, complete) = encode_run(4, &baseline, as_slices(&frames), 4096).unwrap();
        assert!(complete);
        assert_eq!(run.frames, 5);

        let decoded = decode_run(4, &baseline, &run.bits, run.num_bits).unwrap();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn test_unchanged_frame_costs_one_stop_bit_per_group() {
        let baseline = vec![7, 7, 7];
        let frames = vec![vec![7, 7, 7]];
        let (run, _) = encode_run(3, &baseline, as_slices(&frames), 4096).unwrap();
        // 24 bits => two groups
        assert_eq!(run.num_bits, 2);
        assert_eq!(run.bits, vec![0]);
    }

    #[test]
    fn test_single_bit_change_layout() {
        let baseline = vec![0, 0];
        let frames = vec![vec![0b0000_1000, 0]];
        let (run, _) = encode_run(2, &baseline, as_slices(&frames), 4096).unwrap();
        // continue=1, value=1, index=3 (1100 low bit first), stop=0
        assert_eq!(run.num_bits, 7);
        assert_eq!(run.bits, vec![0b0000_1111]);
    }

    #[test]
    fn test_empty_run() {
        let baseline = vec![0; 4];
        let (run, complete) = encode_run(4, &baseline, std::iter::empty(), 4096).unwrap();
        assert!(complete);
        assert_eq!(run.num_bits, 0);
        assert!(decode_run(4, &baseline, &run.bits, run.num_bits)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_overflow_keeps_whole_frames_only() {
        let baseline = vec![0; 2];
        let frames = vec![vec![0xFF, 0xFF], vec![0x00, 0x00], vec![0xFF, 0xFF]];
        // one full frame flip is 16 * 6 + 1 = 97 bits
        let (run, complete) = encode_run(2, &baseline, as_slices(&frames), 150).unwrap();
        assert!(!complete);
        assert_eq!(run.frames, 1);
        assert_eq!(run.num_bits, 97);

        let decoded = decode_run(2, &baseline, &run.bits, run.num_bits).unwrap();
        assert_eq!(decoded, vec![vec![0xFF, 0xFF]]);
    }

    #[test]
    fn test_push_overflow_does_not_advance_baseline() {
        let mut encoder = DeltaEncoder::new(1, &[0], 10).unwrap();
        let err = encoder.push(&[0xFF]).unwrap_err();
        assert!(matches!(err, CompressionError::BufferOverflow { remaining: 10, .. }));
        assert_eq!(encoder.bit_len(), 0);
        encoder.push(&[0]).unwrap();
        assert_eq!(encoder.frames(), 1);
    }

    #[test]
    fn test_skip_then_read_matches_full_read() {
        let baseline = vec![0, 0];
        let frames: Vec<Vec<u8>> = (1..=6u8).map(|i| vec![i, i.wrapping_mul(3)]).collect();
        let (run, _) = encode_run(2, &baseline, as_slices(&frames), 4096).unwrap();

        // receiver already has frames[0..2]; its baseline is frames[1]
        let mut decoder = DeltaDecoder::new(2, &frames[1], &run.bits, run.num_bits).unwrap();
        assert_eq!(decoder.skip(2).unwrap(), 2);
        let mut tail = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            tail.push(frame);
        }
        assert_eq!(tail, frames[2..].to_vec());
    }

    #[test]
    fn test_skip_past_end_reports_actual_count() {
        let baseline = vec![0];
        let frames = vec![vec![1], vec![2]];
        let (run, _) = encode_run(1, &baseline, as_slices(&frames), 4096).unwrap();
        let mut decoder = DeltaDecoder::new(1, &baseline, &run.bits, run.num_bits).unwrap();
        assert_eq!(decoder.skip(5).unwrap(), 2);
        assert!(decoder.is_exhausted());
    }

    #[test]
    fn test_truncated_stream_is_rejected() {
        let baseline = vec![0, 0];
        let frames = vec![vec![0xF0, 0x0F]];
        let (run, _) = encode_run(2, &baseline, as_slices(&frames), 4096).unwrap();
        let result = decode_run(2, &baseline, &run.bits, run.num_bits - 3);
        assert!(matches!(result, Err(CompressionError::TruncatedStream { .. })));
    }

    #[test]
    fn test_index_past_frame_end_is_rejected() {
        // one byte frame, entry names bit 12
        let mut writer = BitWriter::with_capacity(16);
        writer.write_bit(true);
        writer.write_bit(true);
        writer.write_bits(12, INDEX_BITS);
        writer.write_bit(false);
        let (bits, len) = writer.into_parts();
        let result = decode_run(1, &[0], &bits, len);
        assert_eq!(
            result,
            Err(CompressionError::BitIndexOutOfRange {
                bit: 12,
                frame_bits: 8
            })
        );
    }

    #[test]
    fn test_input_size_limits() {
        assert_eq!(
            DeltaEncoder::new(0, &[], 64).unwrap_err(),
            CompressionError::InputSizeOutOfRange { size: 0 }
        );
        let big = vec![0; MAX_INPUT_BYTES + 1];
        assert!(DeltaEncoder::new(big.len(), &big, 64).is_err());
        assert!(matches!(
            DeltaEncoder::new(2, &[0], 64),
            Err(CompressionError::FrameSizeMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_mismatched_frame_is_rejected() {
        let mut encoder = DeltaEncoder::new(2, &[0, 0], 64).unwrap();
        assert!(matches!(
            encoder.push(&[1]),
            Err(CompressionError::FrameSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_max_frame_bits_is_the_all_flipped_cost() {
        for size in [1, 3, MAX_INPUT_BYTES] {
            let zeroes = vec![0u8; size];
            let ones = vec![0xFFu8; size];
            assert_eq!(encoded_frame_bits(&zeroes, &ones), max_frame_bits(size));
        }
        assert_eq!(max_frame_bits(MAX_INPUT_BYTES), 512 * 6 + 32);
    }

    #[test]
    fn test_encoded_frame_bits_matches_encoder() {
        let baseline = vec![0x0F, 0xAA, 0x01];
        let frame = vec![0xF0, 0xAB, 0x01];
        let mut encoder = DeltaEncoder::new(3, &baseline, 4096).unwrap();
        encoder.push(&frame).unwrap();
        assert_eq!(encoder.bit_len(), encoded_frame_bits(&baseline, &frame));
    }

    #[test]
    fn test_compression_error_into_bastion_error() {
        let err: BastionError = CompressionError::TruncatedStream { position: 3 }.into();
        assert!(matches!(err, BastionError::SerializationError { .. }));
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod property_tests {
    use super::*;
    use crate::test_config::case_count;
    use proptest::prelude::*;

    fn frames_strategy() -> impl Strategy<Value = (usize, Vec<u8>, Vec<Vec<u8>>)> {
        (1usize..=12).prop_flat_map(|size| {
            (
                Just(size),
                proptest::collection::vec(any::<u8>(), size),
                proptest::collection::vec(proptest::collection::vec(any::<u8>(), size), 0..=16),
            )
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: case_count(),
            ..ProptestConfig::default()
        })]

        /// Property: decoding an unbounded run returns every frame
        #[test]
        fn prop_encode_decode_roundtrip((size, baseline, frames) in frames_strategy()) {
            let (run, complete) =
                encode_run(size, &baseline, frames.iter().map(Vec::as_slice), 1 << 20)
                    .expect("encode should succeed");
            prop_assert!(complete);
            let decoded = decode_run(size, &baseline, &run.bits, run.num_bits)
                .expect("decode should succeed");
            prop_assert_eq!(decoded, frames);
        }

        /// Property: a bounded run decodes to a prefix of the input
        #[test]
        fn prop_overflow_yields_prefix(
            (size, baseline, frames) in frames_strategy(),
            max_bits in 1usize..=400,
        ) {
            let (run, complete) =
                encode_run(size, &baseline, frames.iter().map(Vec::as_slice), max_bits)
                    .expect("encode should succeed");
            prop_assert!(run.num_bits <= max_bits);
            prop_assert_eq!(complete, run.frames == frames.len());
            let decoded = decode_run(size, &baseline, &run.bits, run.num_bits)
                .expect("decode should succeed");
            prop_assert_eq!(decoded.as_slice(), &frames[..run.frames]);
        }

        /// Property: skip(n) then read equals reading everything and dropping n
        #[test]
        fn prop_skip_equivalence(
            (size, baseline, frames) in frames_strategy(),
            n in 0usize..=16,
        ) {
            let n = n.min(frames.len());
            let (run, _) =
                encode_run(size, &baseline, frames.iter().map(Vec::as_slice), 1 << 20)
                    .expect("encode should succeed");
            let seed = if n == 0 { baseline.clone() } else { frames[n - 1].clone() };
            let mut decoder = DeltaDecoder::new(size, &seed, &run.bits, run.num_bits)
                .expect("decoder should build");
            prop_assert_eq!(decoder.skip(n).expect("skip should succeed"), n);
            let mut tail = Vec::new();
            while let Some(frame) = decoder.next_frame().expect("decode should succeed") {
                tail.push(frame);
            }
            prop_assert_eq!(tail.as_slice(), &frames[n..]);
        }
    }
}
