//! Fixed-size byte frames carrying one or more players' inputs.
//!
//! The delta codec works on raw bytes, so every `Config::Input` is serialized
//! with the endianness-aware [`codec`](crate::network::codec) first. An endpoint
//! hosting several players concatenates their inputs in ascending handle order.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::network::codec;
use crate::network::wire::Endianness;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{BastionError, Frame};

/// One frame of serialized input, possibly for multiple players.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBytes {
    /// The frame this data belongs to. [`Frame::NULL`] for "no frame yet".
    pub frame: Frame,
    /// Concatenated serialized inputs.
    pub bytes: Vec<u8>,
}

impl InputBytes {
    /// All-zero bytes with no frame, the baseline before anything was exchanged.
    #[must_use]
    pub fn zeroed(size: usize) -> Self {
        Self {
            frame: Frame::NULL,
            bytes: vec![0; size],
        }
    }

    /// Serializes `inputs` for `frame`, each of which must take exactly `input_size` bytes.
    ///
    /// # Errors
    ///
    /// [`BastionError::SerializationError`] if an input fails to serialize or
    /// serializes to a different size (variable-length inputs can't be diffed).
    pub fn from_inputs<I: Serialize>(
        frame: Frame,
        inputs: &[I],
        input_size: usize,
        endianness: Endianness,
    ) -> Result<Self, BastionError> {
        let mut bytes = Vec::with_capacity(inputs.len() * input_size);
        for (index, input) in inputs.iter().enumerate() {
            let written = codec::encode_append(input, endianness, &mut bytes).map_err(|err| {
                BastionError::SerializationError {
                    context: format!("input {} for frame {}: {}", index, frame, err),
                }
            })?;
            if written != input_size {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::InputCodec,
                    "input {} for frame {} serialized to {} bytes, expected {}",
                    index,
                    frame,
                    written,
                    input_size
                );
                return Err(BastionError::SerializationError {
                    context: format!(
                        "input serialized to {} bytes but the input size is {}",
                        written, input_size
                    ),
                });
            }
        }
        Ok(Self { frame, bytes })
    }

    /// Splits the bytes into `count` inputs of equal size and deserializes them.
    ///
    /// # Errors
    ///
    /// [`BastionError::SerializationError`] if the length isn't a multiple of
    /// `count` or an input fails to deserialize.
    pub fn to_inputs<I: DeserializeOwned>(
        &self,
        count: usize,
        endianness: Endianness,
    ) -> Result<Vec<I>, BastionError> {
        if count == 0 || self.bytes.len() % count != 0 {
            return Err(BastionError::SerializationError {
                context: format!(
                    "{} input bytes for frame {} can't be split across {} players",
                    self.bytes.len(),
                    self.frame,
                    count
                ),
            });
        }
        let size = self.bytes.len() / count;
        self.bytes
            .chunks(size.max(1))
            .take(count)
            .enumerate()
            .map(|(index, chunk)| {
                codec::decode_value(chunk, endianness).map_err(|err| {
                    BastionError::SerializationError {
                        context: format!("input {} for frame {}: {}", index, self.frame, err),
                    }
                })
            })
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Debug)]
    struct TestInput {
        inp: u32,
    }

    #[test]
    fn zeroed_has_no_frame() {
        let input_bytes = InputBytes::zeroed(8);
        assert_eq!(input_bytes.frame, Frame::NULL);
        assert_eq!(input_bytes.bytes, vec![0; 8]);
    }

    #[test]
    fn roundtrip_multiple_players() {
        let inputs = [TestInput { inp: 100 }, TestInput { inp: 0xDEAD_BEEF }];
        let encoded =
            InputBytes::from_inputs(Frame::new(10), &inputs, 4, Endianness::Little).unwrap();
        assert_eq!(encoded.frame, Frame::new(10));
        assert_eq!(encoded.bytes.len(), 8);

        let decoded: Vec<TestInput> = encoded.to_inputs(2, Endianness::Little).unwrap();
        assert_eq!(decoded, inputs);
    }

    #[test]
    fn endianness_changes_layout() {
        let inputs = [TestInput { inp: 1 }];
        let little = InputBytes::from_inputs(Frame::new(0), &inputs, 4, Endianness::Little).unwrap();
        let big = InputBytes::from_inputs(Frame::new(0), &inputs, 4, Endianness::Big).unwrap();
        assert_eq!(little.bytes, vec![1, 0, 0, 0]);
        assert_eq!(big.bytes, vec![0, 0, 0, 1]);
    }

    #[test]
    fn wrong_size_is_rejected() {
        let inputs = [TestInput { inp: 1 }];
        let err = InputBytes::from_inputs(Frame::new(0), &inputs, 2, Endianness::Little);
        assert!(matches!(err, Err(BastionError::SerializationError { .. })));
    }

    #[test]
    fn uneven_split_is_rejected() {
        let input_bytes = InputBytes {
            frame: Frame::new(3),
            bytes: vec![0; 7],
        };
        let result: Result<Vec<TestInput>, _> = input_bytes.to_inputs(2, Endianness::Little);
        assert!(result.is_err());
        let result: Result<Vec<TestInput>, _> = input_bytes.to_inputs(0, Endianness::Little);
        assert!(result.is_err());
    }
}
