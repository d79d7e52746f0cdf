//! Queue of local inputs the peer has not acknowledged yet.
//!
//! Every flush re-encodes the whole queue against the last acknowledged frame,
//! so a lost datagram costs nothing but latency: the next one carries the
//! same frames again.

use std::collections::VecDeque;

use super::input_bytes::InputBytes;
use crate::error::SendInputError;
use crate::network::compression::{self, CompressionError, EncodedRun};
use crate::Frame;

/// Result of trying to put the pending queue on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub enum FlushOutcome {
    /// Every pending frame was encoded into one message.
    Sent {
        /// Frames in the message.
        frames: usize,
    },
    /// The bit budget ran out. The first `sent` frames went out; the other
    /// `deferred` stay queued for the next flush.
    MessageBodyOverflow {
        /// Frames in the message.
        sent: usize,
        /// Frames left for later.
        deferred: usize,
    },
    /// Nothing was pending.
    Idle,
}

/// An encoded run ready to be wrapped in an input message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRun {
    /// Frame of the first encoded input.
    pub start_frame: Frame,
    /// The diff stream.
    pub run: EncodedRun,
    /// Pending frames that did not fit.
    pub deferred: usize,
}

/// Unacknowledged local input frames, oldest first and contiguous.
#[derive(Debug, Clone)]
pub struct LocalInputBuffer {
    pending: VecDeque<InputBytes>,
    last_acked: InputBytes,
    last_acked_frame: Frame,
    frame_size: usize,
    limit: usize,
}

impl LocalInputBuffer {
    /// Creates a buffer of `frame_size`-byte frames holding at most `limit` of them.
    #[must_use]
    pub fn new(frame_size: usize, limit: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(limit.min(256)),
            last_acked: InputBytes::zeroed(frame_size),
            last_acked_frame: Frame::NULL,
            frame_size,
            limit: limit.max(1),
        }
    }

    /// Number of pending frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Bytes per frame.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// The peer's acknowledgement: every frame before this one has arrived.
    #[must_use]
    pub fn last_acked_frame(&self) -> Frame {
        self.last_acked_frame
    }

    /// Frame of the oldest pending input.
    #[must_use]
    pub fn front_frame(&self) -> Option<Frame> {
        self.pending.front().map(|input| input.frame)
    }

    /// The frame the next pushed input must carry, if the queue dictates one.
    #[must_use]
    pub fn expected_frame(&self) -> Option<Frame> {
        match self.pending.back() {
            Some(last) => Some(last.frame.next()),
            None if !self.last_acked.frame.is_null() => Some(self.last_acked.frame.next()),
            None => None,
        }
    }

    /// Checks whether an input for `frame` would be accepted, without queueing it.
    ///
    /// # Errors
    ///
    /// The same errors [`push`](Self::push) would return.
    pub fn check(&self, frame: Frame) -> Result<(), SendInputError> {
        if self.pending.len() >= self.limit {
            return Err(SendInputError::FullQueue {
                pending: self.pending.len(),
            });
        }
        if !self.last_acked_frame.is_null() && frame < self.last_acked_frame {
            return Err(SendInputError::AlreadyAcked {
                frame,
                last_acked: self.last_acked_frame,
            });
        }
        match self.expected_frame() {
            Some(expected) if expected != frame => {
                Err(SendInputError::OutOfOrder { frame, expected })
            },
            _ => Ok(()),
        }
    }

    /// Queues an input.
    ///
    /// # Errors
    ///
    /// [`SendInputError::FullQueue`] at capacity, [`SendInputError::AlreadyAcked`]
    /// for a frame the peer already has, [`SendInputError::OutOfOrder`] if the
    /// frame does not directly follow the newest pending one.
    pub fn push(&mut self, input: InputBytes) -> Result<(), SendInputError> {
        self.check(input.frame)?;
        self.pending.push_back(input);
        Ok(())
    }

    /// Records an acknowledgement and drops every frame it covers.
    ///
    /// Older acknowledgements are ignored.
    pub fn acknowledge(&mut self, ack_frame: Frame) {
        if ack_frame > self.last_acked_frame {
            self.last_acked_frame = ack_frame;
        }
        self.trim();
    }

    /// Drops pending frames before the last acknowledged frame.
    ///
    /// The newest dropped frame becomes the encoding baseline.
    pub fn trim(&mut self) {
        while let Some(front) = self.pending.front() {
            if front.frame >= self.last_acked_frame {
                break;
            }
            if let Some(popped) = self.pending.pop_front() {
                self.last_acked = popped;
            }
        }
    }

    /// Encodes as much of the queue as fits in `max_bits`.
    ///
    /// Returns `None` when nothing is pending. Frames that don't fit stay
    /// queued; nothing is removed by encoding.
    ///
    /// # Errors
    ///
    /// Codec errors other than overflow.
    pub fn fill(&mut self, max_bits: usize) -> Result<Option<PendingRun>, CompressionError> {
        self.trim();
        let Some(start_frame) = self.front_frame() else {
            return Ok(None);
        };
        let (run, _) = compression::encode_run(
            self.frame_size,
            &self.last_acked.bytes,
            self.pending.iter().map(|input| input.bytes.as_slice()),
            max_bits,
        )?;
        let deferred = self.pending.len() - run.frames;
        Ok(Some(PendingRun {
            start_frame,
            run,
            deferred,
        }))
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn input(frame: i32, value: u8) -> InputBytes {
        InputBytes {
            frame: Frame::new(frame),
            bytes: vec![value, 0],
        }
    }

    fn filled(frames: std::ops::Range<i32>) -> LocalInputBuffer {
        let mut buffer = LocalInputBuffer::new(2, 128);
        for frame in frames {
            buffer.push(input(frame, frame as u8)).unwrap();
        }
        buffer
    }

    #[test]
    fn ack_trims_covered_frames() {
        let mut buffer = filled(0..10);
        buffer.acknowledge(Frame::new(5));
        assert_eq!(buffer.len(), 5);

        let pending = buffer.fill(4096).unwrap().unwrap();
        assert_eq!(pending.start_frame, Frame::new(5));
        assert_eq!(pending.run.frames, 5);
        assert_eq!(pending.deferred, 0);

        // baseline is frame 4
        let frames =
            compression::decode_run(2, &[4, 0], &pending.run.bits, pending.run.num_bits).unwrap();
        assert_eq!(frames[0], vec![5, 0]);
        assert_eq!(frames[4], vec![9, 0]);
    }

    #[test]
    fn stale_ack_is_ignored() {
        let mut buffer = filled(0..4);
        buffer.acknowledge(Frame::new(3));
        buffer.acknowledge(Frame::new(1));
        assert_eq!(buffer.last_acked_frame(), Frame::new(3));
        assert_eq!(buffer.front_frame(), Some(Frame::new(3)));
    }

    #[test]
    fn full_queue_rejected_first() {
        let mut buffer = LocalInputBuffer::new(2, 2);
        buffer.push(input(0, 0)).unwrap();
        buffer.push(input(1, 0)).unwrap();
        assert_eq!(
            buffer.push(input(2, 0)),
            Err(SendInputError::FullQueue { pending: 2 })
        );
    }

    #[test]
    fn acked_frame_rejected() {
        let mut buffer = filled(0..6);
        buffer.acknowledge(Frame::new(6));
        assert!(buffer.is_empty());
        assert_eq!(
            buffer.push(input(3, 0)),
            Err(SendInputError::AlreadyAcked {
                frame: Frame::new(3),
                last_acked: Frame::new(6),
            })
        );
        // contiguous with the newest acked frame
        buffer.push(input(6, 0)).unwrap();
    }

    #[test]
    fn gap_rejected() {
        let mut buffer = filled(0..3);
        assert_eq!(
            buffer.push(input(4, 0)),
            Err(SendInputError::OutOfOrder {
                frame: Frame::new(4),
                expected: Frame::new(3),
            })
        );
    }

    #[test]
    fn first_input_may_start_anywhere() {
        let mut buffer = LocalInputBuffer::new(2, 8);
        buffer.push(input(40, 1)).unwrap();
        assert_eq!(buffer.expected_frame(), Some(Frame::new(41)));
    }

    #[test]
    fn overflow_keeps_tail_queued() {
        let mut buffer = LocalInputBuffer::new(2, 128);
        for frame in 0..20 {
            // alternate every bit so each frame costs the maximum
            let value = if frame % 2 == 0 { 0xFF } else { 0x00 };
            buffer
                .push(InputBytes {
                    frame: Frame::new(frame),
                    bytes: vec![value, value],
                })
                .unwrap();
        }
        let pending = buffer.fill(256).unwrap().unwrap();
        assert!(pending.run.frames < 20);
        assert_eq!(pending.deferred, 20 - pending.run.frames);
        assert!(pending.run.num_bits <= 256);
        // encoding removes nothing
        assert_eq!(buffer.len(), 20);
    }

    #[test]
    fn empty_fill_is_none() {
        let mut buffer = LocalInputBuffer::new(2, 8);
        assert_eq!(buffer.fill(4096).unwrap(), None);
    }
}
