use crate::Frame;

/// An input tagged with the frame it drives.
///
/// This is how confirmed remote inputs reach the
/// [`RollbackSimulator`](crate::RollbackSimulator), and how a host hands
/// confirmed frames to spectators.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlayerInput<I>
where
    I: Copy + Clone + PartialEq,
{
    /// Frame the input applies to.
    pub frame: Frame,
    /// The game's input value.
    pub input: I,
}

impl<I: Copy + Clone + PartialEq> PlayerInput<I> {
    /// Tags `input` with `frame`.
    pub fn new(frame: Frame, input: I) -> Self {
        Self { frame, input }
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

    #[test]
    fn same_value_on_another_frame_differs() {
        let jump = PlayerInput::new(Frame::new(1), 0b100u8);
        assert_ne!(jump, PlayerInput::new(Frame::new(2), 0b100));
        assert_eq!(jump.frame.next(), Frame::new(2));
    }
}
