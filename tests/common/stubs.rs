//! Simulator stub with struct-based inputs.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::use_self,
    clippy::derive_partial_eq_without_eq
)]

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bastion_netcode::{Config, Frame, PlayerHandle, PlayerInput, RollbackSimulator};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StubInput {
    pub inp: u32,
}

#[derive(Debug)]
pub struct StubConfig;

impl Config for StubConfig {
    type Input = StubInput;
    type Address = SocketAddr;
}

/// Remembers every input it is told about and counts frames.
///
/// It never simulates anything; tests drive `frame` forward themselves and
/// read back what the session reported.
#[derive(Debug)]
pub struct SimulatorStub {
    pub num_players: usize,
    pub frame: i32,
    pub inputs: BTreeMap<Frame, BTreeMap<PlayerHandle, StubInput>>,
    /// Remote inputs in arrival order.
    pub remote: Vec<(PlayerHandle, PlayerInput<StubInput>)>,
    pub adjusted: Vec<Frame>,
    pub last_confirmed: Frame,
}

impl SimulatorStub {
    #[must_use]
    pub fn new(num_players: usize) -> Self {
        Self {
            num_players,
            frame: 0,
            inputs: BTreeMap::new(),
            remote: Vec::new(),
            adjusted: Vec::new(),
            last_confirmed: Frame::NULL,
        }
    }

    /// Records a local input the way a game would before handing it to the session.
    pub fn record_local(&mut self, handle: PlayerHandle, frame: Frame, input: StubInput) {
        self.inputs.entry(frame).or_default().insert(handle, input);
    }

    pub fn advance(&mut self) {
        self.frame += 1;
    }

    #[allow(dead_code)]
    #[must_use]
    pub fn input_of(&self, handle: PlayerHandle, frame: Frame) -> Option<StubInput> {
        self.inputs.get(&frame)?.get(&handle).copied()
    }

    /// Frames received for `handle`, in arrival order.
    #[allow(dead_code)]
    #[must_use]
    pub fn remote_frames(&self, handle: PlayerHandle) -> Vec<i32> {
        self.remote
            .iter()
            .filter(|(player, _)| *player == handle)
            .map(|(_, input)| input.frame.as_i32())
            .collect()
    }
}

impl RollbackSimulator<StubInput> for SimulatorStub {
    fn current_frame(&self) -> Frame {
        Frame::new(self.frame)
    }

    fn add_remote_input(&mut self, player: PlayerHandle, input: PlayerInput<StubInput>) {
        self.inputs
            .entry(input.frame)
            .or_default()
            .insert(player, input.input);
        self.remote.push((player, input));
    }

    fn adjust_simulation(&mut self, to: Frame) {
        self.adjusted.push(to);
    }

    fn set_last_confirmed_frame(&mut self, frame: Frame) {
        assert!(
            frame >= self.last_confirmed,
            "confirmed frame went backwards: {} after {}",
            frame,
            self.last_confirmed
        );
        self.last_confirmed = frame;
    }

    fn confirmed_inputs(&self, frame: Frame) -> Option<Vec<PlayerInput<StubInput>>> {
        let inputs = self.inputs.get(&frame)?;
        (0..self.num_players)
            .map(|handle| {
                inputs
                    .get(&PlayerHandle::new(handle))
                    .map(|input| PlayerInput::new(frame, *input))
            })
            .collect()
    }
}

/// The input player `handle` sends at `frame` in every test.
#[must_use]
pub fn scripted_input(handle: PlayerHandle, frame: i32) -> StubInput {
    StubInput {
        inp: frame as u32 * 10 + handle.as_usize() as u32,
    }
}
