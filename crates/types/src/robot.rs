//! The robot application model.
//!
//! A toy command/state model: a robot on a bounded grid. Commands move the
//! robot one cell at a time; moves past the grid edge are clamped.

use crate::Hash;
use serde::{Deserialize, Serialize};

/// Grid bounds, inclusive: positions range over `[0, max_row] × [0, max_col]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridLimits {
    pub max_row: u32,
    pub max_col: u32,
}

/// A replicated robot command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RobotCommand {
    MoveUp,
    MoveDown,
    MoveLeft,
    MoveRight,
    Stay,
}

/// The robot's position. This is the application state replicated by
/// consensus; its hash keys state snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotState {
    pub row: u32,
    pub col: u32,
}

impl RobotState {
    /// The starting position, shared by all nodes at genesis.
    pub fn initial() -> Self {
        RobotState { row: 0, col: 0 }
    }

    /// Apply a command, clamping at the grid edges.
    pub fn apply(&self, command: RobotCommand, limits: GridLimits) -> Self {
        let (row, col) = match command {
            RobotCommand::MoveUp => (self.row.saturating_sub(1), self.col),
            RobotCommand::MoveDown => ((self.row + 1).min(limits.max_row), self.col),
            RobotCommand::MoveLeft => (self.row, self.col.saturating_sub(1)),
            RobotCommand::MoveRight => (self.row, (self.col + 1).min(limits.max_col)),
            RobotCommand::Stay => (self.row, self.col),
        };
        RobotState { row, col }
    }

    /// Content hash of this state, used to key snapshots and to bind a
    /// block to its post-state.
    pub fn state_hash(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("state serialization is infallible");
        Hash::digest(&bytes)
    }
}
