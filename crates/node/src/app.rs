//! The robot application service.

use gridbot_consensus::Event;
use gridbot_types::{GridLimits, RobotCommand, RobotState};
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// The replicated robot: current executed state plus the grid bounds.
pub struct RobotModel {
    state: RobotState,
    limits: GridLimits,
}

impl RobotModel {
    pub fn new(state: RobotState, limits: GridLimits) -> Self {
        RobotModel { state, limits }
    }

    pub fn state(&self) -> RobotState {
        self.state
    }

    /// Apply a decided command, returning the new state.
    pub fn apply(&mut self, command: RobotCommand) -> RobotState {
        self.state = self.state.apply(command, self.limits);
        self.state
    }
}

/// Pick the robot's next move at random.
fn decide(rng: &mut impl Rng) -> RobotCommand {
    match rng.gen_range(0..5) {
        0 => RobotCommand::MoveUp,
        1 => RobotCommand::MoveDown,
        2 => RobotCommand::MoveLeft,
        3 => RobotCommand::MoveRight,
        _ => RobotCommand::Stay,
    }
}

/// Simulates the application making a decision every `interval` and
/// offering it to the consensus loop. The machine picks the latest
/// decision up when this node leads a view.
pub async fn run_decision_loop(
    interval: Duration,
    event_tx: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) {
    let mut rng = rand::rngs::StdRng::from_entropy();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                let command = decide(&mut rng);
                trace!(?command, "application decided");
                if event_tx.send(Event::CommandReady(command)).is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_applies_and_tracks_state() {
        let limits = GridLimits {
            max_row: 2,
            max_col: 2,
        };
        let mut model = RobotModel::new(RobotState::initial(), limits);
        assert_eq!(model.apply(RobotCommand::MoveDown), RobotState { row: 1, col: 0 });
        assert_eq!(model.apply(RobotCommand::MoveRight), RobotState { row: 1, col: 1 });
        assert_eq!(model.state(), RobotState { row: 1, col: 1 });
    }

    #[test]
    fn decide_covers_all_commands() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..200 {
            seen.insert(format!("{:?}", decide(&mut rng)));
        }
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn decision_loop_emits_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_decision_loop(
            Duration::from_millis(5),
            tx,
            cancel.clone(),
        ));

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, Event::CommandReady(_)));

        cancel.cancel();
        task.await.unwrap();
    }
}
