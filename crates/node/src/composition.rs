//! Node composition: startup ordering, crash recovery, and the runner
//! event loop.

use crate::app::{run_decision_loop, RobotModel};
use crate::pruner::run_pruner;
use crate::{NodeError, ResolvedConfig};
use gridbot_consensus::{
    decode_message, encode_message, Action, Event, HotStuffMachine,
};
use gridbot_net::{ConnectionManager, RetryPolicy, TlsConnectionProvider};
use gridbot_storage::{BlockStore, Database, StateRing, ViewStateStore};
use gridbot_types::{Block, Phase, ProtocolState, RobotState};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Entry point for assembling and running a node.
pub struct Node;

/// A running node: background services plus the shutdown switch.
pub struct NodeHandle {
    manager: Arc<ConnectionManager>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    fatal_rx: oneshot::Receiver<NodeError>,
}

impl Node {
    /// Bring the node up. Resources are acquired in dependency order; an
    /// error at any step drops everything acquired so far in reverse.
    pub async fn start(config: ResolvedConfig) -> Result<NodeHandle, NodeError> {
        // Transport, bound to the local address with the node's key pair.
        let provider =
            TlsConnectionProvider::bind(&config.keypair, config.local_address.clone()).await?;

        // Overlay manager, dial queue seeded with every other member.
        let manager = ConnectionManager::start(
            provider,
            config.federation.clone(),
            RetryPolicy::default(),
        );

        // Storage under `<db.path>/<node index>/`.
        std::fs::create_dir_all(&config.db_dir)?;
        let db = Arc::new(Database::open(&config.db_dir)?);
        info!(path = %config.db_dir.display(), "database opened");

        // Genesis is (re)inserted every startup; pruning may have removed
        // it from a previous run's store.
        let genesis = Block::genesis();
        let block_store = BlockStore::new(db.clone());
        block_store.put(&genesis)?;

        let view_store = ViewStateStore::new(db.clone());
        view_store.init_genesis(genesis.hash())?;

        let ring = StateRing::new(db.clone(), config.state_history_size);
        ring.put_genesis(genesis.hash(), &RobotState::initial())?;

        // Crash-recovery view handoff.
        let recovered = recover(&config, &block_store, &view_store, &ring)?;
        info!(
            view = recovered.initial.view_number,
            prepared_block = %recovered.initial.prepared_block.hash(),
            "recovered protocol state"
        );

        let machine = HotStuffMachine::new(
            config.keypair,
            config.federation.clone(),
            config.consensus.clone(),
            config.limits,
            recovered.initial,
            recovered.prepared_state,
        );
        let model = RobotModel::new(recovered.executed_state, config.limits);

        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = oneshot::channel();

        let consensus_task = tokio::spawn(run_consensus(
            machine,
            manager.clone(),
            block_store,
            view_store,
            ring,
            model,
            config.request_timeout,
            event_tx.clone(),
            event_rx,
            fatal_tx,
            cancel.clone(),
        ));
        let app_task = tokio::spawn(run_decision_loop(
            config.decision_interval,
            event_tx,
            cancel.clone(),
        ));
        let pruner_task = tokio::spawn(run_pruner(
            db,
            config.prune_interval,
            config.block_history_size,
            cancel.clone(),
        ));

        Ok(NodeHandle {
            manager,
            cancel,
            tasks: vec![consensus_task, app_task, pruner_task],
            fatal_rx,
        })
    }
}

impl NodeHandle {
    /// Run until the given shutdown signal resolves or a fatal error
    /// surfaces, then tear the node down.
    pub async fn run_until<F>(mut self, shutdown_signal: F) -> Result<(), NodeError>
    where
        F: Future<Output = ()>,
    {
        let result = tokio::select! {
            _ = shutdown_signal => Ok(()),
            fatal = &mut self.fatal_rx => match fatal {
                Ok(error) => Err(error),
                // The runner ended without reporting; treat as clean.
                Err(_) => Ok(()),
            },
        };
        self.shutdown().await;
        result
    }

    /// Cancel and await every background service, then the overlay.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        self.manager.shutdown().await;
        info!("node stopped");
    }
}

/// Everything recovery derives from the persisted stores.
struct Recovered {
    initial: ProtocolState,
    /// Application state after `initial.prepared_block`.
    prepared_state: RobotState,
    /// Application state after the last executed block.
    executed_state: RobotState,
}

/// Derive the protocol state handed to consensus from the persisted view
/// bundle.
///
/// The node may have crashed in any phase; resuming in `Prepare` of the
/// next view is always safe because a fresh round begins with no prior
/// votes. A missing prepared block or snapshot chain indicates corruption
/// and is fatal.
fn recover(
    config: &ResolvedConfig,
    block_store: &BlockStore,
    view_store: &ViewStateStore,
    ring: &StateRing,
) -> Result<Recovered, NodeError> {
    let bundle = view_store.bundle()?;

    let prepared_hash = bundle.prepare_qc.block_hash;
    let prepared_block = block_store.get(&prepared_hash)?.ok_or_else(|| {
        NodeError::StorageCorruption(format!(
            "block {prepared_hash} certified by the prepare certificate is missing"
        ))
    })?;

    // The prepared block's snapshot exists unless the node crashed before
    // executing it; then it is recomputed from the parent's snapshot.
    let prepared_state = match ring.get(&prepared_hash)? {
        Some(state) => state,
        None => {
            let parent_state = ring.get(&prepared_block.parent)?.ok_or_else(|| {
                NodeError::StorageCorruption(format!(
                    "no snapshot for {prepared_hash} or its parent"
                ))
            })?;
            parent_state.apply(prepared_block.command, config.limits)
        }
    };

    let executed_state = ring.get(&bundle.last_executed_block_hash)?.ok_or_else(|| {
        NodeError::StorageCorruption(format!(
            "no snapshot for last executed block {}",
            bundle.last_executed_block_hash
        ))
    })?;

    Ok(Recovered {
        initial: ProtocolState {
            view_number: bundle.view_number + 1,
            phase: Phase::Prepare,
            prepare_qc: bundle.prepare_qc,
            locked_qc: bundle.locked_qc,
            commit_qc: bundle.commit_qc,
            prepared_block,
        },
        prepared_state,
        executed_state,
    })
}

/// The runner: owns the machine, turns inbound frames / timer fires /
/// application decisions into events, and executes the returned actions.
#[allow(clippy::too_many_arguments)]
async fn run_consensus(
    mut machine: HotStuffMachine,
    manager: Arc<ConnectionManager>,
    block_store: BlockStore,
    view_store: ViewStateStore,
    ring: StateRing,
    model: RobotModel,
    request_timeout: std::time::Duration,
    event_tx: mpsc::UnboundedSender<Event>,
    mut event_rx: mpsc::UnboundedReceiver<Event>,
    fatal_tx: oneshot::Sender<NodeError>,
    cancel: CancellationToken,
) {
    let mut runner = ActionRunner {
        manager,
        block_store,
        view_store,
        ring,
        model,
        request_timeout,
        event_tx,
        view_timer: None,
    };

    let startup_actions = machine.start();
    if let Err(e) = runner.execute(startup_actions).await {
        let _ = fatal_tx.send(e);
        return;
    }

    loop {
        let actions = tokio::select! {
            _ = cancel.cancelled() => return,
            message = runner.manager.next_message() => match message {
                Some((from, bytes)) => match decode_message(&bytes) {
                    Ok(message) => machine.handle(Event::MessageReceived { from, message }),
                    Err(e) => {
                        warn!(peer = %from, error = %e, "dropping undecodable message");
                        continue;
                    }
                },
                None => return,
            },
            event = event_rx.recv() => match event {
                Some(event) => machine.handle(event),
                None => return,
            },
        };

        if let Err(e) = runner.execute(actions).await {
            let _ = fatal_tx.send(e);
            return;
        }
    }
}

/// Executes machine actions against the overlay, the stores, and the
/// application model.
struct ActionRunner {
    manager: Arc<ConnectionManager>,
    block_store: BlockStore,
    view_store: ViewStateStore,
    ring: StateRing,
    model: RobotModel,
    /// Bound on one send; a peer stalled past it is skipped (its reader
    /// will notice the dead connection independently).
    request_timeout: std::time::Duration,
    event_tx: mpsc::UnboundedSender<Event>,
    view_timer: Option<JoinHandle<()>>,
}

impl ActionRunner {
    async fn execute(&mut self, actions: Vec<Action>) -> Result<(), NodeError> {
        for action in actions {
            match action {
                Action::Broadcast(message) => match encode_message(&message) {
                    Ok(bytes) => {
                        if tokio::time::timeout(
                            self.request_timeout,
                            self.manager.broadcast(&bytes),
                        )
                        .await
                        .is_err()
                        {
                            warn!("broadcast timed out");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode broadcast"),
                },
                Action::Send(peer, message) => match encode_message(&message) {
                    Ok(bytes) => {
                        match tokio::time::timeout(
                            self.request_timeout,
                            self.manager.send_to(&peer, &bytes),
                        )
                        .await
                        {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => debug!(peer = %peer, error = %e, "send failed"),
                            Err(_) => warn!(peer = %peer, "send timed out"),
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode message"),
                },
                Action::PersistBlock(block) => self.block_store.put(&block)?,
                Action::PersistViewNumber(view) => self.view_store.set_view_number(view)?,
                Action::PersistQc(qc) => self.view_store.set_qc(&qc)?,
                Action::ExecuteBlock(block) => {
                    let state = self.model.apply(block.command);
                    let hash = block.hash();
                    self.ring.put(hash, &state)?;
                    self.view_store.set_last_executed_block_hash(hash)?;
                    info!(
                        block = %hash,
                        row = state.row,
                        col = state.col,
                        "executed block"
                    );
                }
                Action::ScheduleViewTimeout {
                    view_number,
                    duration,
                } => {
                    if let Some(timer) = self.view_timer.take() {
                        timer.abort();
                    }
                    let event_tx = self.event_tx.clone();
                    self.view_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(duration).await;
                        let _ = event_tx.send(Event::ViewTimeout { view_number });
                    }));
                }
            }
        }
        Ok(())
    }
}

impl Drop for ActionRunner {
    fn drop(&mut self) {
        if let Some(timer) = self.view_timer.take() {
            timer.abort();
        }
    }
}
