//! The HotStuff protocol state machine.

use crate::message::ConsensusMessage;
use crate::ConsensusConfig;
use gridbot_types::{
    Block, Federation, GridLimits, Hash, KeyPair, PeerKey, Phase, ProtocolState,
    QuorumCertificate, RobotCommand, RobotState, Signature,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Inputs to the state machine. The runner converts network frames, timer
/// fires, and application decisions into these.
#[derive(Debug, Clone)]
pub enum Event {
    /// A decoded message from an authenticated peer.
    MessageReceived {
        from: PeerKey,
        message: ConsensusMessage,
    },
    /// The timeout armed for `view_number` fired.
    ViewTimeout { view_number: u64 },
    /// The application decided on the next command to replicate.
    CommandReady(RobotCommand),
}

/// Outputs of the state machine. Actions are commands; the runner executes
/// them and feeds any results back in as events.
#[derive(Debug, Clone)]
pub enum Action {
    /// Send a message to every connected peer.
    Broadcast(ConsensusMessage),
    /// Send a message to one peer.
    Send(PeerKey, ConsensusMessage),
    /// Persist a block into the block store.
    PersistBlock(Block),
    /// Persist the current view number into the view state bundle.
    PersistViewNumber(u64),
    /// Persist a formed certificate into its phase's bundle slot.
    PersistQc(QuorumCertificate),
    /// Execute a decided block against the application state.
    ExecuteBlock(Block),
    /// Arm the view timeout; an earlier pending timeout is superseded.
    ScheduleViewTimeout {
        view_number: u64,
        duration: Duration,
    },
}

/// A block being driven through the current view, paired with the
/// application state its command produces.
#[derive(Debug, Clone)]
struct CandidateBlock {
    block: Block,
    post_state: RobotState,
}

/// The three-phase HotStuff machine for one federation member.
pub struct HotStuffMachine {
    keypair: KeyPair,
    local_key: PeerKey,
    federation: Federation,
    config: ConsensusConfig,
    limits: GridLimits,

    view_number: u64,
    phase: Phase,
    prepare_qc: QuorumCertificate,
    locked_qc: QuorumCertificate,
    commit_qc: QuorumCertificate,

    /// The block `prepare_qc` certifies; new proposals extend it.
    prepared_block: Block,
    /// The application state after `prepared_block`.
    prepared_state: RobotState,

    current_proposal: Option<CandidateBlock>,
    pending_command: Option<RobotCommand>,
    /// Leader has a new-view quorum and waits only for a command.
    awaiting_command: bool,
    new_view_signers: BTreeSet<PeerKey>,
    /// Certificate under construction from the current phase's votes.
    collecting: Option<QuorumCertificate>,
    voted_phases: BTreeSet<Phase>,
    consecutive_timeouts: u32,
}

impl HotStuffMachine {
    /// Build the machine from the recovery handoff state.
    ///
    /// `prepared_state` must be the application state after
    /// `initial.prepared_block`; the composition fetches it from the
    /// snapshot ring.
    pub fn new(
        keypair: KeyPair,
        federation: Federation,
        config: ConsensusConfig,
        limits: GridLimits,
        initial: ProtocolState,
        prepared_state: RobotState,
    ) -> Self {
        let local_key = keypair.peer_key();
        HotStuffMachine {
            keypair,
            local_key,
            federation,
            config,
            limits,
            view_number: initial.view_number,
            phase: initial.phase,
            prepare_qc: initial.prepare_qc,
            locked_qc: initial.locked_qc,
            commit_qc: initial.commit_qc,
            prepared_block: initial.prepared_block,
            prepared_state,
            current_proposal: None,
            pending_command: None,
            awaiting_command: false,
            new_view_signers: BTreeSet::new(),
            collecting: None,
            voted_phases: BTreeSet::new(),
            consecutive_timeouts: 0,
        }
    }

    pub fn view_number(&self) -> u64 {
        self.view_number
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn prepared_block(&self) -> &Block {
        &self.prepared_block
    }

    fn leader(&self, view_number: u64) -> PeerKey {
        *self.federation.leader_for_view(view_number)
    }

    fn is_leader(&self) -> bool {
        self.leader(self.view_number) == self.local_key
    }

    fn quorum(&self) -> usize {
        self.federation.quorum_threshold()
    }

    /// Announce entry into the machine's initial view. Call once at
    /// startup.
    pub fn start(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.enter_view(self.view_number, &mut actions);
        actions
    }

    /// Process one event into zero or more actions.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        let mut actions = Vec::new();
        match event {
            Event::MessageReceived { from, message } => {
                if !self.federation.contains(&from) {
                    warn!(peer = %from, "dropping message from non-member");
                    return actions;
                }
                self.on_message(from, message, &mut actions);
            }
            Event::ViewTimeout { view_number } => {
                if view_number == self.view_number {
                    self.consecutive_timeouts += 1;
                    debug!(
                        view = view_number,
                        consecutive = self.consecutive_timeouts,
                        "view timed out"
                    );
                    self.enter_view(self.view_number + 1, &mut actions);
                }
            }
            Event::CommandReady(command) => {
                self.pending_command = Some(command);
                if self.awaiting_command {
                    self.try_propose(&mut actions);
                }
            }
        }
        actions
    }

    fn on_message(&mut self, from: PeerKey, message: ConsensusMessage, actions: &mut Vec<Action>) {
        if message.view_number() != self.view_number {
            trace!(
                peer = %from,
                kind = message.type_name(),
                message_view = message.view_number(),
                local_view = self.view_number,
                "ignoring message for another view"
            );
            return;
        }

        match message {
            ConsensusMessage::NewView {
                prepare_qc,
                prepared_block,
                ..
            } => self.on_new_view(from, prepare_qc, prepared_block, actions),
            ConsensusMessage::Proposal {
                phase,
                block,
                justify,
                ..
            } => self.on_proposal(from, phase, block, justify, actions),
            ConsensusMessage::Vote {
                phase,
                block_hash,
                signature,
                ..
            } => self.on_vote(from, phase, block_hash, signature, actions),
            ConsensusMessage::Decide {
                block_hash,
                commit_qc,
                ..
            } => self.on_decide(from, block_hash, commit_qc, actions),
        }
    }

    // ── Leader side ────────────────────────────────────────────────────

    fn on_new_view(
        &mut self,
        from: PeerKey,
        prepare_qc: QuorumCertificate,
        prepared_block: Block,
        actions: &mut Vec<Action>,
    ) {
        if !self.is_leader() {
            trace!(peer = %from, "new-view received while not leading");
            return;
        }
        if !prepare_qc.is_valid(&self.federation) {
            warn!(peer = %from, "new-view carried an invalid certificate");
            return;
        }

        self.adopt_higher_qc(prepare_qc, prepared_block, actions);

        self.new_view_signers.insert(from);
        if self.new_view_signers.len() >= self.quorum() && self.current_proposal.is_none() {
            self.awaiting_command = true;
            self.try_propose(actions);
        }
    }

    /// Adopt a new-view's certificate as the prepared tip when it is
    /// higher than ours. A leader that fell behind (a restart loses one
    /// round of progress) would otherwise propose an extension of a stale
    /// block that every up-to-date replica rejects, stalling the view.
    fn adopt_higher_qc(&mut self, qc: QuorumCertificate, block: Block, actions: &mut Vec<Action>) {
        if qc.phase != Phase::Prepare || qc.view_number <= self.prepare_qc.view_number {
            return;
        }
        if qc.block_hash != block.hash() {
            warn!(block = %qc.block_hash, "new-view certificate does not match its block");
            return;
        }

        // Same tip, newer certificate.
        if qc.block_hash == self.prepared_block.hash() {
            actions.push(Action::PersistQc(qc.clone()));
            self.prepare_qc = qc;
            return;
        }

        // The carried block must directly extend our tip; any further
        // behind and its post-state cannot be reconstructed locally.
        let Some(candidate) = self.admit_block(block) else {
            return;
        };
        debug!(
            view = qc.view_number,
            block = %qc.block_hash,
            "adopted higher prepare certificate from new-view"
        );
        actions.push(Action::PersistBlock(candidate.block.clone()));
        actions.push(Action::PersistQc(qc.clone()));
        self.prepare_qc = qc;
        self.prepared_block = candidate.block;
        self.prepared_state = candidate.post_state;
    }

    /// Propose once the new-view quorum and an application command are
    /// both in hand.
    fn try_propose(&mut self, actions: &mut Vec<Action>) {
        if !self.awaiting_command || self.current_proposal.is_some() {
            return;
        }
        let Some(command) = self.pending_command.take() else {
            return;
        };
        self.awaiting_command = false;

        let post_state = self.prepared_state.apply(command, self.limits);
        let block = Block::new(self.prepared_block.hash(), post_state.state_hash(), command);
        debug!(view = self.view_number, block = %block.hash(), "proposing block");

        self.current_proposal = Some(CandidateBlock {
            block: block.clone(),
            post_state,
        });

        actions.push(Action::PersistBlock(block.clone()));
        actions.push(Action::Broadcast(ConsensusMessage::Proposal {
            view_number: self.view_number,
            phase: Phase::Prepare,
            block: block.clone(),
            justify: self.prepare_qc.clone(),
        }));

        // The leader votes for its own proposal.
        self.cast_own_vote(Phase::Prepare, block.hash(), actions);
    }

    fn on_vote(
        &mut self,
        from: PeerKey,
        phase: Phase,
        block_hash: Hash,
        signature: Signature,
        actions: &mut Vec<Action>,
    ) {
        if !self.is_leader() {
            return;
        }
        let Some(candidate) = &self.current_proposal else {
            return;
        };
        if block_hash != candidate.block.hash() {
            warn!(peer = %from, "vote for a block that was not proposed");
            return;
        }
        // Only votes for the phase the round is actually in may reach the
        // collector; an early vote for a later phase would otherwise seed
        // it and starve the genuine quorum until the view times out.
        if phase != self.phase {
            trace!(
                peer = %from,
                vote_phase = ?phase,
                round_phase = ?self.phase,
                "vote for a phase the round is not in"
            );
            return;
        }

        let message = QuorumCertificate::signing_message(phase, self.view_number, &block_hash);
        if from.verify(&message, &signature).is_err() {
            warn!(peer = %from, ?phase, "vote carried an invalid signature");
            return;
        }

        self.record_vote(phase, block_hash, from, signature, actions);
    }

    /// Add a verified vote to the certificate under construction, forming
    /// it and opening the next phase at quorum.
    fn record_vote(
        &mut self,
        phase: Phase,
        block_hash: Hash,
        signer: PeerKey,
        signature: Signature,
        actions: &mut Vec<Action>,
    ) {
        match &self.collecting {
            Some(qc) if qc.phase == phase && qc.block_hash == block_hash => {}
            Some(_) => {
                trace!(peer = %signer, ?phase, "vote for a phase not being collected");
                return;
            }
            None => {
                self.collecting = Some(QuorumCertificate::new(phase, self.view_number, block_hash));
            }
        }

        let quorum = self.quorum();
        let formed = {
            let qc = self.collecting.as_mut().expect("collector was just ensured");
            qc.signatures.add(signer, signature);
            qc.signatures.len() >= quorum
        };
        if !formed {
            return;
        }

        let qc = self.collecting.take().expect("collector was just ensured");
        debug!(view = self.view_number, ?phase, block = %qc.block_hash, "certificate formed");
        self.on_certificate_formed(qc, actions);
    }

    /// A certificate formed from this view's votes; adopt it and drive the
    /// round forward.
    fn on_certificate_formed(&mut self, qc: QuorumCertificate, actions: &mut Vec<Action>) {
        let candidate = self
            .current_proposal
            .clone()
            .expect("certificates only form over the current proposal");
        actions.push(Action::PersistQc(qc.clone()));

        match qc.phase {
            Phase::Prepare => {
                self.prepare_qc = qc.clone();
                self.prepared_block = candidate.block.clone();
                self.prepared_state = candidate.post_state;
                self.phase = Phase::PreCommit;
                actions.push(Action::Broadcast(ConsensusMessage::Proposal {
                    view_number: self.view_number,
                    phase: Phase::PreCommit,
                    block: candidate.block.clone(),
                    justify: qc,
                }));
                self.cast_own_vote(Phase::PreCommit, candidate.block.hash(), actions);
            }
            Phase::PreCommit => {
                self.locked_qc = qc.clone();
                self.phase = Phase::Commit;
                actions.push(Action::Broadcast(ConsensusMessage::Proposal {
                    view_number: self.view_number,
                    phase: Phase::Commit,
                    block: candidate.block.clone(),
                    justify: qc,
                }));
                self.cast_own_vote(Phase::Commit, candidate.block.hash(), actions);
            }
            Phase::Commit => {
                self.commit_qc = qc.clone();
                self.phase = Phase::Decide;
                actions.push(Action::Broadcast(ConsensusMessage::Decide {
                    view_number: self.view_number,
                    block_hash: candidate.block.hash(),
                    commit_qc: qc,
                }));
                self.decide(candidate, actions);
            }
            Phase::Decide => {}
        }
    }

    /// Sign and record the local vote; as leader that feeds the collector
    /// directly, otherwise it is sent to the leader.
    fn cast_own_vote(&mut self, phase: Phase, block_hash: Hash, actions: &mut Vec<Action>) {
        if !self.voted_phases.insert(phase) {
            return;
        }
        let message = QuorumCertificate::signing_message(phase, self.view_number, &block_hash);
        let signature = self.keypair.sign(&message);

        if self.is_leader() {
            self.record_vote(phase, block_hash, self.local_key, signature, actions);
        } else {
            actions.push(Action::Send(
                self.leader(self.view_number),
                ConsensusMessage::Vote {
                    view_number: self.view_number,
                    phase,
                    block_hash,
                    signature,
                },
            ));
        }
    }

    // ── Replica side ───────────────────────────────────────────────────

    fn on_proposal(
        &mut self,
        from: PeerKey,
        phase: Phase,
        block: Block,
        justify: QuorumCertificate,
        actions: &mut Vec<Action>,
    ) {
        if from != self.leader(self.view_number) {
            warn!(peer = %from, "proposal from a non-leader");
            return;
        }
        if !justify.is_valid(&self.federation) {
            warn!(peer = %from, ?phase, "proposal carried an invalid certificate");
            return;
        }

        match phase {
            Phase::Prepare => self.on_prepare_proposal(block, justify, actions),
            Phase::PreCommit | Phase::Commit => {
                self.on_phase_proposal(phase, block, justify, actions)
            }
            Phase::Decide => {}
        }
    }

    fn on_prepare_proposal(
        &mut self,
        block: Block,
        justify: QuorumCertificate,
        actions: &mut Vec<Action>,
    ) {
        // The proposal must extend its justification...
        if block.parent != justify.block_hash {
            warn!(block = %block.hash(), "proposal does not extend its justification");
            return;
        }
        // ...and satisfy the safety rule: the justification is newer than
        // the lock, or the block extends the locked block.
        if justify.view_number < self.locked_qc.view_number
            && block.parent != self.locked_qc.block_hash
        {
            debug!(block = %block.hash(), "proposal conflicts with the locked certificate");
            return;
        }

        let Some(candidate) = self.admit_block(block) else {
            return;
        };

        let hash = candidate.block.hash();
        actions.push(Action::PersistBlock(candidate.block.clone()));
        self.current_proposal = Some(candidate);
        self.phase = Phase::Prepare;
        self.cast_own_vote(Phase::Prepare, hash, actions);
    }

    /// `PreCommit` and `Commit` proposals carry the certificate formed by
    /// the previous phase.
    fn on_phase_proposal(
        &mut self,
        phase: Phase,
        block: Block,
        justify: QuorumCertificate,
        actions: &mut Vec<Action>,
    ) {
        let expected_justify_phase = match phase {
            Phase::PreCommit => Phase::Prepare,
            Phase::Commit => Phase::PreCommit,
            _ => return,
        };
        if justify.phase != expected_justify_phase
            || justify.view_number != self.view_number
            || justify.block_hash != block.hash()
        {
            warn!(?phase, "phase proposal with a mismatched justification");
            return;
        }

        // Adopt the proposal if the prepare phase was missed.
        if self.current_proposal.is_none() {
            match self.admit_block(block.clone()) {
                Some(candidate) => {
                    actions.push(Action::PersistBlock(candidate.block.clone()));
                    self.current_proposal = Some(candidate);
                }
                None => return,
            }
        }
        let candidate_hash = match &self.current_proposal {
            Some(candidate) => candidate.block.hash(),
            None => return,
        };
        if candidate_hash != block.hash() {
            warn!(?phase, "phase proposal for a different block");
            return;
        }

        actions.push(Action::PersistQc(justify.clone()));
        match phase {
            Phase::PreCommit => {
                self.prepare_qc = justify;
                if let Some(candidate) = &self.current_proposal {
                    self.prepared_block = candidate.block.clone();
                    self.prepared_state = candidate.post_state;
                }
                self.phase = Phase::PreCommit;
            }
            Phase::Commit => {
                self.locked_qc = justify;
                self.phase = Phase::Commit;
            }
            _ => {}
        }
        self.cast_own_vote(phase, candidate_hash, actions);
    }

    fn on_decide(
        &mut self,
        from: PeerKey,
        block_hash: Hash,
        commit_qc: QuorumCertificate,
        actions: &mut Vec<Action>,
    ) {
        if from != self.leader(self.view_number) {
            warn!(peer = %from, "decide from a non-leader");
            return;
        }
        if commit_qc.phase != Phase::Commit
            || commit_qc.view_number != self.view_number
            || commit_qc.block_hash != block_hash
            || !commit_qc.is_valid(&self.federation)
        {
            warn!(peer = %from, "decide with an invalid commit certificate");
            return;
        }
        let Some(candidate) = self.current_proposal.clone() else {
            debug!("decide without a held proposal, cannot execute");
            return;
        };
        if candidate.block.hash() != block_hash {
            warn!("decide for a different block than proposed");
            return;
        }

        self.commit_qc = commit_qc.clone();
        actions.push(Action::PersistQc(commit_qc));
        self.decide(candidate, actions);
    }

    // ── Shared round machinery ─────────────────────────────────────────

    /// Check a proposed block against the local prepared chain tip and
    /// recompute its post-state. Rejects blocks whose parent is unknown
    /// (this node is behind) or whose claimed post-state is wrong.
    fn admit_block(&self, block: Block) -> Option<CandidateBlock> {
        if block.parent != self.prepared_block.hash() {
            debug!(
                block = %block.hash(),
                "proposal extends an unknown parent, ignoring"
            );
            return None;
        }
        let post_state = self.prepared_state.apply(block.command, self.limits);
        if post_state.state_hash() != block.post_state {
            warn!(block = %block.hash(), "proposal claims a wrong post-state");
            return None;
        }
        Some(CandidateBlock { block, post_state })
    }

    /// Execute the decided block and move to the next view.
    fn decide(&mut self, candidate: CandidateBlock, actions: &mut Vec<Action>) {
        debug!(
            view = self.view_number,
            block = %candidate.block.hash(),
            "block decided"
        );
        self.prepared_block = candidate.block.clone();
        self.prepared_state = candidate.post_state;
        self.consecutive_timeouts = 0;
        actions.push(Action::ExecuteBlock(candidate.block));
        self.enter_view(self.view_number + 1, actions);
    }

    /// Reset per-view state and announce the new view to its leader.
    fn enter_view(&mut self, view_number: u64, actions: &mut Vec<Action>) {
        self.view_number = view_number;
        self.phase = Phase::Prepare;
        self.current_proposal = None;
        // A command is a decision for one view; the application decides
        // afresh each round.
        self.pending_command = None;
        self.awaiting_command = false;
        self.new_view_signers.clear();
        self.collecting = None;
        self.voted_phases.clear();

        actions.push(Action::PersistViewNumber(view_number));
        actions.push(Action::ScheduleViewTimeout {
            view_number,
            duration: self.config.view_timeout(self.consecutive_timeouts),
        });

        let new_view = ConsensusMessage::NewView {
            view_number,
            prepare_qc: self.prepare_qc.clone(),
            prepared_block: self.prepared_block.clone(),
        };
        let leader = self.leader(view_number);
        if leader == self.local_key {
            let qc = self.prepare_qc.clone();
            let block = self.prepared_block.clone();
            self.on_new_view(self.local_key, qc, block, actions);
        } else {
            actions.push(Action::Send(leader, new_view));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridbot_types::{FederationEntry, PeerAddress, ViewStateBundle};

    const LIMITS: GridLimits = GridLimits {
        max_row: 10,
        max_col: 10,
    };

    fn quick_config() -> ConsensusConfig {
        ConsensusConfig::default().with_min_timeout(Duration::from_millis(100))
    }

    /// Deterministic member seeds plus the federation listing the derived
    /// keys in order.
    fn seeded_setup(n: usize) -> (Vec<[u8; 32]>, Federation) {
        let seeds: Vec<[u8; 32]> = (0..n as u8).map(|i| [i + 1; 32]).collect();
        let federation = Federation::new(
            seeds
                .iter()
                .enumerate()
                .map(|(i, seed)| FederationEntry {
                    key: KeyPair::from_seed(seed).peer_key(),
                    address: PeerAddress::new("127.0.0.1", 5000 + i as u16),
                })
                .collect(),
        );
        (seeds, federation)
    }

    fn machine_from_seed(
        seed: &[u8; 32],
        federation: &Federation,
        view_number: u64,
    ) -> HotStuffMachine {
        let genesis = Block::genesis();
        let bundle = ViewStateBundle::genesis(genesis.hash());
        let initial = ProtocolState {
            view_number,
            phase: Phase::Prepare,
            prepare_qc: bundle.prepare_qc,
            locked_qc: bundle.locked_qc,
            commit_qc: bundle.commit_qc,
            prepared_block: genesis,
        };
        HotStuffMachine::new(
            KeyPair::from_seed(seed),
            federation.clone(),
            quick_config(),
            LIMITS,
            initial,
            RobotState::initial(),
        )
    }

    fn has_execute(actions: &[Action]) -> Option<Block> {
        actions.iter().find_map(|a| match a {
            Action::ExecuteBlock(block) => Some(block.clone()),
            _ => None,
        })
    }

    #[test]
    fn single_node_decides_alone() {
        let (seeds, federation) = seeded_setup(1);
        // View 1 of a 1-member federation: the node leads itself.
        let mut machine = machine_from_seed(&seeds[0], &federation, 1);

        let start_actions = machine.start();
        assert!(has_execute(&start_actions).is_none());

        let actions = machine.handle(Event::CommandReady(RobotCommand::MoveDown));
        let executed = has_execute(&actions).expect("single node should decide immediately");
        assert_eq!(executed.command, RobotCommand::MoveDown);
        assert_eq!(executed.parent, Block::genesis().hash());
        // The decision advanced the view.
        assert_eq!(machine.view_number(), 2);
        assert_eq!(machine.prepared_block().hash(), executed.hash());
    }

    #[test]
    fn stale_view_timeout_is_ignored() {
        let (seeds, federation) = seeded_setup(2);
        let mut machine = machine_from_seed(&seeds[0], &federation, 3);
        machine.start();

        let actions = machine.handle(Event::ViewTimeout { view_number: 2 });
        assert!(actions.is_empty());
        assert_eq!(machine.view_number(), 3);
    }

    #[test]
    fn timeout_advances_view_with_backoff() {
        let (seeds, federation) = seeded_setup(2);
        let mut machine = machine_from_seed(&seeds[0], &federation, 1);
        machine.start();

        let actions = machine.handle(Event::ViewTimeout { view_number: 1 });
        assert_eq!(machine.view_number(), 2);
        let timeout = actions.iter().find_map(|a| match a {
            Action::ScheduleViewTimeout { duration, .. } => Some(*duration),
            _ => None,
        });
        // One failure doubled the 100ms base timeout.
        assert_eq!(timeout, Some(Duration::from_millis(200)));
    }

    #[test]
    fn leader_waits_for_new_view_quorum_and_command() {
        let (seeds, federation) = seeded_setup(4);
        let keys: Vec<PeerKey> = seeds.iter().map(|s| KeyPair::from_seed(s).peer_key()).collect();
        // View 4 of 4 members is led by index 0.
        let mut leader = machine_from_seed(&seeds[0], &federation, 4);
        leader.start();
        let genesis_qc = QuorumCertificate::genesis(Block::genesis().hash());

        // A command alone does not propose: no new-view quorum yet.
        let actions = leader.handle(Event::CommandReady(RobotCommand::MoveRight));
        assert!(actions.is_empty());

        // One remote new-view (plus the leader's own) is below quorum of 3.
        let actions = leader.handle(Event::MessageReceived {
            from: keys[1],
            message: ConsensusMessage::NewView {
                view_number: 4,
                prepare_qc: genesis_qc.clone(),
                prepared_block: Block::genesis(),
            },
        });
        assert!(actions.is_empty());

        // The third new-view completes the quorum; the pending command is
        // proposed at once.
        let actions = leader.handle(Event::MessageReceived {
            from: keys[2],
            message: ConsensusMessage::NewView {
                view_number: 4,
                prepare_qc: genesis_qc,
                prepared_block: Block::genesis(),
            },
        });
        let proposal = actions.iter().find_map(|a| match a {
            Action::Broadcast(ConsensusMessage::Proposal { phase, block, .. }) => {
                Some((*phase, block.clone()))
            }
            _ => None,
        });
        let (phase, block) = proposal.expect("leader should propose");
        assert_eq!(phase, Phase::Prepare);
        assert_eq!(block.command, RobotCommand::MoveRight);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::PersistBlock(b) if b.hash() == block.hash())));
    }

    #[test]
    fn replica_votes_once_per_phase() {
        let (seeds, federation) = seeded_setup(4);
        // View 4 is led by member 0; member 1 replicates.
        let leader_pair = KeyPair::from_seed(&seeds[0]);
        let mut replica = machine_from_seed(&seeds[1], &federation, 4);
        replica.start();

        let genesis_qc = QuorumCertificate::genesis(Block::genesis().hash());
        let post = RobotState::initial().apply(RobotCommand::MoveDown, LIMITS);
        let block = Block::new(
            Block::genesis().hash(),
            post.state_hash(),
            RobotCommand::MoveDown,
        );

        let proposal = ConsensusMessage::Proposal {
            view_number: 4,
            phase: Phase::Prepare,
            block: block.clone(),
            justify: genesis_qc,
        };
        let actions = replica.handle(Event::MessageReceived {
            from: leader_pair.peer_key(),
            message: proposal.clone(),
        });
        let votes: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, Action::Send(_, ConsensusMessage::Vote { .. })))
            .collect();
        assert_eq!(votes.len(), 1);

        // A replayed proposal must not produce a second vote.
        let actions = replica.handle(Event::MessageReceived {
            from: leader_pair.peer_key(),
            message: proposal,
        });
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::Send(_, ConsensusMessage::Vote { .. }))));
    }

    #[test]
    fn replica_rejects_wrong_post_state() {
        let (seeds, federation) = seeded_setup(4);
        let leader_pair = KeyPair::from_seed(&seeds[0]);
        let mut replica = machine_from_seed(&seeds[1], &federation, 4);
        replica.start();

        let block = Block::new(
            Block::genesis().hash(),
            Hash::digest(b"forged state"),
            RobotCommand::MoveDown,
        );
        let actions = replica.handle(Event::MessageReceived {
            from: leader_pair.peer_key(),
            message: ConsensusMessage::Proposal {
                view_number: 4,
                phase: Phase::Prepare,
                block,
                justify: QuorumCertificate::genesis(Block::genesis().hash()),
            },
        });
        assert!(actions.is_empty());
    }

    #[test]
    fn proposal_from_non_leader_is_rejected() {
        let (seeds, federation) = seeded_setup(4);
        let impostor = KeyPair::from_seed(&seeds[2]);
        let mut replica = machine_from_seed(&seeds[1], &federation, 4);
        replica.start();

        let post = RobotState::initial().apply(RobotCommand::Stay, LIMITS);
        let block = Block::new(Block::genesis().hash(), post.state_hash(), RobotCommand::Stay);
        let actions = replica.handle(Event::MessageReceived {
            from: impostor.peer_key(),
            message: ConsensusMessage::Proposal {
                view_number: 4,
                phase: Phase::Prepare,
                block,
                justify: QuorumCertificate::genesis(Block::genesis().hash()),
            },
        });
        assert!(actions.is_empty());
    }

    #[test]
    fn forged_vote_is_not_counted() {
        let (seeds, federation) = seeded_setup(4);
        let keys: Vec<PeerKey> = seeds.iter().map(|s| KeyPair::from_seed(s).peer_key()).collect();
        let mut leader = machine_from_seed(&seeds[0], &federation, 4);
        leader.start();
        let block_hash = propose_with_quorum(&mut leader, &keys);

        // A vote signed by the wrong key must be dropped: together with
        // the leader's own vote it would otherwise reach quorum.
        let forger = KeyPair::from_seed(&seeds[3]);
        let forged = forger.sign(&QuorumCertificate::signing_message(
            Phase::Prepare,
            4,
            &block_hash,
        ));
        let actions = leader.handle(Event::MessageReceived {
            from: keys[1],
            message: ConsensusMessage::Vote {
                view_number: 4,
                phase: Phase::Prepare,
                block_hash,
                signature: forged,
            },
        });
        assert!(actions.is_empty());
    }

    /// Drive a 4-member leader through new-view quorum and a proposal,
    /// returning the proposed block's hash.
    fn propose_with_quorum(leader: &mut HotStuffMachine, keys: &[PeerKey]) -> Hash {
        let genesis_qc = QuorumCertificate::genesis(Block::genesis().hash());
        for key in [keys[1], keys[2]] {
            leader.handle(Event::MessageReceived {
                from: key,
                message: ConsensusMessage::NewView {
                    view_number: 4,
                    prepare_qc: genesis_qc.clone(),
                    prepared_block: Block::genesis(),
                },
            });
        }
        let actions = leader.handle(Event::CommandReady(RobotCommand::Stay));
        actions
            .iter()
            .find_map(|a| match a {
                Action::PersistBlock(b) => Some(b.hash()),
                _ => None,
            })
            .expect("leader proposed")
    }

    #[test]
    fn early_vote_for_a_later_phase_is_ignored() {
        let (seeds, federation) = seeded_setup(4);
        let keys: Vec<PeerKey> = seeds.iter().map(|s| KeyPair::from_seed(s).peer_key()).collect();
        let mut leader = machine_from_seed(&seeds[0], &federation, 4);
        leader.start();
        let block_hash = propose_with_quorum(&mut leader, &keys);

        // A member races ahead with a validly signed commit vote while the
        // round is still in prepare; it must not seed the collector.
        let rogue = KeyPair::from_seed(&seeds[3]);
        let commit_sig = rogue.sign(&QuorumCertificate::signing_message(
            Phase::Commit,
            4,
            &block_hash,
        ));
        let actions = leader.handle(Event::MessageReceived {
            from: keys[3],
            message: ConsensusMessage::Vote {
                view_number: 4,
                phase: Phase::Commit,
                block_hash,
                signature: commit_sig,
            },
        });
        assert!(actions.is_empty());

        // The genuine prepare votes still complete their quorum and open
        // the next phase.
        let prepare_vote = |seed: &[u8; 32]| {
            let pair = KeyPair::from_seed(seed);
            let signature = pair.sign(&QuorumCertificate::signing_message(
                Phase::Prepare,
                4,
                &block_hash,
            ));
            Event::MessageReceived {
                from: pair.peer_key(),
                message: ConsensusMessage::Vote {
                    view_number: 4,
                    phase: Phase::Prepare,
                    block_hash,
                    signature,
                },
            }
        };
        leader.handle(prepare_vote(&seeds[1]));
        let actions = leader.handle(prepare_vote(&seeds[2]));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Broadcast(ConsensusMessage::Proposal {
                phase: Phase::PreCommit,
                ..
            })
        )));
    }

    #[test]
    fn leader_adopts_a_higher_certificate_from_new_view() {
        let (seeds, federation) = seeded_setup(4);
        let mut leader = machine_from_seed(&seeds[0], &federation, 4);
        leader.start();

        // The other members prepared a block in view 3 that this leader,
        // fresh from a restart, never saw.
        let post = RobotState::initial().apply(RobotCommand::MoveDown, LIMITS);
        let block = Block::new(
            Block::genesis().hash(),
            post.state_hash(),
            RobotCommand::MoveDown,
        );
        let mut qc = QuorumCertificate::new(Phase::Prepare, 3, block.hash());
        for seed in &seeds[1..4] {
            let pair = KeyPair::from_seed(seed);
            let sig = qc.sign_vote(&pair);
            qc.signatures.add(pair.peer_key(), sig);
        }

        for seed in &seeds[1..3] {
            let pair = KeyPair::from_seed(seed);
            leader.handle(Event::MessageReceived {
                from: pair.peer_key(),
                message: ConsensusMessage::NewView {
                    view_number: 4,
                    prepare_qc: qc.clone(),
                    prepared_block: block.clone(),
                },
            });
        }
        // The carried certificate replaced the stale tip.
        assert_eq!(leader.prepared_block().hash(), block.hash());

        // The next proposal extends the adopted block, so up-to-date
        // replicas will accept it.
        let actions = leader.handle(Event::CommandReady(RobotCommand::MoveRight));
        let proposed = actions
            .iter()
            .find_map(|a| match a {
                Action::Broadcast(ConsensusMessage::Proposal {
                    phase: Phase::Prepare,
                    block: proposed,
                    ..
                }) => Some(proposed.clone()),
                _ => None,
            })
            .expect("leader should propose");
        assert_eq!(proposed.parent, block.hash());
    }
}
