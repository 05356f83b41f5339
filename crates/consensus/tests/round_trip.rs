//! Drives several machines against each other in-process, delivering each
//! machine's outbound actions as the others' inbound events, and checks
//! that every member executes the same chain.

use gridbot_consensus::{Action, ConsensusConfig, Event, HotStuffMachine};
use gridbot_types::{
    Block, Federation, FederationEntry, GridLimits, KeyPair, PeerAddress, PeerKey, Phase,
    ProtocolState, RobotCommand, RobotState, ViewStateBundle,
};
use std::collections::{HashMap, VecDeque};

const LIMITS: GridLimits = GridLimits {
    max_row: 10,
    max_col: 10,
};

struct Network {
    machines: HashMap<PeerKey, HotStuffMachine>,
    order: Vec<PeerKey>,
    executed: HashMap<PeerKey, Vec<Block>>,
    queue: VecDeque<(PeerKey, PeerKey, gridbot_consensus::ConsensusMessage)>,
}

impl Network {
    fn new(n: usize) -> Self {
        let seeds: Vec<[u8; 32]> = (0..n as u8).map(|i| [i + 1; 32]).collect();
        let federation = Federation::new(
            seeds
                .iter()
                .enumerate()
                .map(|(i, seed)| FederationEntry {
                    key: KeyPair::from_seed(seed).peer_key(),
                    address: PeerAddress::new("127.0.0.1", 6000 + i as u16),
                })
                .collect(),
        );

        let genesis = Block::genesis();
        let bundle = ViewStateBundle::genesis(genesis.hash());
        let mut machines = HashMap::new();
        let mut order = Vec::new();
        for seed in &seeds {
            let keypair = KeyPair::from_seed(seed);
            let key = keypair.peer_key();
            let initial = ProtocolState {
                view_number: 1,
                phase: Phase::Prepare,
                prepare_qc: bundle.prepare_qc.clone(),
                locked_qc: bundle.locked_qc.clone(),
                commit_qc: bundle.commit_qc.clone(),
                prepared_block: genesis.clone(),
            };
            machines.insert(
                key,
                HotStuffMachine::new(
                    keypair,
                    federation.clone(),
                    ConsensusConfig::default(),
                    LIMITS,
                    initial,
                    RobotState::initial(),
                ),
            );
            order.push(key);
        }

        Network {
            machines,
            order,
            executed: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn absorb(&mut self, source: PeerKey, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast(message) => {
                    for key in &self.order {
                        if *key != source {
                            self.queue.push_back((source, *key, message.clone()));
                        }
                    }
                }
                Action::Send(to, message) => self.queue.push_back((source, to, message)),
                Action::ExecuteBlock(block) => {
                    self.executed.entry(source).or_default().push(block)
                }
                // Persistence and timers are runner concerns; the
                // simulated network drops them.
                _ => {}
            }
        }
    }

    fn start_all(&mut self) {
        for key in self.order.clone() {
            let actions = self.machines.get_mut(&key).unwrap().start();
            self.absorb(key, actions);
        }
    }

    fn command_all(&mut self, command: RobotCommand) {
        for key in self.order.clone() {
            let actions = self
                .machines
                .get_mut(&key)
                .unwrap()
                .handle(Event::CommandReady(command));
            self.absorb(key, actions);
        }
    }

    /// Deliver queued messages until quiescent. Bounded so a protocol bug
    /// fails the test instead of hanging it.
    fn run_to_quiescence(&mut self) {
        let mut delivered = 0;
        while let Some((from, to, message)) = self.queue.pop_front() {
            delivered += 1;
            assert!(delivered < 10_000, "message storm, protocol is not settling");
            let actions = self
                .machines
                .get_mut(&to)
                .unwrap()
                .handle(Event::MessageReceived { from, message });
            self.absorb(to, actions);
        }
    }
}

#[test]
fn three_members_decide_and_stay_in_agreement() {
    let mut network = Network::new(3);
    network.start_all();
    network.command_all(RobotCommand::MoveDown);
    network.run_to_quiescence();

    // Every member executed exactly one block, and the same one.
    let mut blocks = Vec::new();
    for key in &network.order {
        let executed = network.executed.get(key).expect("member executed nothing");
        assert_eq!(executed.len(), 1);
        blocks.push(executed[0].clone());
    }
    assert_eq!(blocks[0], blocks[1]);
    assert_eq!(blocks[1], blocks[2]);
    assert_eq!(blocks[0].command, RobotCommand::MoveDown);
    assert_eq!(blocks[0].parent, Block::genesis().hash());

    // All members moved on to the next view together.
    let views: Vec<u64> = network
        .order
        .iter()
        .map(|k| network.machines[k].view_number())
        .collect();
    assert!(views.iter().all(|v| *v == views[0]));
}

#[test]
fn consecutive_rounds_extend_the_chain() {
    let mut network = Network::new(4);
    network.start_all();

    network.command_all(RobotCommand::MoveDown);
    network.run_to_quiescence();
    network.command_all(RobotCommand::MoveRight);
    network.run_to_quiescence();

    for key in &network.order {
        let executed = &network.executed[key];
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[0].command, RobotCommand::MoveDown);
        assert_eq!(executed[1].command, RobotCommand::MoveRight);
        // The second block extends the first.
        assert_eq!(executed[1].parent, executed[0].hash());
    }
}
