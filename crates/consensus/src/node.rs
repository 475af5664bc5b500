//! Drives a `raft::RawNode` on a dedicated tokio task: feeds it proposals
//! and inbound messages, ticks it on a timer, and applies committed
//! entries to the [`Fsm`]. This is the thin wrapper promised by §4.5's
//! contract surface: `apply`/`snapshot`/`restore`/`leader`/`add_voter`
//! /`remove_server`/`leader_change_channel`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use raft::prelude::*;
use raft::storage::MemStorage;
use raft::{Config as RaftConfig, RawNode, StateRole, Storage};
use slog::{o, Drain};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::fsm::{Fsm, MaxVolumeIdCommand};
use crate::transport::RaftTransport;

const TICK_INTERVAL: Duration = Duration::from_millis(100);

type ProposeReply = oneshot::Sender<Result<(), common::CommonError>>;

enum Command {
    Propose { cmd: MaxVolumeIdCommand, reply: ProposeReply },
    Step(Box<Message>),
    AddVoter { id: u64, reply: ProposeReply },
    RemoveServer { id: u64, reply: ProposeReply },
}

struct PendingProposal {
    index: u64,
    term: u64,
    reply: ProposeReply,
}

/// Handle to a running consensus node. Cloning is cheap; every clone
/// shares the same background driver task and [`Fsm`].
#[derive(Clone)]
pub struct ConsensusNode {
    id: u64,
    fsm: Arc<Fsm>,
    commands: mpsc::UnboundedSender<Command>,
    leader: watch::Receiver<Option<u64>>,
}

impl ConsensusNode {
    /// Spawns the driver task for a node with the given raft id and
    /// initial voter set, delivering outbound messages through
    /// `transport`.
    pub fn spawn(id: u64, voters: Vec<u64>, transport: Arc<dyn RaftTransport>) -> Self {
        let fsm = Arc::new(Fsm::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let (leader_tx, leader_rx) = watch::channel(None);

        let storage = MemStorage::new_with_conf_state((voters, vec![]));
        let config = RaftConfig {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            ..Default::default()
        };
        let logger = slog::Logger::root(slog_stdlog::StdLog.fuse(), o!());
        let raw_node = RawNode::new(&config, storage, &logger).expect("raft config validated by caller");

        let driver_fsm = fsm.clone();
        tokio::spawn(drive(raw_node, rx, transport, driver_fsm, leader_tx));

        Self {
            id,
            fsm,
            commands: tx,
            leader: leader_rx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Currently known leader's raft id, if an election has completed.
    pub fn leader(&self) -> Option<u64> {
        *self.leader.borrow()
    }

    /// A channel that always holds the most recently observed leader;
    /// subscribers see the current value immediately, then every change.
    pub fn leader_change_channel(&self) -> watch::Receiver<Option<u64>> {
        self.leader.clone()
    }

    pub fn current_max_volume_id(&self) -> u32 {
        self.fsm.current()
    }

    /// Proposes `cmd` to the replicated log. Resolves once the entry is
    /// applied locally. Returns `CommonError::NotLeader` if this node
    /// isn't the leader; the caller is expected to retry against the
    /// leader named in that error.
    pub async fn propose(&self, cmd: MaxVolumeIdCommand) -> Result<(), common::CommonError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Propose { cmd, reply })
            .map_err(|_| common::CommonError::Internal("consensus driver task has exited".into()))?;
        rx.await
            .map_err(|_| common::CommonError::Internal("consensus driver task dropped reply".into()))?
    }

    /// Feeds an inbound raft message, received over the `RaftStep` RPC,
    /// into the local node.
    pub fn step(&self, message: Message) {
        let _ = self.commands.send(Command::Step(Box::new(message)));
    }

    pub async fn add_voter(&self, id: u64) -> Result<(), common::CommonError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::AddVoter { id, reply })
            .map_err(|_| common::CommonError::Internal("consensus driver task has exited".into()))?;
        rx.await
            .map_err(|_| common::CommonError::Internal("consensus driver task dropped reply".into()))?
    }

    pub async fn remove_server(&self, id: u64) -> Result<(), common::CommonError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::RemoveServer { id, reply })
            .map_err(|_| common::CommonError::Internal("consensus driver task has exited".into()))?;
        rx.await
            .map_err(|_| common::CommonError::Internal("consensus driver task dropped reply".into()))?
    }
}

async fn drive(
    mut raw_node: RawNode<MemStorage>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    transport: Arc<dyn RaftTransport>,
    fsm: Arc<Fsm>,
    leader_tx: watch::Sender<Option<u64>>,
) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    let mut pending: VecDeque<PendingProposal> = VecDeque::new();
    let mut last_leader = raw_node.raft.leader_id;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                raw_node.tick();
            }
            cmd = commands.recv() => {
                match cmd {
                    None => {
                        info!("consensus command channel closed, stopping driver");
                        return;
                    }
                    Some(Command::Propose { cmd, reply }) => handle_propose(&mut raw_node, cmd, reply, &mut pending),
                    Some(Command::Step(message)) => {
                        if let Err(err) = raw_node.step(*message) {
                            warn!(error = %err, "failed to step raft message");
                        }
                    }
                    Some(Command::AddVoter { id, reply }) => handle_conf_change(&mut raw_node, id, ConfChangeType::AddNode, reply),
                    Some(Command::RemoveServer { id, reply }) => handle_conf_change(&mut raw_node, id, ConfChangeType::RemoveNode, reply),
                }
            }
        }

        if !raw_node.has_ready() {
            continue;
        }
        process_ready(&mut raw_node, &transport, &fsm, &mut pending).await;

        let current = raw_node.raft.leader_id;
        if current != last_leader {
            last_leader = current;
            let announced = if current == 0 { None } else { Some(current) };
            debug!(leader = ?announced, "raft leader changed");
            let _ = leader_tx.send(announced);
        }
    }
}

fn handle_propose(
    raw_node: &mut RawNode<MemStorage>,
    cmd: MaxVolumeIdCommand,
    reply: ProposeReply,
    pending: &mut VecDeque<PendingProposal>,
) {
    if raw_node.raft.state != StateRole::Leader {
        let leader = leader_address(raw_node);
        let _ = reply.send(Err(common::CommonError::NotLeader { leader }));
        return;
    }
    match raw_node.propose(vec![], cmd.encode()) {
        Ok(()) => {
            let index = raw_node.raft.raft_log.last_index();
            let term = raw_node.raft.term;
            pending.push_back(PendingProposal { index, term, reply });
        }
        Err(err) => {
            let _ = reply.send(Err(common::CommonError::Internal(format!("propose failed: {err}"))));
        }
    }
}

fn handle_conf_change(
    raw_node: &mut RawNode<MemStorage>,
    id: u64,
    change_type: ConfChangeType,
    reply: ProposeReply,
) {
    let mut cc = ConfChange::default();
    cc.set_node_id(id);
    cc.set_change_type(change_type);
    match raw_node.propose_conf_change(vec![], cc) {
        Ok(()) => {
            let _ = reply.send(Ok(()));
        }
        Err(err) => {
            let _ = reply.send(Err(common::CommonError::Internal(format!("membership change failed: {err}"))));
        }
    }
}

async fn process_ready(
    raw_node: &mut RawNode<MemStorage>,
    transport: &Arc<dyn RaftTransport>,
    fsm: &Arc<Fsm>,
    pending: &mut VecDeque<PendingProposal>,
) {
    let mut ready = raw_node.ready();

    for message in ready.take_messages() {
        transport.send(message.to, message).await;
    }

    if *ready.snapshot() != Snapshot::default() {
        let snapshot = ready.snapshot().clone();
        if let Err(err) = raw_node.mut_store().wl().apply_snapshot(snapshot.clone()) {
            warn!(error = %err, "failed to apply raft snapshot");
        } else {
            fsm.restore(snapshot.get_data());
        }
    }

    if !ready.entries().is_empty() {
        if let Err(err) = raw_node.mut_store().wl().append(ready.entries()) {
            warn!(error = %err, "failed to persist raft entries");
        }
    }

    if let Some(hs) = ready.hs() {
        raw_node.mut_store().wl().set_hardstate(hs.clone());
    }

    for message in ready.take_persisted_messages() {
        transport.send(message.to, message).await;
    }

    let mut light_rd = raw_node.advance(ready);

    if let Some(commit) = light_rd.commit_index() {
        raw_node.mut_store().wl().mut_hard_state().set_commit(commit);
    }
    for message in light_rd.take_messages() {
        transport.send(message.to, message).await;
    }
    for entry in light_rd.take_committed_entries() {
        apply_committed_entry(raw_node, &entry, fsm, pending);
    }
    raw_node.advance_apply();
}

fn apply_committed_entry(
    raw_node: &mut RawNode<MemStorage>,
    entry: &Entry,
    fsm: &Arc<Fsm>,
    pending: &mut VecDeque<PendingProposal>,
) {
    if !entry.data.is_empty() {
        match entry.get_entry_type() {
            EntryType::EntryNormal => {
                if let Some(cmd) = MaxVolumeIdCommand::decode(&entry.data) {
                    fsm.apply(cmd);
                }
            }
            EntryType::EntryConfChange => {
                if let Ok(cc) = <ConfChange as prost::Message>::decode(entry.data.as_slice()) {
                    let conf_state = raw_node.apply_conf_change(&cc).expect("conf change is well-formed");
                    raw_node.mut_store().wl().set_conf_state(conf_state);
                }
            }
            EntryType::EntryConfChangeV2 => {}
        }
    }

    while let Some(front) = pending.front() {
        if front.index > entry.index || (front.index == entry.index && front.term > entry.term) {
            break;
        }
        let proposal = pending.pop_front().expect("front just checked");
        let outcome = if proposal.index == entry.index && proposal.term == entry.term {
            Ok(())
        } else {
            Err(common::CommonError::LeaderChanged)
        };
        let _ = proposal.reply.send(outcome);
    }
}

fn leader_address(raw_node: &RawNode<MemStorage>) -> Option<String> {
    let leader = raw_node.raft.leader_id;
    (leader != 0).then(|| leader.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NullTransport;

    #[tokio::test]
    async fn single_voter_elects_itself_leader() {
        let node = ConsensusNode::spawn(1, vec![1], Arc::new(NullTransport));

        let mut leader_rx = node.leader_change_channel();
        tokio::time::timeout(Duration::from_secs(5), leader_rx.changed())
            .await
            .expect("leader elected before timeout")
            .unwrap();
        assert_eq!(node.leader(), Some(1));
    }

    #[tokio::test]
    async fn propose_applies_once_leader_is_known() {
        let node = ConsensusNode::spawn(1, vec![1], Arc::new(NullTransport));
        let mut leader_rx = node.leader_change_channel();
        tokio::time::timeout(Duration::from_secs(5), leader_rx.changed())
            .await
            .unwrap()
            .unwrap();

        node.propose(MaxVolumeIdCommand(77)).await.unwrap();
        assert_eq!(node.current_max_volume_id(), 77);

        node.propose(MaxVolumeIdCommand(10)).await.unwrap();
        assert_eq!(node.current_max_volume_id(), 77, "counter must never regress");
    }
}
