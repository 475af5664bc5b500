//! Replicated `maxVolumeId` counter and master membership, per the
//! master consensus surface: only the volume-ID high-water mark and the
//! current set of master peers are replicated by consensus. All other
//! placement state lives in memory on the leader and is rebuilt from
//! volume-server heartbeats after an election.
//!
//! Built as a thin driver around `tikv/raft-rs`'s `RawNode`, so the FSM
//! contract (`apply`/`snapshot`/`restore`/`leader`/`add_voter`
//! /`remove_server`/`leader_change_channel`) is satisfied by
//! [`node::ConsensusNode`] without this crate having to implement a log
//! or election protocol itself.

mod fsm;
mod node;
mod transport;

pub use fsm::{Fsm, MaxVolumeIdCommand};
pub use node::ConsensusNode;
pub use transport::{NullTransport, RaftTransport};

pub use raft::prelude::Message as RaftMessage;
