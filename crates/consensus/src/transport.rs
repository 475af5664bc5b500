//! Outbound raft message delivery. The node driver hands every outbound
//! `raft::prelude::Message` to a `RaftTransport`; implementations are
//! expected to deliver it over the `RaftStep` unary RPC shared with the
//! rest of the master-to-master surface and to swallow delivery failures,
//! since raft's own election and heartbeat timers already handle retry.

use raft::prelude::Message;

#[async_trait::async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn send(&self, to: u64, message: Message);
}

/// Transport that drops every message; useful for single-node tests where
/// no peer will ever receive anything.
pub struct NullTransport;

#[async_trait::async_trait]
impl RaftTransport for NullTransport {
    async fn send(&self, _to: u64, _message: Message) {}
}
