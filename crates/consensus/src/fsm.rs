//! The replicated state machine: a single `maxVolumeId` counter, plus the
//! snapshot/restore pair a raft log needs to ship it to a lagging or new
//! follower.

use std::sync::atomic::{AtomicU32, Ordering};

/// Command proposed through the raft log. Encoded as 4 little-endian
/// bytes on the wire, decoded by [`Fsm::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxVolumeIdCommand(pub u32);

impl MaxVolumeIdCommand {
    pub fn encode(self) -> Vec<u8> {
        self.0.to_le_bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let arr: [u8; 4] = data.try_into().ok()?;
        Some(Self(u32::from_le_bytes(arr)))
    }
}

/// The entirety of the replicated application state. Applying a command
/// never decreases the counter, which is what lets volume-ID allocation
/// survive a leader change without a new leader ever reissuing an ID a
/// prior leader already handed out.
#[derive(Debug, Default)]
pub struct Fsm {
    max_volume_id: AtomicU32,
}

impl Fsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a committed `MaxVolumeIdCommand`, returning the counter's
    /// value after the update.
    pub fn apply(&self, cmd: MaxVolumeIdCommand) -> u32 {
        self.max_volume_id.fetch_max(cmd.0, Ordering::SeqCst);
        self.max_volume_id.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> u32 {
        self.max_volume_id.load(Ordering::SeqCst)
    }

    /// Entire replicated state as bytes, for a raft snapshot payload.
    pub fn snapshot(&self) -> Vec<u8> {
        self.current().to_le_bytes().to_vec()
    }

    /// Installs state shipped by a snapshot.
    pub fn restore(&self, data: &[u8]) {
        if data.len() >= 4 {
            let mut arr = [0u8; 4];
            arr.copy_from_slice(&data[0..4]);
            self.max_volume_id.store(u32::from_le_bytes(arr), Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_is_monotone() {
        let fsm = Fsm::new();
        assert_eq!(fsm.apply(MaxVolumeIdCommand(5)), 5);
        assert_eq!(fsm.apply(MaxVolumeIdCommand(3)), 5);
        assert_eq!(fsm.apply(MaxVolumeIdCommand(9)), 9);
    }

    #[test]
    fn snapshot_restore_round_trips() {
        let fsm = Fsm::new();
        fsm.apply(MaxVolumeIdCommand(42));
        let snap = fsm.snapshot();

        let restored = Fsm::new();
        restored.restore(&snap);
        assert_eq!(restored.current(), 42);
    }

    #[test]
    fn command_encode_decode_round_trips() {
        let cmd = MaxVolumeIdCommand(123_456);
        assert_eq!(MaxVolumeIdCommand::decode(&cmd.encode()), Some(cmd));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert_eq!(MaxVolumeIdCommand::decode(&[1, 2, 3]), None);
    }
}
