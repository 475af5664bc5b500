use common::CommonError;
use tokio::sync::{mpsc, oneshot};

use crate::layout::LayoutKey;

/// One request to grow a new writable volume for `key`, queued by `Assign`
/// when the matching [`crate::layout::VolumeLayout`] has no writable
/// volume or is low on free space. `reply` is answered by whichever task
/// owns the grower loop once the new volume id is allocated and created on
/// its chosen replicas (that orchestration needs the consensus and RPC
/// layers, so it lives in the `master` binary; this crate only owns the
/// queue).
pub struct GrowRequest {
    pub key: LayoutKey,
    pub reply: oneshot::Sender<Result<common::VolumeId, CommonError>>,
}

/// Handle used by request-serving tasks (e.g. the `Assign` HTTP/RPC
/// handler) to enqueue growth and await the result without blocking the
/// grower loop itself or any other in-flight request.
#[derive(Clone)]
pub struct GrowerHandle {
    tx: mpsc::Sender<GrowRequest>,
}

impl GrowerHandle {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<GrowRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn request_grow(&self, key: LayoutKey) -> Result<common::VolumeId, CommonError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(GrowRequest { key, reply: reply_tx })
            .await
            .map_err(|_| CommonError::Internal("volume grower task is not running".to_string()))?;
        reply_rx
            .await
            .map_err(|_| CommonError::Internal("volume grower dropped the reply channel".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Collection, DiskType, ReplicaPlacement, Ttl, VolumeId};

    #[tokio::test]
    async fn request_grow_round_trips_through_the_channel() {
        let (handle, mut rx) = GrowerHandle::new(4);
        let key: LayoutKey = (Collection::default(), ReplicaPlacement::NONE, Ttl::NONE, DiskType::Hdd);

        let serving = tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            assert_eq!(req.key, key);
            let _ = req.reply.send(Ok(VolumeId(42)));
        });

        let id = handle.request_grow(key).await.unwrap();
        assert_eq!(id, VolumeId(42));
        serving.await.unwrap();
    }
}
