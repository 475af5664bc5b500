//! Implements the `Assign` (file-id allocation) algorithm from §4.3:
//! resolve the `VolumeLayout` for the requested `(collection, replication,
//! ttl, disk_type)` tuple, ask the grower for a fresh volume when nothing
//! writable is left (or free space has run low), then weighted-pick one
//! writable volume and resolve its current replica set.

use common::{Collection, CommonError, Cookie, DiskType, ReplicaPlacement, Ttl, VolumeId};
use rpc::AssignRequest;
use topology::{LayoutKey, NodeLocation};

use crate::state::MasterState;

/// Data center / rack request hints are accepted for wire compatibility
/// but not yet applied as a placement filter: `VolumeLayout` tracks free
/// bytes per volume, not per-volume location, so honoring them would need
/// a location-aware writable index. Until then every writable volume in
/// the layout is an equally eligible candidate regardless of where the
/// caller asked to land.
pub async fn assign_one(
    state: &MasterState,
    req: &AssignRequest,
) -> Result<(VolumeId, Cookie, Vec<NodeLocation>), CommonError> {
    state.require_leader()?;

    let replication: ReplicaPlacement = if req.replication.is_empty() {
        state.config.default_replication.parse()?
    } else {
        req.replication.parse()?
    };
    let disk_type: DiskType = req.disk_type.parse()?;
    let key: LayoutKey = (
        Collection(req.collection.clone()),
        replication,
        Ttl(req.ttl_minutes as u32 * 60),
        disk_type,
    );

    let layout = state.layout_for(&key);
    if !layout.has_writable() || layout.below_free_fraction(state.config.grow_free_fraction) {
        // A concurrent assign may have already grown a volume by the time
        // this one's grow request is served; `request_grow` still
        // succeeds (it just returns the id some other request is also
        // about to use), so we always re-check `pick_writable` below
        // rather than trusting the grow result directly.
        let _ = state.grower.request_grow(key.clone()).await;
    }

    let vid = layout.pick_writable().ok_or_else(|| CommonError::NoWritableVolume {
        collection: key.0.to_string(),
        replication: key.1.to_string(),
    })?;

    let mut replicas = state.topology.locate_volume_nodes(vid);
    if replicas.is_empty() {
        replicas = state.pending_replicas.get(&vid).map(|r| r.value().clone()).unwrap_or_default();
    }
    if replicas.is_empty() {
        return Err(CommonError::NoWritableVolume {
            collection: key.0.to_string(),
            replication: key.1.to_string(),
        });
    }

    Ok((vid, Cookie::random(), replicas))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_key_is_built_from_request_fields() {
        let req = AssignRequest {
            count: 1,
            collection: "photos".to_string(),
            replication: "001".to_string(),
            ttl_minutes: 5,
            disk_type: "hdd".to_string(),
            data_center: String::new(),
            rack: String::new(),
        };
        let replication: ReplicaPlacement = req.replication.parse().unwrap();
        let disk_type: DiskType = req.disk_type.parse().unwrap();
        let key: LayoutKey = (Collection(req.collection.clone()), replication, Ttl(req.ttl_minutes as u32 * 60), disk_type);
        assert_eq!(key.0, Collection("photos".to_string()));
        assert_eq!(key.2, Ttl(300));
    }
}
