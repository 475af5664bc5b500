use common::VolumeId;

use crate::storagecore::{Location, VolumeLocation};

/// Assembles the wire `VolumeLocation` for one volume id out of replica
/// URLs the caller already resolved through `topology`.
pub fn volume_location(vid: VolumeId, replicas: impl IntoIterator<Item = Location>) -> VolumeLocation {
    VolumeLocation {
        vid: vid.0,
        locations: replicas.into_iter().collect(),
    }
}

impl Location {
    pub fn new(url: impl Into<String>, public_url: impl Into<String>, data_center: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            public_url: public_url.into(),
            data_center: data_center.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_location_carries_vid_through() {
        let loc = volume_location(
            VolumeId(7),
            vec![Location::new("10.0.0.1:8080", "files.example:8080", "dc1")],
        );
        assert_eq!(loc.vid, 7);
        assert_eq!(loc.locations.len(), 1);
    }
}
