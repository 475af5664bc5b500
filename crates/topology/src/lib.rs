pub mod grower;
pub mod layout;
pub mod tree;

pub use grower::{GrowRequest, GrowerHandle};
pub use layout::{LayoutKey, VolumeLayout};
pub use tree::{Capacity, DataNodeId, DataNodeSummary, DcId, NodeLocation, RackId, Topology};
