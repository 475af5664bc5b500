//! Generated gRPC client/server stubs for the master and volume-server
//! RPC surface, plus thin conversions between the wire types and the
//! domain types in `common`/`topology`/`needle-store`.

pub mod storagecore {
    tonic::include_proto!("storagecore");
}

mod convert;

pub use storagecore::master_client::MasterClient as MasterServiceClient;
pub use storagecore::master_server::{Master, MasterServer};
pub use storagecore::volume_server_client::VolumeServerClient as VolumeServiceClient;
pub use storagecore::volume_server_server::{VolumeServer as VolumeServerRpc, VolumeServerServer};

pub use storagecore::*;
