//! Shared master-client used by every non-master process (filer, volume
//! server, gateway) to keep exactly one `KeepConnected` stream open to
//! the current leader and resolve file IDs to replica URLs.

mod client;
mod vid_map;

pub use client::{MasterClient, MasterClientIdentity};
pub use vid_map::{VidMap, VidMapHistory, DEFAULT_HISTORY_DEPTH};
