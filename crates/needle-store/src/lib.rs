pub mod codec;
pub mod disk_location;
pub mod index;
pub mod volume;

pub use codec::{DecodedNeedle, Needle, SuperBlock};
pub use disk_location::{DiskLocation, DiskLocationOptions};
pub use index::{IndexEntry, InMemoryIndex, NeedleIndex, OnDiskIndex};
pub use volume::{ReadResult, Volume, VolumeOptions, WriteResult};
