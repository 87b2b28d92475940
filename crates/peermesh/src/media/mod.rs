//! Local media tracks, data channels and their replication onto sessions

pub mod channel;
pub mod resources;
pub mod track;

pub use channel::DataChannel;
pub use resources::{LocalResourceManager, ResourceEvent};
pub use track::{MediaStream, MediaTrack, TrackConstraint, TrackKind};
