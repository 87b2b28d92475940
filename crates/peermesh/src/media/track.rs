//! Local media descriptions shared by every session

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// A locally contributed media track
///
/// The track is a description only; the Transport Engine owns whatever
/// produces its samples.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaTrack {
    /// Track identifier, unique per local participant
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
}

impl MediaTrack {
    /// Create an audio track description
    pub fn audio(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Audio,
        }
    }

    /// Create a video track description
    pub fn video(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Video,
        }
    }
}

/// A set of tracks contributed together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    /// Stream identifier
    pub id: String,
    /// Tracks in attach order
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Create an empty stream
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Builder-style track insertion
    pub fn with_track(mut self, track: MediaTrack) -> Self {
        self.add_track(track);
        self
    }

    /// Insert a track unless one with the same id is present.
    /// Returns `true` if the track was added.
    pub fn add_track(&mut self, track: MediaTrack) -> bool {
        if self.contains(&track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Remove a track by id
    pub fn remove_track(&mut self, track_id: &str) -> Option<MediaTrack> {
        let index = self.tracks.iter().position(|t| t.id == track_id)?;
        Some(self.tracks.remove(index))
    }

    /// Whether the stream holds a track with this id
    pub fn contains(&self, track_id: &str) -> bool {
        self.tracks.iter().any(|t| t.id == track_id)
    }
}

/// Device/quality constraint applied to a local track
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConstraint {
    /// Capture width in pixels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Capture height in pixels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Frames per second
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,
    /// Upper bound for the encoder bitrate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bitrate_kbps: Option<u32>,
    /// Capture device to switch to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl TrackConstraint {
    /// True when no field is set
    pub fn is_empty(&self) -> bool {
        self.width.is_none()
            && self.height.is_none()
            && self.frame_rate.is_none()
            && self.max_bitrate_kbps.is_none()
            && self.device_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_track_dedup() {
        let mut stream = MediaStream::new("cam").with_track(MediaTrack::video("v1"));
        assert!(!stream.add_track(MediaTrack::video("v1")));
        assert!(stream.add_track(MediaTrack::audio("a1")));
        assert_eq!(stream.tracks.len(), 2);

        assert_eq!(stream.remove_track("v1"), Some(MediaTrack::video("v1")));
        assert!(!stream.contains("v1"));
        assert_eq!(stream.remove_track("v1"), None);
    }

    #[test]
    fn test_constraint_is_empty() {
        assert!(TrackConstraint::default().is_empty());
        let c = TrackConstraint {
            frame_rate: Some(15.0),
            ..Default::default()
        };
        assert!(!c.is_empty());
    }

    #[test]
    fn test_track_kind_display() {
        assert_eq!(TrackKind::Audio.to_string(), "audio");
        assert_eq!(TrackKind::Video.to_string(), "video");
    }
}
