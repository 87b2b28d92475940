//! Local media and data-channel resources
//!
//! The [`LocalResourceManager`] keeps the local participant's streams and
//! channel definitions and replicates them onto every session. Sessions
//! that already have a transport handle are updated right away; sessions
//! created later pick everything up when their handle is created.
//!
//! Track changes on a session produce a [`ResourceEvent::Changed`], which
//! the negotiation engine turns into a resource-only renegotiation.
//! Channel changes never renegotiate by themselves.

use super::channel::DataChannel;
use super::track::{MediaStream, MediaTrack, TrackConstraint, TrackKind};
use crate::config::DataChannelConfig;
use crate::events::{EventHub, MeshEvent};
use crate::session::{PeerSession, PeerSessionStore};
use crate::transport::ChannelHandle;
use crate::{Error, Result};
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Notification that a session's local tracks changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    /// Tracks were attached to or detached from this session's handle
    Changed {
        /// Remote peer id
        peer_id: String,
    },
}

impl ResourceEvent {
    /// Session the event is about
    pub fn peer_id(&self) -> &str {
        match self {
            ResourceEvent::Changed { peer_id } => peer_id,
        }
    }
}

/// Per-session outcome of a fan-out, reported once
pub(crate) struct FanoutReport {
    operation: &'static str,
    total: usize,
    failures: Vec<(String, Error)>,
}

impl FanoutReport {
    pub(crate) fn new(operation: &'static str) -> Self {
        Self {
            operation,
            total: 0,
            failures: Vec::new(),
        }
    }

    pub(crate) fn record<T>(&mut self, peer_id: &str, result: Result<T>) {
        self.total += 1;
        if let Err(e) = result {
            warn!("{} failed for {}: {}", self.operation, peer_id, e);
            self.failures.push((peer_id.to_string(), e));
        }
    }

    pub(crate) fn into_error(self) -> Option<Error> {
        let failed = self.failures.len();
        let (peer_id, first) = self.failures.into_iter().next()?;
        Some(Error::Fanout {
            operation: self.operation,
            failed,
            total: self.total,
            first: format!("{}: {}", peer_id, first),
        })
    }

    /// Emit one aggregated error event if anything failed
    pub(crate) fn report(self, hub: &EventHub) {
        if let Some(err) = self.into_error() {
            hub.emit(&MeshEvent::error(None, err));
        }
    }
}

#[derive(Default)]
struct ResourceState {
    streams: Vec<MediaStream>,
    /// Channel definitions in registration order
    channels: Vec<(String, DataChannelConfig)>,
}

/// Local tracks and channel definitions shared by every session
pub struct LocalResourceManager {
    state: RwLock<ResourceState>,
    store: Arc<PeerSessionStore>,
    hub: Arc<EventHub>,
    changes: mpsc::UnboundedSender<ResourceEvent>,
}

impl LocalResourceManager {
    /// Create a manager; `changes` receives per-session change events
    pub fn new(
        store: Arc<PeerSessionStore>,
        hub: Arc<EventHub>,
        changes: mpsc::UnboundedSender<ResourceEvent>,
    ) -> Self {
        Self {
            state: RwLock::new(ResourceState::default()),
            store,
            hub,
            changes,
        }
    }

    /// Recorded local streams
    pub fn streams(&self) -> Vec<MediaStream> {
        self.state.read().streams.clone()
    }

    /// Registered channel definitions, in registration order
    pub fn channel_definitions(&self) -> Vec<(String, DataChannelConfig)> {
        self.state.read().channels.clone()
    }

    /// Aggregate handle for a registered channel
    pub fn data_channel(&self, label: &str) -> Option<DataChannel> {
        self.state
            .read()
            .channels
            .iter()
            .find(|(l, _)| l == label)
            .map(|(l, config)| DataChannel::new(l.clone(), config.clone(), self.store.clone()))
    }

    fn is_registered(&self, label: &str) -> bool {
        self.state.read().channels.iter().any(|(l, _)| l == label)
    }

    fn all_tracks(&self) -> Vec<(String, MediaTrack)> {
        self.state
            .read()
            .streams
            .iter()
            .flat_map(|s| s.tracks.iter().map(|t| (s.id.clone(), t.clone())))
            .collect()
    }

    fn notify_changed(&self, session: &PeerSession) {
        let _ = self.changes.send(ResourceEvent::Changed {
            peer_id: session.peer_id().to_string(),
        });
    }

    /// Add a local stream
    ///
    /// Idempotent: a track already attached to a session is not attached
    /// again, and adding the same stream twice changes nothing. Failures on
    /// individual sessions are reported once as an aggregated error event.
    pub async fn add_stream(&self, stream: MediaStream) -> Result<()> {
        let first_time = {
            let mut state = self.state.write();
            match state.streams.iter().position(|s| s.id == stream.id) {
                Some(index) => {
                    for track in &stream.tracks {
                        state.streams[index].add_track(track.clone());
                    }
                    false
                }
                None => {
                    state.streams.push(stream.clone());
                    true
                }
            }
        };

        if first_time {
            info!(
                "Recorded local stream {} with {} tracks",
                stream.id,
                stream.tracks.len()
            );
            self.hub.emit(&MeshEvent::LocalStream {
                stream_id: stream.id.clone(),
                kinds: stream.tracks.iter().map(|t| t.kind).collect(),
            });
        }

        let tracks: Vec<(String, MediaTrack)> = stream
            .tracks
            .iter()
            .map(|t| (stream.id.clone(), t.clone()))
            .collect();
        self.fan_out_attach("add_stream", &tracks).await;
        Ok(())
    }

    /// Remove a local stream and detach its tracks from every session.
    /// Returns whether the stream was recorded.
    pub async fn remove_stream(&self, stream_id: &str) -> Result<bool> {
        let removed = {
            let mut state = self.state.write();
            let index = state.streams.iter().position(|s| s.id == stream_id);
            index.map(|i| state.streams.remove(i))
        };

        let Some(stream) = removed else {
            return Ok(false);
        };

        let track_ids: Vec<String> = stream.tracks.iter().map(|t| t.id.clone()).collect();
        self.fan_out_detach("remove_stream", &track_ids).await;
        Ok(true)
    }

    /// Add a track to a recorded stream and attach it to every session
    ///
    /// # Errors
    ///
    /// Returns `MediaTrackError` if `stream_id` was never added.
    pub async fn add_track_to_peers(&self, stream_id: &str, track: MediaTrack) -> Result<()> {
        {
            let mut state = self.state.write();
            let stream = state
                .streams
                .iter_mut()
                .find(|s| s.id == stream_id)
                .ok_or_else(|| {
                    Error::MediaTrackError(format!("Unknown local stream: {}", stream_id))
                })?;
            stream.add_track(track.clone());
        }

        self.fan_out_attach("add_track", &[(stream_id.to_string(), track)])
            .await;
        Ok(())
    }

    /// Detach a track from every session that has a sender for it
    ///
    /// Sessions without such a sender are untouched and do not renegotiate.
    pub async fn remove_track_from_peers(&self, track_id: &str) -> Result<()> {
        {
            let mut state = self.state.write();
            for stream in state.streams.iter_mut() {
                stream.remove_track(track_id);
            }
        }

        self.fan_out_detach("remove_track", &[track_id.to_string()])
            .await;
        Ok(())
    }

    /// Register a channel definition and create an instance on every
    /// session that has a transport handle
    ///
    /// Registering an existing label returns its aggregate unchanged.
    pub async fn create_data_channel(
        &self,
        label: &str,
        config: DataChannelConfig,
    ) -> Result<DataChannel> {
        if label.is_empty() {
            return Err(Error::DataChannelError(
                "Channel label must not be empty".to_string(),
            ));
        }

        {
            let mut state = self.state.write();
            if let Some((_, existing)) = state.channels.iter().find(|(l, _)| l == label) {
                return Ok(DataChannel::new(
                    label.to_string(),
                    existing.clone(),
                    self.store.clone(),
                ));
            }
            state.channels.push((label.to_string(), config.clone()));
        }
        info!("Registered data channel '{}'", label);

        let mut report = FanoutReport::new("create_data_channel");
        for session in self.store.all().await {
            let _gate = session.lock_gate().await;
            let result = self.create_channel_locked(&session, label, &config).await;
            if !matches!(result, Ok(false)) {
                report.record(session.peer_id(), result);
            }
        }
        report.report(&self.hub);

        Ok(DataChannel::new(
            label.to_string(),
            config,
            self.store.clone(),
        ))
    }

    /// Drop a channel definition and close its instances.
    /// Returns whether the label was registered.
    pub async fn remove_data_channel(&self, label: &str) -> Result<bool> {
        let removed = {
            let mut state = self.state.write();
            let before = state.channels.len();
            state.channels.retain(|(l, _)| l != label);
            state.channels.len() != before
        };
        if !removed {
            return Ok(false);
        }

        for session in self.store.all().await {
            let _gate = session.lock_gate().await;
            let instance = session.with_inner(|inner| inner.data_channels.remove(label));
            if let Some(channel) = instance {
                if let Err(e) = channel.close().await {
                    warn!(
                        "Error closing channel '{}' for {}: {}",
                        label,
                        session.peer_id(),
                        e
                    );
                }
            }
        }
        info!("Removed data channel '{}'", label);
        Ok(true)
    }

    /// Apply a constraint to every local track of `kind` on every session
    ///
    /// All applications run, concurrently across sessions. Resolves with
    /// the number applied, or a `Fanout` error carrying the first failure.
    pub async fn apply_constraint(
        &self,
        kind: TrackKind,
        constraint: TrackConstraint,
    ) -> Result<usize> {
        let sessions = self.store.all().await;
        let constraint = &constraint;

        let per_session = join_all(sessions.iter().map(|session| async move {
            let _gate = session.lock_gate().await;
            let mut results = Vec::new();
            if session.is_closed() {
                return results;
            }
            let Some(transport) = session.transport() else {
                return results;
            };
            for sender in transport.senders().await {
                if sender.kind != kind {
                    continue;
                }
                let result = transport.apply_constraint(&sender.track_id, constraint).await;
                results.push((session.peer_id().to_string(), result));
            }
            results
        }))
        .await;

        let mut report = FanoutReport::new("apply_constraint");
        let mut applied = 0;
        for (peer_id, result) in per_session.into_iter().flatten() {
            if result.is_ok() {
                applied += 1;
            }
            report.record(&peer_id, result);
        }

        debug!("Applied {} constraint to {} senders", kind, applied);
        match report.into_error() {
            Some(err) => Err(err),
            None => Ok(applied),
        }
    }

    /// Attach every recorded track the session does not have yet.
    /// The caller holds the session gate. Returns how many were attached.
    pub(crate) async fn attach_local_resources(&self, session: &PeerSession) -> Result<usize> {
        let tracks = self.all_tracks();
        self.attach_locked(session, &tracks).await
    }

    /// Create an instance of every registered channel the session lacks.
    /// The caller holds the session gate.
    pub(crate) async fn replay_channels(&self, session: &PeerSession) -> Result<()> {
        let definitions = self.channel_definitions();
        let mut report = FanoutReport::new("replay_channels");
        for (label, config) in definitions {
            let result = self.create_channel_locked(session, &label, &config).await;
            if result.is_err() {
                report.record(session.peer_id(), result);
            }
        }
        match report.into_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Adopt a channel the remote peer opened, if its label is registered
    /// and the session has no instance yet
    pub(crate) fn adopt_remote_channel(
        &self,
        session: &PeerSession,
        channel: Arc<dyn ChannelHandle>,
    ) -> bool {
        let label = channel.label().to_string();
        if !self.is_registered(&label) {
            debug!(
                "Ignoring remote channel '{}' from {}: label not registered",
                label,
                session.peer_id()
            );
            return false;
        }

        session.with_inner(|inner| {
            if inner.data_channels.contains_key(&label) {
                false
            } else {
                inner.data_channels.insert(label, channel);
                true
            }
        })
    }

    async fn attach_locked(
        &self,
        session: &PeerSession,
        tracks: &[(String, MediaTrack)],
    ) -> Result<usize> {
        let Some(transport) = session.transport() else {
            return Ok(0);
        };

        let mut attached = 0;
        for (stream_id, track) in tracks {
            if session.is_closed() {
                return Err(Error::SessionClosed(session.peer_id().to_string()));
            }
            let already = session.with_inner(|inner| inner.attached_tracks.contains(&track.id));
            if already {
                continue;
            }
            transport.add_track(track, stream_id).await?;
            session.with_inner(|inner| inner.attached_tracks.insert(track.id.clone()));
            attached += 1;
        }
        Ok(attached)
    }

    /// `Ok(true)` if an instance was created, `Ok(false)` if none was needed
    async fn create_channel_locked(
        &self,
        session: &PeerSession,
        label: &str,
        config: &DataChannelConfig,
    ) -> Result<bool> {
        if session.is_closed() {
            return Ok(false);
        }
        let Some(transport) = session.transport() else {
            return Ok(false);
        };
        if session.data_channel(label).is_some() || !self.is_registered(label) {
            return Ok(false);
        }

        let channel = transport.create_data_channel(label, config).await?;
        session.with_inner(|inner| {
            inner.data_channels.insert(label.to_string(), channel);
        });
        debug!("Created channel '{}' for {}", label, session.peer_id());
        Ok(true)
    }

    async fn fan_out_attach(&self, operation: &'static str, tracks: &[(String, MediaTrack)]) {
        let mut report = FanoutReport::new(operation);
        for session in self.store.all().await {
            let _gate = session.lock_gate().await;
            if session.is_closed() {
                continue;
            }
            let result = self.attach_locked(&session, tracks).await;
            if let Ok(gained) = &result {
                if *gained > 0 {
                    self.notify_changed(&session);
                }
            }
            report.record(session.peer_id(), result);
        }
        report.report(&self.hub);
    }

    async fn fan_out_detach(&self, operation: &'static str, track_ids: &[String]) {
        let mut report = FanoutReport::new(operation);
        for session in self.store.all().await {
            let _gate = session.lock_gate().await;
            if session.is_closed() {
                continue;
            }
            let Some(transport) = session.transport() else {
                continue;
            };

            let mut removed_any = false;
            for track_id in track_ids {
                let attached = session.with_inner(|inner| inner.attached_tracks.contains(track_id));
                if !attached {
                    continue;
                }
                let result = transport.remove_track(track_id).await;
                if result.is_ok() {
                    session.with_inner(|inner| inner.attached_tracks.remove(track_id));
                    removed_any = true;
                }
                report.record(session.peer_id(), result);
            }

            if removed_any {
                self.notify_changed(&session);
            }
        }
        report.report(&self.hub);
    }
}
