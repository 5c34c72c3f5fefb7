//! Message router
//!
//! Dispatches each inbound envelope to a registry mutation, a point-to-point
//! forward, a broadcast, or the sender's ingest pipeline. The router is shared
//! by every session task; per-session state travels in [`SessionState`].

pub mod config;

pub use config::{RouterConfig, SignalingProfile};

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ProtocolError;
use crate::ingest::{
    PipelineError, PipelineEvent, PipelineHandle, PipelineState, TerminationReason,
};
use crate::protocol::{Envelope, ErrorCode, ServerMessage, SignalEnvelope};
use crate::registry::{ConnectionInfo, ConnectionRegistry, RegistryError, Role};
use crate::session::SessionState;

/// Roles listed in `users` broadcasts
const CALLABLE: [Role; 2] = [Role::Publisher, Role::Peer];

/// Routes client messages for all sessions
pub struct Router {
    config: RouterConfig,
    registry: Arc<ConnectionRegistry>,
    events: mpsc::UnboundedSender<PipelineEvent>,
}

impl Router {
    /// Create a router with an empty registry
    ///
    /// The receiver carries pipeline terminations and must be handed to
    /// [`Router::spawn_event_task`].
    pub fn new(config: RouterConfig) -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        Self::with_registry(config, Arc::new(ConnectionRegistry::new()))
    }

    /// Create a router over an existing registry
    pub fn with_registry(
        config: RouterConfig,
        registry: Arc<ConnectionRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let router = Self {
            config,
            registry,
            events,
        };
        (router, rx)
    }

    /// Get the router configuration
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Get a reference to the connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Spawn the task that reacts to pipelines ending on their own
    pub fn spawn_event_task(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<PipelineEvent>,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                router.handle_pipeline_event(event).await;
            }
        })
    }

    /// Handle a JSON text frame
    pub async fn handle_text(&self, state: &mut SessionState, text: &str) {
        state.messages_received += 1;

        match Envelope::parse(text) {
            Ok(envelope) => self.dispatch(state, envelope).await,
            Err(e) => self.reject(state, e),
        }
    }

    /// Handle a binary frame as a media chunk
    pub async fn handle_binary(&self, state: &mut SessionState, data: Bytes) {
        state.messages_received += 1;
        self.dispatch(state, Envelope::StreamData(data)).await;
    }

    /// Route a decoded envelope
    pub async fn dispatch(&self, state: &mut SessionState, envelope: Envelope) {
        if state.is_closed() {
            return;
        }

        let kind = envelope.kind();
        if !self.config.is_enabled(kind) {
            return self.reject(state, ProtocolError::Disabled(kind));
        }
        if kind.is_registration() && state.is_registered() {
            self.reply(
                state,
                ServerMessage::error(ErrorCode::AlreadyRegistered, "session is already registered"),
            );
            return self.reject(state, ProtocolError::AlreadyRegistered);
        }
        if !kind.is_registration() && !state.is_registered() {
            return self.reject(state, ProtocolError::NotRegistered(kind));
        }

        match envelope {
            Envelope::Register { identity, role } => self.register(state, identity, role).await,
            Envelope::ViewerJoin { identity } => self.viewer_join(state, identity).await,
            Envelope::Join { display_name } => self.join(state, display_name).await,
            Envelope::Signal(signal) => self.forward(state, signal).await,
            Envelope::StartStream { stream_key } => self.start_stream(state, stream_key).await,
            Envelope::StreamData(chunk) => self.stream_data(state, chunk).await,
            Envelope::StopStream => self.stop_stream(state).await,
            Envelope::Leave => self.close(state).await,
        }
    }

    /// Tear down a session: registry removal, pipeline stop, departure
    /// announcement
    ///
    /// Idempotent; called on `leave` and when the transport closes.
    pub async fn close(&self, state: &mut SessionState) {
        let Some(identity) = state.close() else {
            return;
        };

        if let Some(info) = self.registry.remove(&identity).await {
            tracing::info!(
                session_id = state.id(),
                identity = %identity,
                duration_secs = state.duration().as_secs(),
                "Connection left"
            );
            self.announce_departure(&info).await;
        }
    }

    /// Stop every pipeline and clear the registry
    pub async fn shutdown(&self) {
        let removed = self.registry.clear().await;
        tracing::info!(connections = removed.len(), "Router shut down");
    }

    fn reject(&self, state: &mut SessionState, error: ProtocolError) {
        state.messages_rejected += 1;
        tracing::warn!(
            session_id = state.id(),
            identity = ?state.identity(),
            error = %error,
            "Message rejected"
        );
    }

    fn reply(&self, state: &SessionState, message: ServerMessage) {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session_id = state.id(), error = %e, "Dropping reply");
                return;
            }
        };

        if let Err(e) = state.handle().send(frame) {
            tracing::debug!(session_id = state.id(), error = %e, "Reply not delivered");
        }
    }

    fn reply_registry_error(&self, state: &SessionState, error: RegistryError) {
        tracing::warn!(session_id = state.id(), error = %error, "Registration rejected");

        let code = match error {
            RegistryError::DuplicateIdentity(_) => ErrorCode::DuplicateIdentity,
            RegistryError::InvalidIdentity(_) | RegistryError::NotFound(_) => {
                ErrorCode::InvalidIdentity
            }
        };
        self.reply(state, ServerMessage::error(code, error.to_string()));
    }

    /// Record a registration outcome and answer the sender
    fn admit(
        &self,
        state: &mut SessionState,
        registered: Result<ConnectionInfo, RegistryError>,
    ) -> Option<ConnectionInfo> {
        match registered {
            Ok(info) => {
                state.on_registered(info.identity.clone(), info.role);
                self.reply(
                    state,
                    ServerMessage::Registered {
                        identity: info.identity.clone(),
                        role: info.role,
                    },
                );
                Some(info)
            }
            Err(e) => {
                self.reply_registry_error(state, e);
                None
            }
        }
    }

    async fn register(&self, state: &mut SessionState, identity: String, role: Role) {
        let registered = self
            .registry
            .register(&identity, role, state.handle().clone(), None)
            .await;

        if let Some(info) = self.admit(state, registered) {
            if CALLABLE.contains(&info.role) {
                self.announce_users().await;
            }
        }
    }

    async fn viewer_join(&self, state: &mut SessionState, identity: String) {
        let registered = self
            .registry
            .register(&identity, Role::Viewer, state.handle().clone(), None)
            .await;

        if self.admit(state, registered).is_some() {
            let streams = self.registry.streaming_publishers().await;
            self.reply(state, ServerMessage::StreamInfo { streams });
        }
    }

    async fn join(&self, state: &mut SessionState, display_name: Option<String>) {
        let registered = self
            .registry
            .register_anonymous(state.handle().clone(), display_name)
            .await;

        if let Some(info) = self.admit(state, registered) {
            let message = ServerMessage::UserJoined {
                user_id: info.identity.clone(),
                username: info.display_name.clone(),
            };
            self.registry
                .broadcast(&message, &Role::ALL, Some(&info.identity))
                .await;
        }
    }

    async fn forward(&self, state: &SessionState, signal: SignalEnvelope) {
        let Some(from) = state.identity() else {
            return;
        };

        let Some(target) = self.registry.find(&signal.to).await else {
            tracing::debug!(
                from = %from,
                to = %signal.to,
                kind = %signal.kind.message_kind(),
                "Signal target not found, dropping"
            );
            return;
        };

        let frame = match signal.to_frame(from, self.config.profile.echoes_user_id()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(from = %from, error = %e, "Failed to encode signal");
                return;
            }
        };

        match target.session.send(frame.into()) {
            Ok(()) => tracing::trace!(
                from = %from,
                to = %target.identity,
                kind = %signal.kind.message_kind(),
                "Signal forwarded"
            ),
            Err(e) => tracing::debug!(
                from = %from,
                to = %target.identity,
                error = %e,
                "Signal not delivered"
            ),
        }
    }

    async fn start_stream(&self, state: &SessionState, stream_key: Option<String>) {
        let Some(identity) = state.identity() else {
            return;
        };

        if state.role != Some(Role::Publisher) {
            self.reply(
                state,
                ServerMessage::error(ErrorCode::NotAPublisher, "only publishers can stream"),
            );
            return;
        }

        // Never two processes for one identity: the old one is reaped first.
        let superseded = match self.registry.take_pipeline(identity).await {
            Some(old) => {
                tracing::info!(
                    identity = %identity,
                    pipeline_id = old.id(),
                    "Superseding running pipeline"
                );
                old.stop().await;
                true
            }
            None => false,
        };

        let stream_key = stream_key.unwrap_or_else(|| identity.to_string());
        let pipeline = match PipelineHandle::spawn(
            identity,
            &stream_key,
            &self.config.transcoder,
            self.events.clone(),
        )
        .await
        {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.reply(state, ServerMessage::StreamError { message: e.to_string() });
                if superseded {
                    self.announce_streams().await;
                }
                return;
            }
        };

        // Must precede attach: a crash report can only follow it.
        self.reply(state, ServerMessage::StreamStarted { stream_key });

        match self.registry.attach_pipeline(identity, pipeline.clone()).await {
            Ok(Some(displaced)) => {
                displaced.stop().await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(identity = %identity, error = %e, "Publisher left during start");
                pipeline.stop().await;
                return;
            }
        }

        self.announce_streams().await;

        // The event for a process that died before it was attached found
        // nothing to detach.
        if pipeline.state() == PipelineState::Terminated {
            let reason = pipeline.terminated().await;
            if reason.is_unexpected() {
                self.pipeline_failed(identity, pipeline.id(), reason).await;
            }
        }
    }

    async fn stream_data(&self, state: &SessionState, chunk: Bytes) {
        let Some(identity) = state.identity() else {
            return;
        };

        // Cloned out so backpressure never holds the registry lock.
        let Some(pipeline) = self.registry.pipeline(identity).await else {
            tracing::debug!(
                identity = %identity,
                bytes = chunk.len(),
                "No active pipeline, dropping chunk"
            );
            return;
        };

        match pipeline.submit_with_backpressure(chunk).await {
            Ok(()) => {}
            Err(PipelineError::NotActive) => {
                tracing::debug!(identity = %identity, "Pipeline not active, dropping chunk");
            }
            Err(e) => {
                tracing::warn!(
                    identity = %identity,
                    pipeline_id = pipeline.id(),
                    error = %e,
                    "Tearing down stalled pipeline"
                );
                self.registry.detach_pipeline(identity, pipeline.id()).await;
                pipeline.stop().await;
                self.reply(state, ServerMessage::StreamError { message: e.to_string() });
                self.announce_streams().await;
            }
        }
    }

    async fn stop_stream(&self, state: &SessionState) {
        let Some(identity) = state.identity() else {
            return;
        };

        let Some(pipeline) = self.registry.take_pipeline(identity).await else {
            tracing::debug!(identity = %identity, "stop-stream without a pipeline");
            return;
        };

        let reason = pipeline.stop().await;
        tracing::info!(identity = %identity, reason = %reason, "Stream stopped");

        self.reply(state, ServerMessage::StreamStopped {});
        self.announce_streams().await;
    }

    async fn handle_pipeline_event(&self, event: PipelineEvent) {
        let PipelineEvent::Terminated {
            identity,
            pipeline_id,
            reason,
        } = event;

        if reason.is_unexpected() {
            self.pipeline_failed(&identity, pipeline_id, reason).await;
        }
    }

    /// Release a pipeline that died on its own and tell its publisher
    async fn pipeline_failed(&self, identity: &str, pipeline_id: u64, reason: TerminationReason) {
        // Already replaced, stopped or reported
        if self
            .registry
            .detach_pipeline(identity, pipeline_id)
            .await
            .is_none()
        {
            return;
        }

        if let Some(publisher) = self.registry.find(identity).await {
            let message = ServerMessage::StreamError {
                message: reason.to_string(),
            };
            match message.to_frame() {
                Ok(frame) => {
                    let _ = publisher.session.send(frame);
                }
                Err(e) => tracing::warn!(error = %e, "Dropping stream error"),
            }
        }

        self.announce_streams().await;
    }

    async fn announce_users(&self) {
        let users = self.registry.list_partitions(&CALLABLE).await;
        self.registry
            .broadcast(&ServerMessage::Users { users }, &Role::ALL, None)
            .await;
    }

    async fn announce_streams(&self) {
        let streams = self.registry.streaming_publishers().await;
        self.registry
            .broadcast(&ServerMessage::StreamInfo { streams }, &[Role::Viewer], None)
            .await;
    }

    async fn announce_departure(&self, info: &ConnectionInfo) {
        if info.anonymous {
            let message = ServerMessage::UserLeft {
                user_id: info.identity.clone(),
            };
            self.registry.broadcast(&message, &Role::ALL, None).await;
        } else {
            if CALLABLE.contains(&info.role) {
                self.announce_users().await;
            }
            let message = ServerMessage::UserDisconnected {
                username: info.identity.clone(),
            };
            self.registry.broadcast(&message, &Role::ALL, None).await;
        }

        if info.streaming {
            self.announce_streams().await;
        }
    }
}
