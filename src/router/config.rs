//! Router configuration

use std::collections::BTreeSet;

use crate::ingest::TranscoderConfig;
use crate::protocol::MessageKind;

/// Which deployment of the signaling protocol to serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingProfile {
    /// Publishers, viewers and named peers on one endpoint
    Multiplexed,
    /// Anonymous peers only, identified by server-assigned IDs
    PeerOnly,
}

impl SignalingProfile {
    /// Message kinds served by this profile
    pub fn default_kinds(&self) -> &'static [MessageKind] {
        match self {
            SignalingProfile::Multiplexed => &[
                MessageKind::Register,
                MessageKind::ViewerJoin,
                MessageKind::Offer,
                MessageKind::Answer,
                MessageKind::IceCandidate,
                MessageKind::StartStream,
                MessageKind::StreamData,
                MessageKind::StopStream,
                MessageKind::Leave,
            ],
            SignalingProfile::PeerOnly => &[
                MessageKind::Join,
                MessageKind::Offer,
                MessageKind::Answer,
                MessageKind::IceCandidate,
                MessageKind::Leave,
            ],
        }
    }

    /// Whether forwarded signaling frames also carry the sender in `userId`
    pub fn echoes_user_id(&self) -> bool {
        matches!(self, SignalingProfile::PeerOnly)
    }
}

/// Router configuration options
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Deployment profile
    pub profile: SignalingProfile,

    /// Message kinds accepted from clients
    pub enabled: BTreeSet<MessageKind>,

    /// Transcoder launch settings for publishers
    pub transcoder: TranscoderConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::for_profile(SignalingProfile::Multiplexed)
    }
}

impl RouterConfig {
    /// Create a config with the profile's default message kinds
    pub fn for_profile(profile: SignalingProfile) -> Self {
        Self {
            profile,
            enabled: profile.default_kinds().iter().copied().collect(),
            transcoder: TranscoderConfig::default(),
        }
    }

    /// Accept a message kind
    pub fn enable(mut self, kind: MessageKind) -> Self {
        self.enabled.insert(kind);
        self
    }

    /// Reject a message kind
    pub fn disable(mut self, kind: MessageKind) -> Self {
        self.enabled.remove(&kind);
        self
    }

    /// Set transcoder config
    pub fn transcoder(mut self, transcoder: TranscoderConfig) -> Self {
        self.transcoder = transcoder;
        self
    }

    /// Check if a message kind is accepted
    pub fn is_enabled(&self, kind: MessageKind) -> bool {
        self.enabled.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiplexed_defaults() {
        let config = RouterConfig::default();

        assert_eq!(config.profile, SignalingProfile::Multiplexed);
        assert!(config.is_enabled(MessageKind::Register));
        assert!(config.is_enabled(MessageKind::StreamData));
        assert!(!config.is_enabled(MessageKind::Join));
        assert!(!config.profile.echoes_user_id());
    }

    #[test]
    fn test_peer_only_defaults() {
        let config = RouterConfig::for_profile(SignalingProfile::PeerOnly);

        assert!(config.is_enabled(MessageKind::Join));
        assert!(config.is_enabled(MessageKind::IceCandidate));
        assert!(!config.is_enabled(MessageKind::Register));
        assert!(!config.is_enabled(MessageKind::StartStream));
        assert!(config.profile.echoes_user_id());
    }

    #[test]
    fn test_builder_enable_disable() {
        let config = RouterConfig::default()
            .disable(MessageKind::StartStream)
            .enable(MessageKind::Join);

        assert!(!config.is_enabled(MessageKind::StartStream));
        assert!(config.is_enabled(MessageKind::Join));
    }
}
