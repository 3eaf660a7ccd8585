//! Media routing engine capabilities
//!
//! The coordinator never touches RTP, ICE or DTLS itself. Everything it needs
//! from the media engine goes through the traits in this module: routers
//! (one per room), transports, producers and consumers. Handles are shared
//! `Arc<dyn ...>` objects whose `close()` is idempotent and which report
//! lifecycle changes through registered callbacks.

mod deadline;
pub mod loopback;

pub use deadline::{with_deadline, EngineCallError};

use anyhow::Result;
use async_trait::async_trait;
use huddle_protocol::{
    ConsumerId, DtlsParameters, MediaKind, ProducerId, RouterId, RtpCapabilities,
    RtpParameters, TransportId, TransportOptions,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Callback fired at most once when a lifecycle event happens
pub type LifecycleCallback = Box<dyn FnOnce() + Send + 'static>;

/// Overall state of the media engine process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineHealth {
    Alive,
    Died(String),
}

/// A codec the routers of this process accept
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCodec {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// Opus for audio and VP8 for video
pub fn default_media_codecs() -> Vec<MediaCodec> {
    let mut vp8_parameters = serde_json::Map::new();
    vp8_parameters.insert("x-google-start-bitrate".to_string(), 1000.into());

    vec![
        MediaCodec {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: serde_json::Map::new(),
        },
        MediaCodec {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: vp8_parameters,
        },
    ]
}

/// Network settings used for every transport the coordinator creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: Some("127.0.0.1".to_string()),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

#[async_trait]
pub trait RoutingEngine: Send + Sync {
    /// Create the routing context for a new room
    async fn create_router(&self, codecs: &[MediaCodec]) -> Result<Arc<dyn RoutingContext>>;

    /// Watch the engine's health. `Died` is terminal.
    fn health(&self) -> watch::Receiver<EngineHealth>;
}

#[async_trait]
pub trait RoutingContext: Send + Sync {
    fn id(&self) -> RouterId;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(&self, config: &TransportConfig) -> Result<Arc<dyn TransportHandle>>;

    /// Whether a device with `capabilities` can receive `producer_id`
    fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool;
}

#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn id(&self) -> TransportId;

    fn options(&self) -> TransportOptions;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn ProducerHandle>>;

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn ConsumerHandle>>;

    fn close(&self);

    /// Fires when the transport closes for any reason, including a failed
    /// DTLS handshake.
    fn on_closed(&self, callback: LifecycleCallback);
}

pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn close(&self);

    fn on_closed(&self, callback: LifecycleCallback);
}

#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    async fn resume(&self) -> Result<()>;

    fn close(&self);

    /// Fires when the consumed producer closes
    fn on_producer_closed(&self, callback: LifecycleCallback);
}
