use serde::{Deserialize, Serialize};

use crate::types::{
    ConnectionId, ConsumerId, ConsumerParameters, DtlsParameters, ErrorPayload, MediaKind,
    ProducerId, RtpCapabilities, RtpParameters, TransportDirection, TransportId,
    TransportOptions,
};

/// A client frame: an optional correlation id plus the request itself.
///
/// Requests sent without a `request_id` are still processed, but their
/// replies are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub request: ClientRequest,
}

impl ClientEnvelope {
    pub fn new(request_id: u64, request: ClientRequest) -> Self {
        Self {
            request_id: Some(request_id),
            request,
        }
    }
}

/// Messages sent from client to server via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Join (or lazily create) a room
    JoinRoom {
        room_name: String,
        #[serde(default)]
        display_name: Option<String>,
    },

    /// Create a send-side or receive-side transport
    CreateTransport { direction: TransportDirection },

    /// Complete the handshake of the send transport
    ConnectTransport {
        #[serde(default)]
        transport_id: Option<TransportId>,
        dtls_parameters: DtlsParameters,
    },

    /// Start producing media on the send transport
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    /// Complete the handshake of a receive transport
    ConnectRecvTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },

    /// Consume a remote producer on a receive transport
    Consume {
        rtp_capabilities: RtpCapabilities,
        producer_id: ProducerId,
        transport_id: TransportId,
    },

    /// Let a paused consumer start flowing
    ResumeConsumer { consumer_id: ConsumerId },

    /// List producers of other peers in the room
    ListProducers,

    /// Ping to keep connection alive
    Ping,
}

impl ClientRequest {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::JoinRoom { .. } => "join_room",
            ClientRequest::CreateTransport { .. } => "create_transport",
            ClientRequest::ConnectTransport { .. } => "connect_transport",
            ClientRequest::Produce { .. } => "produce",
            ClientRequest::ConnectRecvTransport { .. } => "connect_recv_transport",
            ClientRequest::Consume { .. } => "consume",
            ClientRequest::ResumeConsumer { .. } => "resume_consumer",
            ClientRequest::ListProducers => "list_producers",
            ClientRequest::Ping => "ping",
        }
    }
}

/// Successful reply to a client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    RoomJoined { rtp_capabilities: RtpCapabilities },
    TransportCreated { params: TransportOptions },
    Produced {
        producer_id: ProducerId,
        other_producers_exist: bool,
    },
    Consumed { params: ConsumerParameters },
    Producers { producer_ids: Vec<ProducerId> },
    Ack,
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once when the socket is accepted
    Connected { connection_id: ConnectionId },

    /// Successful reply correlated to a request
    Response { request_id: u64, result: Reply },

    /// Failed request, or a frame that could not be parsed
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        error: ErrorPayload,
    },

    /// Another peer in the room started producing
    NewProducer {
        producer_id: ProducerId,
        kind: MediaKind,
    },

    /// A producer this peer consumes has gone away
    ProducerClosed { producer_id: ProducerId },

    /// Pong response to ping
    Pong,
}
