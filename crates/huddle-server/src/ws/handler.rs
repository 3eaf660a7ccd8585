use crate::error::SessionError;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{ClientEnvelope, ClientRequest, ConnectionId, ServerMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = ConnectionId::new();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let connection = match state.coordinator.connect(connection_id, tx).await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::error!("Failed to register connection {}: {}", connection_id, e);
            return;
        }
    };
    let cancel = connection.cancel;

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Read frames on their own task so a close is noticed while a request
    // is still being processed.
    let (frames_tx, mut frames) = mpsc::unbounded_channel::<String>();
    let reader_cancel = cancel.clone();
    let read_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if frames_tx.send(text.as_str().to_owned()).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::warn!("WebSocket error for connection {}: {}", connection_id, e);
                    break;
                }
                _ => {}
            }
        }
        reader_cancel.cancel();
    });

    // Requests from one connection run strictly in arrival order
    loop {
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(text) => text,
                None => break,
            },
        };

        handle_frame(&state, connection_id, &cancel, &text).await;
    }

    read_task.abort();
    state.coordinator.disconnect(connection_id).await;
    send_task.abort();

    tracing::info!("Connection {} closed its signaling channel", connection_id);
}

async fn handle_frame(
    state: &AppState,
    connection_id: ConnectionId,
    cancel: &CancellationToken,
    text: &str,
) {
    let envelope: ClientEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Invalid message from {}: {}", connection_id, e);
            let error = SessionError::ProtocolViolation(format!("malformed message: {}", e));
            send_error(state, connection_id, None, &error).await;
            return;
        }
    };

    let ClientEnvelope {
        request_id,
        request,
    } = envelope;

    if matches!(request, ClientRequest::Ping) {
        state
            .connections
            .send_to_connection(connection_id, &ServerMessage::Pong)
            .await;
        return;
    }

    let name = request.name();
    tracing::debug!("Connection {} sent {}", connection_id, name);
    let result = state.coordinator.handle(connection_id, request).await;

    if cancel.is_cancelled() {
        tracing::debug!(
            "Dropping {} response for closed connection {}",
            name,
            connection_id
        );
        return;
    }

    match result {
        Ok(reply) => match request_id {
            Some(request_id) => {
                state
                    .connections
                    .send_to_connection(
                        connection_id,
                        &ServerMessage::Response {
                            request_id,
                            result: reply,
                        },
                    )
                    .await;
            }
            None => tracing::debug!("{} from {} carried no request id", name, connection_id),
        },
        Err(e) => {
            tracing::warn!("{} from {} failed: {}", name, connection_id, e);
            send_error(state, connection_id, request_id, &e).await;
        }
    }
}

async fn send_error(
    state: &AppState,
    connection_id: ConnectionId,
    request_id: Option<u64>,
    error: &SessionError,
) {
    state
        .connections
        .send_to_connection(
            connection_id,
            &ServerMessage::Error {
                request_id,
                error: error.to_payload(),
            },
        )
        .await;
}
