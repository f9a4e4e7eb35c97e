use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{BridgeMessage, ClientMessage, ObserverId, ProgressBridge};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(bridge): State<ProgressBridge>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, bridge))
}

async fn handle_socket(socket: WebSocket, bridge: ProgressBridge) {
    let (sender, receiver) = socket.split();
    let (observer, rx) = bridge.connect();
    run_socket_loop(&bridge, observer, sender, receiver, rx).await;
    bridge.disconnect(observer);
}

/// Apply one client frame. Returns the reply to send when the frame was not a
/// valid request.
pub fn handle_client_text(bridge: &ProgressBridge, observer: ObserverId, text: &str) -> Option<BridgeMessage> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { run_id }) => {
            bridge.subscribe(observer, &run_id);
            None
        }
        Ok(ClientMessage::Unsubscribe { run_id }) => {
            bridge.unsubscribe(observer, &run_id);
            None
        }
        Err(e) => Some(BridgeMessage::Error {
            run_id: None,
            message: format!("invalid request: {}", e),
        }),
    }
}

async fn send_json(sender: &mut SplitSink<WebSocket, Message>, message: &BridgeMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, kind = message.kind(), "failed to serialize bridge message");
            true
        }
    }
}

/// Forward bridge messages to the socket and apply client requests, with
/// ping/pong keepalive. Exits when either side goes away or a Pong is overdue.
async fn run_socket_loop(
    bridge: &ProgressBridge,
    observer: ObserverId,
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: mpsc::UnboundedReceiver<BridgeMessage>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!(observer, "pong overdue; closing socket");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            message = rx.recv() => {
                let Some(message) = message else { break };
                if !send_json(&mut sender, &message).await {
                    break;
                }
            }

            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_text(bridge, observer, text.as_str()) {
                            if !send_json(&mut sender, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeSettings;
    use async_trait::async_trait;
    use std::sync::Arc;
    use warden_common::{
        ProgressSource, QueryError, RunDescription, RunSnapshot, StatusSource,
    };

    struct Nothing;

    #[async_trait]
    impl ProgressSource for Nothing {
        async fn get_progress(&self, run_id: &str) -> Result<RunSnapshot, QueryError> {
            Err(QueryError::NotReady(run_id.to_string()))
        }
    }

    #[async_trait]
    impl StatusSource for Nothing {
        async fn describe(&self, run_id: &str) -> Result<RunDescription, QueryError> {
            Err(QueryError::NotFound(run_id.to_string()))
        }
    }

    fn bridge() -> ProgressBridge {
        ProgressBridge::new(Arc::new(Nothing), Arc::new(Nothing), BridgeSettings::default(), None)
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_frames() {
        let bridge = bridge();
        let (observer, mut rx) = bridge.connect();

        let reply = handle_client_text(&bridge, observer, r#"{"type":"subscribe","run_id":"run-1"}"#);
        assert!(reply.is_none());
        assert_eq!(bridge.subscriber_count("run-1"), 1);
        assert_eq!(
            rx.recv().await,
            Some(BridgeMessage::Subscribed {
                run_id: "run-1".to_string()
            })
        );

        handle_client_text(&bridge, observer, r#"{"type":"unsubscribe","run_id":"run-1"}"#);
        assert_eq!(bridge.subscriber_count("run-1"), 0);
        assert!(!bridge.is_polling("run-1"));
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_reply() {
        let bridge = bridge();
        let (observer, _rx) = bridge.connect();

        match handle_client_text(&bridge, observer, "subscribe me") {
            Some(BridgeMessage::Error { run_id, message }) => {
                assert!(run_id.is_none());
                assert!(message.starts_with("invalid request"));
            }
            other => panic!("Expected error reply, got {:?}", other),
        }
    }
}
