//! WebSocket connection handler.
//!
//! Each connection registers with the relay under a fresh client id, then
//! pumps frames both ways until either side goes away.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clients::ClientId;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::relay::{RelayEvent, RelayHandle};

pub async fn handle_ws(socket: WebSocket, relay: RelayHandle) {
    let client = relay.next_client_id();
    info!("New WebSocket connection (client {})", client);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    if !relay.send(RelayEvent::ClientConnected { client, tx }).await {
        warn!("Relay is not running; dropping client {}", client);
        return;
    }

    // Ends when the relay drops this client's queue
    let sender_task = async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    let relay_input = relay.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let Some(msg) = parse_frame(client, &text) else {
                        continue;
                    };
                    if !relay_input
                        .send(RelayEvent::ClientMessage { client, msg })
                        .await
                    {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Client {} socket error: {}", client, e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!("Sender task ended"),
        _ = input_task => debug!("Input task ended"),
    }

    relay.send(RelayEvent::ClientDisconnected { client }).await;
    info!("WebSocket connection closed (client {})", client);
}

/// Decode one inbound text frame. Unparseable frames are dropped.
fn parse_frame(client: ClientId, text: &str) -> Option<ClientMessage> {
    match serde_json::from_str(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!("Dropping unparseable frame from client {}: {}", client, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame() {
        assert_eq!(
            parse_frame(1, r#"{"type":"switch_session","id":3}"#),
            Some(ClientMessage::SwitchSession { id: 3 })
        );
        assert_eq!(parse_frame(1, "not json"), None);
        assert_eq!(parse_frame(1, r#"{"type":"launch_rockets"}"#), None);
        assert_eq!(parse_frame(1, r#"{"id":3}"#), None);
    }
}
