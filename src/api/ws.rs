//! Outbound WebSocket stream (C11, spec §4.8). A client connects once and
//! sends `{"subscribe": ["order_filled", ...]}` / `{"unsubscribe": [...]}`
//! control frames to narrow which channels it receives; everything else
//! published on a subscribed channel is forwarded as a `StreamMessage`.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use serde::Deserialize;

use super::AppState;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ControlFrame {
    Subscribe { subscribe: Vec<String> },
    Unsubscribe { unsubscribe: Vec<String> },
}

pub async fn stream_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.outbound.subscribe();
    let mut channels: HashSet<String> = crate::stream::CHANNELS.iter().map(|c| c.to_string()).collect();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        apply_control_frame(&mut channels, &text);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            message = rx.recv() => {
                match message {
                    Ok(stream_message) => {
                        if !channels.contains(&stream_message.channel) {
                            continue;
                        }
                        let payload = match serde_json::to_string(&stream_message) {
                            Ok(p) => p,
                            Err(_) => continue,
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

fn apply_control_frame(channels: &mut HashSet<String>, text: &str) {
    let Ok(frame) = serde_json::from_str::<ControlFrame>(text) else {
        return;
    };
    match frame {
        ControlFrame::Subscribe { subscribe } => {
            channels.extend(subscribe);
        }
        ControlFrame::Unsubscribe { unsubscribe } => {
            for channel in unsubscribe {
                channels.remove(&channel);
            }
        }
    }
}
