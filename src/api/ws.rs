//! Push channel. Each socket gets its owner's task events and every worker
//! event as `{type, message}` text frames.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use tracing::{debug, info, warn};

use super::AppState;
use super::auth::Principal;
use crate::events::{Delivery, EventFilter, Frame, Subscription};

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    principal: Principal,
) -> impl IntoResponse {
    info!(owner_id = %principal.owner_id, "WebSocket client connecting");
    // Subscribe before the upgrade so nothing published in between is lost.
    let subscription = state
        .orchestrator
        .subscribe(EventFilter::for_owner(principal.owner_id.clone()));
    ws.on_upgrade(move |socket| handle_socket(socket, subscription, principal.owner_id))
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode frame");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, mut subscription: Subscription, owner_id: String) {
    info!(owner_id = %owner_id, "WebSocket client connected");

    loop {
        tokio::select! {
            delivery = subscription.recv() => {
                let frame = match delivery {
                    Some(Delivery::Event(event)) => match event.to_frame() {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode event");
                            continue;
                        }
                    },
                    Some(Delivery::Gap { missed }) => Frame::resync(missed),
                    None => {
                        debug!("Event bus closed");
                        break;
                    }
                };
                if !send_frame(&mut socket, &frame).await {
                    debug!(owner_id = %owner_id, "Client disconnected during send");
                    break;
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(owner_id = %owner_id, "WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    // Clients have nothing to say on this channel.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
