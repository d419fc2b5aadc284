use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Inbound, Relay};

#[debug_handler(state = crate::AppState)]
pub async fn relay_ws(State(relay): State<Arc<Relay>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(async move |stream| serve(relay, stream).await)
}

/// One task per socket: frames are handled strictly in arrival order while a
/// second task drains the connection's outbound queue.
async fn serve(relay: Arc<Relay>, stream: WebSocket) {
    let connection_id = Uuid::now_v7();
    let (tx, mut rx) = relay.outbox().channel();
    relay.connect(connection_id, tx).await;

    let (mut sender, mut receiver) = stream.split();

    let mut forward_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%connection_id, event = event.name(), %err, "cannot encode event");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => relay.handle_frame(connection_id, text.as_str()).await,
                Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => relay.handle_frame(connection_id, text).await,
                    Err(err) => warn!(%connection_id, %err, "dropping non-utf8 frame"),
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%connection_id, %err, "socket error");
                    break;
                }
            },
            _ = &mut forward_task => break,
        }
    }

    relay.handle(connection_id, Inbound::Disconnect).await;
    forward_task.abort();
}
