use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broadcast::RoomGroups;
use crate::media::url::ConnectionHints;
use crate::ratelimit::RateLimiter;
use crate::rooms::gateway::{
    CLOSE_UNAUTHORIZED, ChatConnection, FrameOutcome, Refusal, error_frame,
};
use crate::session::Identity;
use crate::settings::Settings;
use crate::store::sqlite::SqliteStore;

#[debug_handler(state = crate::AppState)]
pub async fn chat_ws(
    Path(slug): Path<String>,
    State(settings): State<Arc<Settings>>,
    State(store): State<SqliteStore>,
    State(limiter): State<RateLimiter>,
    State(groups): State<Arc<RoomGroups>>,
    identity: Identity,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let hints = ConnectionHints::from_parts(&headers, Some(settings.bind_addr), false);

    let mut conn =
        match ChatConnection::connect(&store, &settings, identity, &slug, hints).await {
            Ok(conn) => conn,
            Err(Refusal::InvalidSlug) => return StatusCode::FORBIDDEN.into_response(),
            Err(Refusal::Unauthorized) => {
                return ws.on_upgrade(close_unauthorized).into_response();
            }
        };

    let conn_id = Uuid::now_v7();
    ws.on_upgrade(async move |stream| {
        debug!(conn = %conn_id, group = conn.group(), "chat connection open");
        let mut rx = groups.join(conn.group());
        let (mut sender, mut receiver) = stream.split();

        // Room events and sender-only error frames share the socket, so both
        // funnel through one writer task.
        let (reply_tx, mut reply_rx) = mpsc::channel::<String>(8);
        let mut forward_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(event) => {
                            if sender.send(event.into()).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(conn = %conn_id, skipped, "chat stream lagging, frames dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    reply = reply_rx.recv() => match reply {
                        Some(reply) => {
                            if sender.send(reply.into()).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        while let Some(Ok(frame)) = receiver.next().await {
            let outcome = conn
                .on_frame(&store, &settings, &limiter, &groups, &frame.into_data())
                .await;
            if let FrameOutcome::Rejected(reason) = outcome {
                if reply_tx.send(error_frame(reason)).await.is_err() {
                    break;
                }
            }
        }

        forward_task.abort();
        let _ = (&mut forward_task).await;
        conn.close(&groups);
        debug!(conn = %conn_id, "chat connection closed");
    })
}

/// Complete the upgrade only to deliver the application close code; the
/// handshake itself cannot carry one.
async fn close_unauthorized(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: CLOSE_UNAUTHORIZED,
        reason: "unauthorized".into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
