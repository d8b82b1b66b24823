// SPDX-License-Identifier: MIT OR Apache-2.0
//! Live event stream endpoints.
//!
//! Both endpoints replay from `after_seq` and attach to the live tail in
//! order, inject a heartbeat every 30 seconds (never stored), and close
//! with a retryable `lagged` signal when the subscriber overflows its
//! buffer. Clients resume by reconnecting with `after_seq` set to the last
//! sequence number they received.

use crate::{ApiError, AppState};
use acp_eventlog::{SubscribeOptions, Subscription, SubscriptionError};
use axum::{
    extract::{
        Path as AxPath, Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::debug;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Query accepted by both stream endpoints.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Resume cursor: only events with `seq > after_seq` are sent.
    pub after_seq: Option<i64>,
    /// Comma-separated event type filter.
    pub types: Option<String>,
}

async fn open_subscription(
    state: &AppState,
    run_id: Uuid,
    query: &StreamQuery,
) -> Result<Subscription, ApiError> {
    let types = crate::parse_types(query.types.as_deref())?;
    state
        .orchestrator
        .ledger()
        .events()
        .subscribe(
            run_id,
            SubscribeOptions {
                after_seq: query.after_seq,
                types,
            },
        )
        .await
        .map_err(|e| ApiError::new(StatusCode::NOT_FOUND, e.to_string()))
}

// ---------------------------------------------------------------------------
// Server-sent events
// ---------------------------------------------------------------------------

/// `GET /runs/{id}/stream` (SSE). Named event `event` carries the JSON
/// event with `id` equal to its seq, named event `heartbeat` ticks every
/// 30s, and named event `lagged` is the retryable overflow closure.
pub async fn cmd_stream_sse(
    AxPath(run_id): AxPath<Uuid>,
    Query(query): Query<StreamQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let subscription = open_subscription(&state, run_id, &query).await?;
    debug!(target: "acp.daemon", %run_id, after_seq = ?query.after_seq, "sse stream opened");

    let heartbeat = {
        let mut ticker = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    };

    let stream = futures::stream::unfold(
        (subscription, heartbeat, false),
        |(mut sub, mut heartbeat, done)| async move {
            if done {
                return None;
            }
            tokio::select! {
                item = sub.recv() => match item {
                    Some(Ok(event)) => {
                        let frame = SseEvent::default()
                            .event("event")
                            .id(event.seq.to_string())
                            .data(serde_json::to_string(&event).unwrap_or_default());
                        Some((Ok(frame), (sub, heartbeat, false)))
                    }
                    Some(Err(SubscriptionError::Lagged)) => {
                        let frame = SseEvent::default()
                            .event("lagged")
                            .data("subscription lagged; reconnect with after_seq");
                        Some((Ok(frame), (sub, heartbeat, true)))
                    }
                    None => None,
                },
                _ = heartbeat.tick() => {
                    let frame = SseEvent::default().event("heartbeat").data("{}");
                    Some((Ok(frame), (sub, heartbeat, false)))
                }
            }
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// `GET /runs/{id}/ws` (bidirectional). On connect the server sends
/// `subscribed {after_seq}`, then one JSON event per frame, pings every
/// 30s, and closes with reason `lagged` on overflow.
pub async fn cmd_stream_ws(
    ws: WebSocketUpgrade,
    AxPath(run_id): AxPath<Uuid>,
    Query(query): Query<StreamQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let after_seq = query.after_seq.unwrap_or(-1);
    let subscription = open_subscription(&state, run_id, &query).await?;
    debug!(target: "acp.daemon", %run_id, after_seq, "websocket stream opened");
    Ok(ws.on_upgrade(move |socket| drive_ws(socket, subscription, after_seq)))
}

async fn drive_ws(socket: WebSocket, mut sub: Subscription, after_seq: i64) {
    let (mut sink, mut source) = socket.split();

    let hello = json!({"type": "subscribed", "after_seq": after_seq});
    if sink
        .send(Message::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut ping = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = sub.recv() => match item {
                Some(Ok(event)) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(_) => continue,
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                Some(Err(SubscriptionError::Lagged)) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: 1011,
                            reason: "lagged".into(),
                        })))
                        .await;
                    return;
                }
                None => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: "run terminal".into(),
                        })))
                        .await;
                    return;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(_)) => return,
            },
        }
    }
}
