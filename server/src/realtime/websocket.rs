//! The duplex session socket: one WebSocket connection per (device, save),
//! driving the HELLO/replay/live-tail/ack protocol and dispatching the
//! chat orchestrator. Structurally this follows the teacher's
//! subscribeConvoEvents handler — split sink/stream, a serialized outbound
//! writer task, a spawned tailer, `tokio::select!` over socket receive and
//! background wakeups — generalized from a single federation subscription
//! to the full duplex protocol this server implements.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chat::{ActiveChatStream, ChatContext};
use crate::crypto::redact_for_log;
use crate::db;
use crate::error::{CloseCode, SessionError};
use crate::models::{ClientMessage, Frame, OutboundMsg};
use crate::notifier::AppendNotice;
use crate::realtime::handshake;
use crate::AppState;

/// Outbound frames are buffered between producers (replay, tail, chat
/// tokens) and the single task that owns the socket's write half. Sized
/// generously: a slow client backs up here before anything is dropped.
const OUTBOUND_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub save_id: String,
    #[serde(default = "default_resume_from")]
    pub resume_from: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

fn default_resume_from() -> String {
    "0".to_string()
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> Response {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, state, query, authorization).await;
    })
}

/// Sends a close frame carrying `code` and drops the socket. Used for
/// handshake rejections (code from `SessionError::close_code()`) and
/// malformed inbound frames (unsupported-data, 1003).
async fn close_with(socket: &mut WebSocket, code: CloseCode, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: code.0,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    query: ConnectQuery,
    authorization: Option<String>,
) {
    // Any handshake rejection — malformed resume_from, bad/expired token,
    // save not owned, device cap exceeded — closes before a single frame
    // goes out, with the close code `SessionError::close_code()` assigns
    // that error kind, per the protocol's handshake contract.
    let resume_from: i64 = match query.resume_from.parse::<i64>() {
        Ok(v) if v >= 0 => v,
        _ => {
            let err = SessionError::Protocol("malformed resume_from".to_string());
            close_with(&mut socket, err.close_code(), "malformed resume_from").await;
            return;
        }
    };

    let resolved = match handshake::resolve(
        &state.db,
        &state.jwt,
        &state.config,
        authorization.as_deref(),
        &query.save_id,
        query.device_id.as_deref(),
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "duplex handshake rejected");
            let code = e.close_code();
            close_with(&mut socket, code, "handshake rejected").await;
            return;
        }
    };

    let handshake::ResolvedSession {
        user_id,
        save_id,
        device_id,
    } = resolved;

    info!(
        user = %redact_for_log(&user_id),
        save = %redact_for_log(&save_id),
        device = %redact_for_log(&device_id),
        "duplex session connected"
    );
    crate::metrics::record_session_connected(1);

    let (ws_sink, mut ws_stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundMsg>(OUTBOUND_CHANNEL_CAPACITY);
    // Highest seq actually written to the socket so far. Shared with the
    // tailer and the post-subscribe drain so every producer can re-query
    // "what haven't I sent yet" without racing each other.
    let last_sent_seq = Arc::new(AtomicI64::new(0));

    let writer_handle = tokio::spawn(run_outbound_writer(
        ws_sink,
        outbound_rx,
        last_sent_seq.clone(),
    ));

    let hello_cursor =
        match db::get_device_last_acked_seq(&state.db, &user_id, &save_id, &device_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to read device cursor for HELLO");
                drop(outbound_tx);
                let _ = writer_handle.await;
                return;
            }
        };
    if outbound_tx
        .send(Frame::hello(hello_cursor, &user_id, &save_id).into())
        .await
        .is_err()
    {
        let _ = writer_handle.await;
        return;
    }

    if let Err(e) = drain_after(&state.db, &user_id, &save_id, resume_from, &outbound_tx).await {
        warn!(error = %e, "initial replay failed");
        drop(outbound_tx);
        let _ = writer_handle.await;
        return;
    }

    let notice_rx = state.notifier.subscribe(&user_id, &save_id).await;
    let tailer_handle = tokio::spawn(run_tailer(
        state.db.clone(),
        user_id.clone(),
        save_id.clone(),
        notice_rx,
        last_sent_seq.clone(),
        outbound_tx.clone(),
    ));

    // Closes the race between the initial replay and the subscribe above:
    // an append that landed in between is otherwise only ever seen by a
    // notify this session wasn't subscribed yet to receive.
    if let Err(e) = drain_since_last_sent(&state.db, &user_id, &save_id, &last_sent_seq, &outbound_tx).await {
        warn!(error = %e, "post-subscribe drain failed");
    }

    let llm_config = Arc::new(state.config.llm.clone());
    let mut active_chat: Option<ActiveChatStream> = None;

    loop {
        match ws_stream.next().await {
            Some(Ok(Message::Text(text))) => {
                crate::metrics::record_frame_received();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        let keep_going = dispatch_inbound(
                            client_msg,
                            &state,
                            &user_id,
                            &save_id,
                            &device_id,
                            &outbound_tx,
                            &mut active_chat,
                            &llm_config,
                        )
                        .await;
                        if !keep_going {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "malformed inbound frame, closing");
                        let _ = outbound_tx
                            .send(OutboundMsg::Close(CloseCode::UNSUPPORTED_DATA.0))
                            .await;
                        break;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {
                // Binary/ping/pong at the WS framing layer carry no
                // protocol meaning here; the duplex protocol is JSON text
                // frames only, and axum answers transport-level pings.
            }
            Some(Err(e)) => {
                debug!(error = %e, "socket receive error, closing");
                break;
            }
        }
    }

    if let Some(active) = active_chat.take() {
        active.interrupt().await;
    }
    tailer_handle.abort();
    drop(outbound_tx);
    let _ = writer_handle.await;
    crate::metrics::record_session_connected(-1);

    info!(
        user = %redact_for_log(&user_id),
        save = %redact_for_log(&save_id),
        "duplex session closed"
    );
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_inbound(
    msg: ClientMessage,
    state: &AppState,
    user_id: &str,
    save_id: &str,
    device_id: &str,
    outbound_tx: &mpsc::Sender<OutboundMsg>,
    active_chat: &mut Option<ActiveChatStream>,
    llm_config: &Arc<crate::config::LlmConfig>,
) -> bool {
    match msg {
        ClientMessage::Ack { cursor, seq } => {
            let Some(value) = cursor.or(seq) else {
                return true;
            };
            let start = std::time::Instant::now();
            if let Err(e) =
                db::ack_device_cursor_and_maybe_trim(&state.db, user_id, save_id, device_id, value)
                    .await
            {
                warn!(error = %e, "failed to ack/trim device cursor");
            }
            crate::metrics::record_ack_latency(start.elapsed());
            true
        }
        ClientMessage::Ping { payload } => {
            let cursor = db::get_device_last_acked_seq(&state.db, user_id, save_id, device_id)
                .await
                .unwrap_or(0);
            outbound_tx
                .send(Frame::pong(cursor, payload).into())
                .await
                .is_ok()
        }
        ClientMessage::Interrupt => {
            if let Some(active) = active_chat.take() {
                active.interrupt().await;
            }
            true
        }
        ClientMessage::ChatSend { payload } => {
            // A new CHAT_SEND supersedes whatever is currently streaming;
            // interrupt it first so its CHAT_DONE lands before the new
            // stream's tokens start.
            if let Some(active) = active_chat.take() {
                active.interrupt().await;
            }
            let ctx = ChatContext {
                db: state.db.clone(),
                user_id: user_id.to_string(),
                save_id: save_id.to_string(),
                outbound: outbound_tx.clone(),
                llm: llm_config.clone(),
            };
            *active_chat = Some(ActiveChatStream::spawn(
                ctx,
                payload.text,
                payload.client_request_id,
            ));
            true
        }
    }
}

/// Owns the socket's write half. Encodes and sends frames in the order
/// they arrive on the channel, deduplicating log-backed frames (seq > 0)
/// against the high-water mark so a frame re-queued by a racing drain
/// never goes out twice.
async fn run_outbound_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundMsg>,
    last_sent_seq: Arc<AtomicI64>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            OutboundMsg::Frame(frame) => {
                if frame.seq > 0 && frame.seq <= last_sent_seq.load(Ordering::SeqCst) {
                    continue;
                }

                let text = match serde_json::to_string(&frame) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "failed to encode outbound frame");
                        continue;
                    }
                };

                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                crate::metrics::record_frame_sent();

                if frame.seq > 0 {
                    last_sent_seq.fetch_max(frame.seq, Ordering::SeqCst);
                }
            }
            OutboundMsg::Close(code) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: "".into(),
                    })))
                    .await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

/// Replays events strictly after `from`, pushing each onto the outbound
/// channel in order. Used for the initial resume_from replay.
async fn drain_after(
    pool: &db::DbPool,
    user_id: &str,
    save_id: &str,
    from: i64,
    outbound_tx: &mpsc::Sender<OutboundMsg>,
) -> Result<(), SessionError> {
    let events = db::get_events_after(pool, user_id, save_id, from)
        .await
        .map_err(SessionError::Storage)?;
    for event in events {
        if outbound_tx.send(event.to_frame().into()).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Re-queries everything after the current high-water mark. Used by the
/// tailer on every notify and once right after subscribing, since the log
/// (not the notify payload) is always the source of truth for what to
/// send next.
async fn drain_since_last_sent(
    pool: &db::DbPool,
    user_id: &str,
    save_id: &str,
    last_sent_seq: &AtomicI64,
    outbound_tx: &mpsc::Sender<OutboundMsg>,
) -> Result<(), SessionError> {
    let from = last_sent_seq.load(Ordering::SeqCst);
    drain_after(pool, user_id, save_id, from, outbound_tx).await
}

/// Background task: wakes on every notify for this stream and re-drains.
/// Lagged notifications are treated the same as a normal wake-up — the
/// drain re-queries the log regardless, so a dropped notify only costs a
/// few extra rows read on the next one, never a missed event.
async fn run_tailer(
    pool: db::DbPool,
    user_id: String,
    save_id: String,
    mut notice_rx: tokio::sync::broadcast::Receiver<AppendNotice>,
    last_sent_seq: Arc<AtomicI64>,
    outbound_tx: mpsc::Sender<OutboundMsg>,
) {
    loop {
        match notice_rx.recv().await {
            Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                if let Err(e) =
                    drain_since_last_sent(&pool, &user_id, &save_id, &last_sent_seq, &outbound_tx)
                        .await
                {
                    warn!(error = %e, "tailer drain failed");
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
