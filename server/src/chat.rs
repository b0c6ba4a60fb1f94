//! The chat orchestrator: drives one LLM stream end-to-end, emitting
//! CHAT_TOKEN events as they arrive and a final CHAT_DONE regardless of
//! how the stream ended (completed, interrupted, or errored).
//!
//! Finalizing order is load-bearing: the CHAT_DONE event must be durably
//! appended to the log, and the usage row must be committed, before the
//! CHAT_DONE frame is sent over the socket. If the connection dies while
//! a finalize is in flight, the finalize still has to land — so the
//! finalize body runs in its own detached task rather than inline in the
//! task a disconnect might abort.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::LlmConfig;
use crate::db::DbPool;
use crate::llm;
use crate::metrics::LlmChatMetricLabels;
use crate::models::{frame_type, OutboundMsg, UsageRow};

#[derive(Clone)]
pub struct ChatContext {
    pub db: DbPool,
    pub user_id: String,
    pub save_id: String,
    pub outbound: mpsc::Sender<OutboundMsg>,
    pub llm: Arc<LlmConfig>,
}

/// Handle to a chat stream running in the background. Holds the
/// cancellation token used to interrupt it and the join handle of the
/// task driving it.
pub struct ActiveChatStream {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ActiveChatStream {
    pub fn spawn(ctx: ChatContext, text: String, client_request_id: Option<String>) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_chat_stream(
            ctx,
            text,
            client_request_id,
            cancel.clone(),
        ));
        Self { cancel, handle }
    }

    /// Signals the stream to stop and waits for it to finish. Always
    /// succeeds from the caller's point of view: a panicking or already
    /// finished stream task is not itself an interruption failure.
    pub async fn interrupt(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run_chat_stream(
    ctx: ChatContext,
    text: String,
    client_request_id: Option<String>,
    cancel: CancellationToken,
) {
    let started_at = Utc::now();
    let start = Instant::now();
    let mut ttft_ms: Option<i64> = None;
    let mut output_chunks: i64 = 0;
    let mut output_chars: i64 = 0;
    let mut interrupted = false;
    let mut error: Option<String> = None;

    let stream_result = llm::stream_chat_tokens(&ctx.llm, &text).await;
    let (mut stream, capture) = match stream_result {
        Ok(pair) => pair,
        Err(e) => {
            finalize(
                &ctx,
                started_at,
                start,
                ttft_ms,
                output_chunks,
                output_chars,
                false,
                Some(e.to_string()),
                client_request_id,
                Default::default(),
            )
            .await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                interrupted = true;
                break;
            }
            next = stream.next() => {
                match next {
                    Some(Ok(token)) => {
                        if ttft_ms.is_none() {
                            ttft_ms = Some(start.elapsed().as_millis() as i64);
                        }
                        output_chunks += 1;
                        output_chars += token.chars().count() as i64;

                        let payload = serde_json::json!({
                            "token": token,
                            "client_request_id": client_request_id,
                        });
                        let append_start = Instant::now();
                        let append = crate::db::append_typed_event(
                            &ctx.db,
                            &ctx.user_id,
                            &ctx.save_id,
                            frame_type::CHAT_TOKEN,
                            Some(payload),
                            true,
                        )
                        .await;
                        crate::metrics::record_append_latency(append_start.elapsed());

                        match append {
                            Ok(event) => {
                                if ctx.outbound.send(event.to_frame().into()).await.is_err() {
                                    interrupted = true;
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to append chat token event");
                                error = Some(e.to_string());
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error = Some(e.to_string());
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let snapshot = capture.lock().clone();
    finalize(
        &ctx,
        started_at,
        start,
        ttft_ms,
        output_chunks,
        output_chars,
        interrupted,
        error,
        client_request_id,
        snapshot,
    )
    .await;
}

#[allow(clippy::too_many_arguments)]
async fn finalize(
    ctx: &ChatContext,
    started_at: chrono::DateTime<Utc>,
    start: Instant,
    ttft_ms: Option<i64>,
    output_chunks: i64,
    output_chars: i64,
    interrupted: bool,
    error: Option<String>,
    client_request_id: Option<String>,
    capture: llm::StreamCapture,
) {
    let ctx = ctx.clone();

    // Runs detached so the CHAT_DONE append and usage-row commit survive
    // even if the connection (and the task that spawned us) goes away
    // mid-finalize.
    let finalize_task = tokio::spawn(async move {
        let done_payload = serde_json::json!({
            "interrupted": interrupted,
            "client_request_id": client_request_id,
            "error": error,
        });
        let append_start = Instant::now();
        let done_event = crate::db::append_typed_event(
            &ctx.db,
            &ctx.user_id,
            &ctx.save_id,
            frame_type::CHAT_DONE,
            Some(done_payload),
            true,
        )
        .await;
        crate::metrics::record_append_latency(append_start.elapsed());

        let ended_at = Utc::now();
        let latency_ms = (ended_at - started_at).num_milliseconds().max(0);

        crate::metrics::record_llm_chat_stream(
            &LlmChatMetricLabels {
                provider: capture.provider.clone(),
                api: capture.api.clone(),
                interrupted,
                errored: error.is_some(),
            },
            start.elapsed(),
        );

        let usage_row = UsageRow {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: ctx.user_id.clone(),
            save_id: ctx.save_id.clone(),
            provider: capture.provider,
            api: capture.api,
            model: capture.model,
            started_at,
            ended_at,
            latency_ms,
            time_to_first_token_ms: ttft_ms,
            output_chunks,
            output_chars,
            interrupted,
            error,
            prompt_tokens: capture.prompt_tokens,
            completion_tokens: capture.completion_tokens,
            total_tokens: capture.total_tokens,
            created_at: ended_at,
        };

        if let Err(e) = crate::db::persist_usage_row(&ctx.db, &usage_row).await {
            warn!(error = %e, "failed to persist llm usage row");
        }

        done_event
    });

    let done_event = match finalize_task.await {
        Ok(Ok(event)) => Some(event),
        Ok(Err(e)) => {
            warn!(error = %e, "failed to append chat done event");
            None
        }
        Err(e) => {
            warn!(error = %e, "chat finalize task panicked");
            None
        }
    };

    if let Some(event) = done_event {
        // Best-effort: the connection may already be gone, but the event
        // is durably logged regardless.
        let _ = ctx.outbound.send(event.to_frame().into()).await;
    }
}

