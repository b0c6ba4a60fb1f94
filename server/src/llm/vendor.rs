//! OpenAI-compatible vendor streaming client: auto-detects between the
//! `responses` and `chat/completions` APIs, extracts token deltas and
//! usage, and normalizes the base URL the way a user is likely to paste
//! it in (bare host, trailing slash, missing `/v1`).

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{stream, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::sse::SseLineBuffer;
use super::StreamCapture;
use crate::config::LlmConfig;
use crate::error::SessionError;

/// Ensures a full URL with scheme/host, strips a trailing slash, and
/// appends `/v1` if missing.
pub fn normalize_base_url(raw: &str) -> Result<String, SessionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SessionError::Upstream("empty base url".to_string()));
    }
    let parsed = url::Url::parse(trimmed)
        .map_err(|e| SessionError::Upstream(format!("invalid base url: {e}")))?;
    if parsed.host_str().is_none() {
        return Err(SessionError::Upstream(
            "base url must be a full URL with scheme and host".to_string(),
        ));
    }
    let mut url = trimmed.trim_end_matches('/').to_string();
    if !url.ends_with("/v1") {
        url.push_str("/v1");
    }
    Ok(url)
}

fn extract_delta_responses(obj: &Value) -> Option<String> {
    match obj.get("type").and_then(Value::as_str) {
        Some("response.output_text.delta") => obj
            .get("delta")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        Some("response.output_text.done") => None,
        _ => obj
            .get("delta")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    }
}

fn extract_delta_chat_completions(obj: &Value) -> Option<String> {
    obj.get("choices")?
        .as_array()?
        .first()?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn maybe_capture_usage(obj: &Value, capture: &Arc<Mutex<StreamCapture>>) {
    let usage = obj
        .get("usage")
        .filter(|v| v.is_object())
        .or_else(|| obj.get("response").and_then(|r| r.get("usage")))
        .filter(|v| v.is_object());

    let Some(usage) = usage else { return };

    let prompt = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(Value::as_i64)
        .filter(|v| *v >= 0);
    let completion = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(Value::as_i64)
        .filter(|v| *v >= 0);
    let mut total = usage.get("total_tokens").and_then(Value::as_i64).filter(|v| *v >= 0);

    if total.is_none() {
        if let (Some(p), Some(c)) = (prompt, completion) {
            total = Some(p + c);
        }
    }

    let mut capture = capture.lock();
    if let Some(p) = prompt {
        capture.prompt_tokens = Some(p);
    }
    if let Some(c) = completion {
        capture.completion_tokens = Some(c);
    }
    if let Some(t) = total {
        capture.total_tokens = Some(t);
    }
}

/// Which OpenAI-compatible surface to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Api {
    Responses,
    ChatCompletions,
    Auto,
}

impl Api {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "responses" | "response" => Api::Responses,
            "chat" | "chat_completions" | "chat.completions" => Api::ChatCompletions,
            _ => Api::Auto,
        }
    }
}

pub struct VendorClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl VendorClient {
    pub fn new(cfg: &LlmConfig) -> Result<Self, SessionError> {
        let base_url = cfg
            .base_url
            .as_deref()
            .ok_or_else(|| SessionError::Upstream("LLM_BASE_URL not configured".to_string()))?;
        let api_key = cfg
            .api_key
            .clone()
            .ok_or_else(|| SessionError::Upstream("LLM_API_KEY not configured".to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(cfg.total_timeout)
            .connect_timeout(cfg.connect_timeout)
            .build()
            .map_err(|e| SessionError::Upstream(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            base_url: normalize_base_url(base_url)?,
            api_key,
            model: cfg.model.clone(),
        })
    }

    /// Streams token deltas for `text`, dispatching on `api`. In `Auto`
    /// mode, tries `responses` first and falls back to
    /// `chat_completions` if the upstream answers 400/404/405 (i.e. the
    /// endpoint doesn't exist or doesn't accept this shape), matching the
    /// vendor-probing behavior of a client that doesn't yet know which
    /// surface a given base URL actually serves.
    pub async fn stream(
        &self,
        text: &str,
        api: Api,
        capture: Arc<Mutex<StreamCapture>>,
    ) -> Result<impl Stream<Item = Result<String, SessionError>> + Send + 'static, SessionError> {
        match api {
            Api::Responses => {
                capture.lock().api = "responses".to_string();
                self.stream_responses(text, capture).await
            }
            Api::ChatCompletions => {
                capture.lock().api = "chat_completions".to_string();
                self.stream_chat_completions(text, capture).await
            }
            Api::Auto => {
                capture.lock().api = "responses".to_string();
                match self.stream_responses(text, capture.clone()).await {
                    Ok(s) => Ok(s),
                    Err(SessionError::Upstream(ref msg)) if is_fallback_eligible(msg) => {
                        capture.lock().api = "chat_completions".to_string();
                        self.stream_chat_completions(text, capture).await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn stream_responses(
        &self,
        text: &str,
        capture: Arc<Mutex<StreamCapture>>,
    ) -> Result<impl Stream<Item = Result<String, SessionError>> + Send + 'static, SessionError> {
        let payload = json!({"model": self.model, "input": text, "stream": true});
        let resp = self.send("responses", &payload).await?;
        Ok(sse_token_stream(resp, capture, extract_delta_responses))
    }

    async fn stream_chat_completions(
        &self,
        text: &str,
        capture: Arc<Mutex<StreamCapture>>,
    ) -> Result<impl Stream<Item = Result<String, SessionError>> + Send + 'static, SessionError> {
        let payload = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": text}],
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        let resp = self.send("chat/completions", &payload).await?;
        Ok(sse_token_stream(resp, capture, extract_delta_chat_completions))
    }

    async fn send(&self, path: &str, payload: &Value) -> Result<reqwest::Response, SessionError> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| SessionError::Upstream(format!("request to {path} failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(SessionError::Upstream(format!(
                "status={status} path={path}"
            )));
        }
        Ok(resp)
    }
}

fn is_fallback_eligible(message: &str) -> bool {
    ["status=400", "status=404", "status=405"]
        .iter()
        .any(|needle| message.contains(needle))
}

fn sse_token_stream(
    resp: reqwest::Response,
    capture: Arc<Mutex<StreamCapture>>,
    extract: fn(&Value) -> Option<String>,
) -> impl Stream<Item = Result<String, SessionError>> + Send + 'static {
    let byte_stream = resp.bytes_stream();
    let pending: VecDeque<String> = VecDeque::new();
    stream::unfold(
        (byte_stream, SseLineBuffer::new(), false, capture, extract, pending),
        move |(mut bytes, mut buf, mut done, capture, extract, mut pending)| async move {
            loop {
                if let Some(token) = pending.pop_front() {
                    return Some((Ok(token), (bytes, buf, done, capture, extract, pending)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        let events = buf.feed(&chunk);
                        process_events(events, &capture, extract, &mut done, &mut pending);
                    }
                    Some(Err(e)) => {
                        done = true;
                        return Some((
                            Err(SessionError::Upstream(format!("stream read error: {e}"))),
                            (bytes, buf, done, capture, extract, pending),
                        ));
                    }
                    None => {
                        done = true;
                        let events = buf.flush();
                        process_events(events, &capture, extract, &mut done, &mut pending);
                    }
                }
            }
        },
    )
}

/// Processes a batch of SSE event bodies, updating usage capture and
/// pushing every extracted token delta onto `pending` in order. A single
/// TCP read can carry several `data:` events, so all of them must be kept
/// rather than just the first.
fn process_events(
    events: Vec<String>,
    capture: &Arc<Mutex<StreamCapture>>,
    extract: fn(&Value) -> Option<String>,
    done: &mut bool,
    pending: &mut VecDeque<String>,
) {
    for data in events {
        if data.trim() == "[DONE]" {
            *done = true;
            return;
        }
        let Ok(obj) = serde_json::from_str::<Value>(&data) else {
            continue;
        };
        maybe_capture_usage(&obj, capture);
        if let Some(delta) = extract(&obj) {
            pending.push_back(delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_host() {
        assert_eq!(
            normalize_base_url("http://127.0.0.1:1234").unwrap(),
            "http://127.0.0.1:1234/v1"
        );
    }

    #[test]
    fn normalizes_trailing_slash_and_existing_v1() {
        assert_eq!(
            normalize_base_url("https://api.example.com/v1/").unwrap(),
            "https://api.example.com/v1"
        );
    }

    #[test]
    fn rejects_empty() {
        assert!(normalize_base_url("   ").is_err());
    }

    #[test]
    fn extracts_responses_delta() {
        let obj: Value = serde_json::from_str(
            r#"{"type":"response.output_text.delta","delta":"hi"}"#,
        )
        .unwrap();
        assert_eq!(extract_delta_responses(&obj), Some("hi".to_string()));
    }

    #[test]
    fn extracts_chat_completions_delta() {
        let obj: Value =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"hi"}}]}"#).unwrap();
        assert_eq!(extract_delta_chat_completions(&obj), Some("hi".to_string()));
    }

    #[test]
    fn captures_usage_with_aliasing_and_derived_total() {
        let capture = Arc::new(Mutex::new(StreamCapture::default()));
        let obj: Value =
            serde_json::from_str(r#"{"usage":{"input_tokens":3,"output_tokens":5}}"#).unwrap();
        maybe_capture_usage(&obj, &capture);
        let c = capture.lock();
        assert_eq!(c.prompt_tokens, Some(3));
        assert_eq!(c.completion_tokens, Some(5));
        assert_eq!(c.total_tokens, Some(8));
    }

    #[test]
    fn process_events_keeps_every_token_in_a_batch() {
        let capture = Arc::new(Mutex::new(StreamCapture::default()));
        let mut done = false;
        let mut pending = VecDeque::new();
        let events = vec![
            r#"{"choices":[{"delta":{"content":"hel"}}]}"#.to_string(),
            r#"{"choices":[{"delta":{"content":"lo "}}]}"#.to_string(),
            r#"{"choices":[{"delta":{"content":"world"}}]}"#.to_string(),
        ];
        process_events(
            events,
            &capture,
            extract_delta_chat_completions,
            &mut done,
            &mut pending,
        );
        assert!(!done);
        assert_eq!(
            pending.into_iter().collect::<Vec<_>>(),
            vec!["hel".to_string(), "lo ".to_string(), "world".to_string()]
        );
    }

    #[test]
    fn process_events_stops_at_done_marker_but_keeps_earlier_tokens() {
        let capture = Arc::new(Mutex::new(StreamCapture::default()));
        let mut done = false;
        let mut pending = VecDeque::new();
        let events = vec![
            r#"{"choices":[{"delta":{"content":"last"}}]}"#.to_string(),
            "[DONE]".to_string(),
        ];
        process_events(
            events,
            &capture,
            extract_delta_chat_completions,
            &mut done,
            &mut pending,
        );
        assert!(done);
        assert_eq!(pending.into_iter().collect::<Vec<_>>(), vec!["last".to_string()]);
    }
}
