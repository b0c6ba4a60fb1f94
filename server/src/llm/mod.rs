//! The upstream LLM streaming client. Dispatches between the synthetic
//! echo generator (used in tests and when no vendor is configured) and a
//! real OpenAI-compatible vendor, behind one `Stream<Item = Result<...>>`
//! so the chat orchestrator doesn't care which one it's driving.

pub mod sse;
pub mod synthetic;
pub mod vendor;

use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;

use crate::config::LlmConfig;
use crate::error::SessionError;
use vendor::{Api, VendorClient};

/// Accumulates provider/model identity and token usage over the course
/// of one chat stream. Shared with the streaming implementation so usage
/// fields can be filled in as they're observed (vendor responses report
/// usage inline with the stream, not as a trailing summary call).
#[derive(Debug, Clone, Default)]
pub struct StreamCapture {
    pub provider: String,
    pub api: String,
    pub model: String,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

/// Opens a token stream for `text` per `cfg`. Returns the stream and the
/// shared capture handle the caller should read from once the stream is
/// exhausted.
pub async fn stream_chat_tokens(
    cfg: &LlmConfig,
    text: &str,
) -> Result<(BoxStream<'static, Result<String, SessionError>>, Arc<Mutex<StreamCapture>>), SessionError>
{
    let capture = Arc::new(Mutex::new(StreamCapture::default()));

    if cfg.mode != "openai" {
        {
            let mut c = capture.lock();
            c.provider = "fake".to_string();
            c.api = "fake".to_string();
            c.model = "fake".to_string();
        }
        let stream = synthetic::fake_chat_tokens(text).map(Ok).boxed();
        return Ok((stream, capture));
    }

    {
        let mut c = capture.lock();
        c.provider = "openai_compatible".to_string();
        c.model = cfg.model.clone();
    }

    let client = VendorClient::new(cfg)?;
    let api = Api::parse(&cfg.api);
    let stream = client.stream(text, api, capture.clone()).await?.boxed();
    Ok((stream, capture))
}
