//! Synthetic echo generator used when no vendor is configured. Exercises
//! the full chat-orchestrator state machine (token-by-token streaming,
//! interruption, usage accounting) without a network dependency.

use futures_util::{stream, Stream};

/// Streams `"AI: {text}"` one character at a time. Each yield point is a
/// real await (`tokio::task::yield_now`), so interruption checks between
/// tokens behave the same as against a real vendor stream.
pub fn fake_chat_tokens(text: &str) -> impl Stream<Item = String> + Send + 'static {
    let reply = format!("AI: {}", text);
    let chars: Vec<String> = reply.chars().map(|c| c.to_string()).collect();
    stream::unfold(chars.into_iter(), |mut iter| async move {
        tokio::task::yield_now().await;
        iter.next().map(|c| (c, iter))
    })
}
