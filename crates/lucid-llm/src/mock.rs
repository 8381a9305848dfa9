use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use lucid_core::errors::InferenceError;
use lucid_core::history::HistoryEntry;

use crate::provider::InferenceProvider;

/// Pre-programmed replies for deterministic testing without a backend.
pub enum MockReply {
    Text(String),
    Error(InferenceError),
    /// Wait a duration, then yield the inner reply.
    Delayed(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(s: &str) -> Self {
        Self::Text(s.to_string())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delayed(delay, Box::new(inner))
    }
}

/// Mock provider that consumes replies in order and records every
/// transcript it was asked to complete.
pub struct MockProvider {
    replies: Mutex<VecDeque<MockReply>>,
    contexts: Mutex<Vec<Vec<HistoryEntry>>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            contexts: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Transcripts passed to `complete`, in call order.
    pub fn recorded_contexts(&self) -> Vec<Vec<HistoryEntry>> {
        self.contexts.lock().clone()
    }

    /// Queue another reply after construction.
    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }
}

#[async_trait]
impl InferenceProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        Ok(vec!["mock-model".to_string()])
    }

    async fn complete(&self, entries: &[HistoryEntry]) -> Result<String, InferenceError> {
        let call = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.contexts.lock().push(entries.to_vec());

        let reply = self.replies.lock().pop_front();
        let Some(reply) = reply else {
            return Err(InferenceError::InvalidRequest(format!(
                "no mock reply configured for call {call}"
            )));
        };

        // Unroll nested delays iteratively to avoid recursive async.
        let mut current = reply;
        loop {
            match current {
                MockReply::Text(text) => return Ok(text),
                MockReply::Error(e) => return Err(e),
                MockReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    current = *inner;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_consumed_in_order() {
        let mock = MockProvider::new(vec![MockReply::text("first"), MockReply::text("second")]);

        assert_eq!(mock.complete(&[]).await.unwrap(), "first");
        assert_eq!(mock.complete(&[]).await.unwrap(), "second");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_replies_error() {
        let mock = MockProvider::new(vec![MockReply::text("only one")]);
        let _ = mock.complete(&[]).await;
        assert!(matches!(
            mock.complete(&[]).await,
            Err(InferenceError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn error_reply_propagates() {
        let mock = MockProvider::new(vec![MockReply::Error(InferenceError::NoModels)]);
        assert!(matches!(
            mock.complete(&[]).await,
            Err(InferenceError::NoModels)
        ));
    }

    #[tokio::test]
    async fn contexts_are_recorded() {
        let mock = MockProvider::new(vec![MockReply::text("ok")]);
        let entries = vec![HistoryEntry::user("hello")];
        mock.complete(&entries).await.unwrap();

        let recorded = mock.recorded_contexts();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0][0].content, "hello");
    }

    #[tokio::test]
    async fn delayed_reply_waits() {
        tokio::time::pause();
        let mock = MockProvider::new(vec![MockReply::delayed(
            Duration::from_secs(5),
            MockReply::text("late"),
        )]);

        let fut = mock.complete(&[]);
        tokio::pin!(fut);
        assert!(futures_poll_once(fut.as_mut()).await.is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(fut.await.unwrap(), "late");
    }

    async fn futures_poll_once<F: std::future::Future>(
        fut: std::pin::Pin<&mut F>,
    ) -> Option<F::Output> {
        use std::task::Poll;
        let mut fut = Some(fut);
        std::future::poll_fn(move |cx| {
            let inner = fut.take().expect("polled twice");
            match inner.poll(cx) {
                Poll::Ready(out) => Poll::Ready(Some(out)),
                Poll::Pending => Poll::Ready(None),
            }
        })
        .await
    }

    #[tokio::test]
    async fn push_reply_after_construction() {
        let mock = MockProvider::new(vec![]);
        mock.push_reply(MockReply::text("appended"));
        assert_eq!(mock.complete(&[]).await.unwrap(), "appended");
    }

    #[tokio::test]
    async fn mock_lists_one_model() {
        let mock = MockProvider::new(vec![]);
        assert_eq!(mock.list_models().await.unwrap(), vec!["mock-model"]);
    }
}
