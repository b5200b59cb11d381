//! Interval polling of conversations and messages.
//!
//! Each stream runs in its own tokio task: fetch, apply to the shared cache
//! through a fetch ticket, then publish a fresh [`ChatSnapshot`] on a `watch`
//! channel. Dropping the [`ChatPoller`] aborts both tasks.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::cache::{QueryCache, QueryKey};
use super::http::ApiClient;
use crate::board::models::{Conversation, Message, NewMessage};
use crate::config::PollingSection;
use crate::errors::ClientError;

/// Where polled chat state comes from.
#[async_trait]
pub trait ChatSource: Send + Sync {
    async fn conversations(&self, workspace_id: &str) -> Result<Vec<Conversation>, ClientError>;
    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, ClientError>;
    async fn send(&self, input: &NewMessage) -> Result<Message, ClientError>;
}

#[async_trait]
impl ChatSource for ApiClient {
    async fn conversations(&self, workspace_id: &str) -> Result<Vec<Conversation>, ClientError> {
        self.list_conversations(workspace_id).await
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, ClientError> {
        self.list_messages(conversation_id, None).await
    }

    async fn send(&self, input: &NewMessage) -> Result<Message, ClientError> {
        self.send_message(input).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub messages: Duration,
    pub conversations: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            messages: Duration::from_secs(1),
            conversations: Duration::from_secs(5),
        }
    }
}

impl From<&PollingSection> for PollIntervals {
    fn from(section: &PollingSection) -> Self {
        Self {
            messages: Duration::from_millis(section.messages_ms.max(1)),
            conversations: Duration::from_millis(section.conversations_ms.max(1)),
        }
    }
}

/// What a chat view renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSnapshot {
    pub conversations: Vec<Conversation>,
    pub messages: Vec<Message>,
    /// Most recent failure of either stream, kept until that stream succeeds.
    pub error: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Conversations,
    Messages,
}

/// Last failure per stream. A stream only ever clears its own error.
#[derive(Debug, Default)]
struct StreamErrors {
    conversations: Option<String>,
    messages: Option<String>,
}

impl StreamErrors {
    fn slot(&mut self, stream: Stream) -> &mut Option<String> {
        match stream {
            Stream::Conversations => &mut self.conversations,
            Stream::Messages => &mut self.messages,
        }
    }

    fn current(&self) -> Option<String> {
        self.messages.clone().or_else(|| self.conversations.clone())
    }
}

#[derive(Clone)]
struct Target {
    cache: Arc<Mutex<QueryCache>>,
    errors: Arc<Mutex<StreamErrors>>,
    tx: watch::Sender<ChatSnapshot>,
    workspace_id: String,
    conversation_id: Option<String>,
}

impl Target {
    /// Record the outcome of one poll and publish.
    fn report(&self, stream: Stream, error: Option<String>) {
        *lock(&self.errors).slot(stream) = error;
        self.publish();
    }

    fn publish(&self) {
        let (conversations, messages) = {
            let cache = lock(&self.cache);
            let messages = self
                .conversation_id
                .as_deref()
                .map(|id| cache.messages(id))
                .unwrap_or_default();
            (cache.conversations(&self.workspace_id), messages)
        };
        let next = ChatSnapshot {
            conversations,
            messages,
            error: lock(&self.errors).current(),
        };
        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

pub struct ChatPoller {
    target: Target,
    rx: watch::Receiver<ChatSnapshot>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatPoller {
    /// Start polling a workspace's conversations and, if given, one
    /// conversation's messages.
    pub fn start<S>(
        source: Arc<S>,
        cache: Arc<Mutex<QueryCache>>,
        workspace_id: impl Into<String>,
        conversation_id: Option<String>,
        intervals: PollIntervals,
    ) -> Self
    where
        S: ChatSource + 'static,
    {
        let (tx, rx) = watch::channel(ChatSnapshot::default());
        let target = Target {
            cache,
            errors: Arc::new(Mutex::new(StreamErrors::default())),
            tx,
            workspace_id: workspace_id.into(),
            conversation_id,
        };

        let mut tasks = vec![tokio::spawn(poll_conversations(
            source.clone(),
            target.clone(),
            intervals.conversations,
        ))];
        if let Some(conversation_id) = target.conversation_id.clone() {
            tasks.push(tokio::spawn(poll_messages(
                source,
                target.clone(),
                conversation_id,
                intervals.messages,
            )));
        }
        debug!(workspace_id = %target.workspace_id, streams = tasks.len(), "Chat polling started");

        Self { target, rx, tasks }
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.rx.clone()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.rx.borrow().clone()
    }

    /// Send a message and show it immediately, ahead of the next poll.
    pub async fn send<S: ChatSource>(
        &self,
        source: &S,
        input: NewMessage,
    ) -> Result<Message, ClientError> {
        let message = source.send(&input).await?;
        lock(&self.target.cache).add_optimistic_message(message.clone());
        self.target.publish();
        Ok(message)
    }

    pub fn stop(self) {}
}

impl Drop for ChatPoller {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn poll_conversations<S: ChatSource>(source: Arc<S>, target: Target, period: Duration) {
    let key = QueryKey::Conversations(target.workspace_id.clone());
    let mut ticks = interval(period);
    loop {
        ticks.tick().await;
        let ticket = lock(&target.cache).begin_fetch(&key);
        match source.conversations(&target.workspace_id).await {
            Ok(conversations) => {
                lock(&target.cache).complete_fetch(ticket, &conversations);
                target.report(Stream::Conversations, None);
            }
            Err(e) => {
                warn!(error = %e, workspace_id = %target.workspace_id, "Conversation poll failed");
                target.report(Stream::Conversations, Some(e.to_string()));
            }
        }
    }
}

async fn poll_messages<S: ChatSource>(
    source: Arc<S>,
    target: Target,
    conversation_id: String,
    period: Duration,
) {
    let key = QueryKey::Messages(conversation_id.clone());
    let mut ticks = interval(period);
    loop {
        ticks.tick().await;
        let ticket = lock(&target.cache).begin_fetch(&key);
        match source.messages(&conversation_id).await {
            Ok(messages) => {
                lock(&target.cache).complete_fetch(ticket, &messages);
                target.report(Stream::Messages, None);
            }
            Err(e) => {
                warn!(error = %e, conversation_id = %conversation_id, "Message poll failed");
                target.report(Stream::Messages, Some(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSource {
        messages: Mutex<Vec<Message>>,
        message_calls: AtomicUsize,
        conversation_calls: AtomicUsize,
        fail: AtomicBool,
    }

    fn message(id: &str, content: &str) -> Message {
        Message {
            id: id.into(),
            conversation_id: "c1".into(),
            content: content.into(),
            sender_id: "u1".into(),
            username: Some("Ada".into()),
            avatar: Some(String::new()),
            created_at: format!("2025-01-01T00:00:0{}.000Z", id.len()),
        }
    }

    #[async_trait]
    impl ChatSource for FakeSource {
        async fn conversations(&self, workspace_id: &str) -> Result<Vec<Conversation>, ClientError> {
            self.conversation_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Conversation {
                id: "c1".into(),
                workspace_id: workspace_id.into(),
                name: "general".into(),
                member_ids: vec!["u1".into()],
                created_at: "2025-01-01T00:00:00.000Z".into(),
                updated_at: "2025-01-01T00:00:00.000Z".into(),
                last_message: None,
            }])
        }

        async fn messages(&self, _conversation_id: &str) -> Result<Vec<Message>, ClientError> {
            self.message_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClientError::Api {
                    status: 500,
                    message: "Internal server error".into(),
                });
            }
            Ok(self.messages.lock().unwrap().clone())
        }

        async fn send(&self, input: &NewMessage) -> Result<Message, ClientError> {
            let mut messages = self.messages.lock().unwrap();
            let sent = message(&format!("m{}", messages.len() + 1), &input.content);
            messages.push(sent.clone());
            Ok(sent)
        }
    }

    fn fast() -> PollIntervals {
        PollIntervals {
            messages: Duration::from_millis(10),
            conversations: Duration::from_millis(20),
        }
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<ChatSnapshot>, pred: F) -> ChatSnapshot
    where
        F: Fn(&ChatSnapshot) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if pred(&rx.borrow_and_update()) {
                    return rx.borrow().clone();
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("snapshot condition not reached in time")
    }

    #[test]
    fn test_default_intervals() {
        let intervals = PollIntervals::default();
        assert_eq!(intervals.messages, Duration::from_secs(1));
        assert_eq!(intervals.conversations, Duration::from_secs(5));
        assert_eq!(PollIntervals::from(&PollingSection::default()), intervals);
    }

    #[tokio::test]
    async fn test_poller_publishes_messages_and_conversations() {
        let source = Arc::new(FakeSource::default());
        source.messages.lock().unwrap().push(message("m1", "hi"));
        let cache = Arc::new(Mutex::new(QueryCache::new()));
        let poller = ChatPoller::start(source.clone(), cache, "w1", Some("c1".into()), fast());

        let mut rx = poller.subscribe();
        let snapshot = wait_for(&mut rx, |s| !s.messages.is_empty() && !s.conversations.is_empty()).await;
        assert_eq!(snapshot.messages[0].content, "hi");
        assert_eq!(snapshot.conversations[0].name, "general");

        // New server-side messages show up on a later tick
        source.messages.lock().unwrap().push(message("m22", "there"));
        let snapshot = wait_for(&mut rx, |s| s.messages.len() == 2).await;
        assert_eq!(snapshot.messages[1].content, "there");
    }

    #[tokio::test]
    async fn test_workspace_only_poller_skips_messages() {
        let source = Arc::new(FakeSource::default());
        let cache = Arc::new(Mutex::new(QueryCache::new()));
        let poller = ChatPoller::start(source.clone(), cache, "w1", None, fast());
        let mut rx = poller.subscribe();
        wait_for(&mut rx, |s| !s.conversations.is_empty()).await;
        assert_eq!(source.message_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_shows_message_before_next_poll() {
        let source = Arc::new(FakeSource::default());
        let cache = Arc::new(Mutex::new(QueryCache::new()));
        let slow = PollIntervals {
            messages: Duration::from_secs(60),
            conversations: Duration::from_secs(60),
        };
        let poller = ChatPoller::start(source.clone(), cache.clone(), "w1", Some("c1".into()), slow);
        let mut rx = poller.subscribe();
        // First tick of each stream fires immediately
        wait_for(&mut rx, |s| !s.conversations.is_empty()).await;
        while source.message_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let sent = poller
            .send(
                source.as_ref(),
                NewMessage {
                    conversation_id: "c1".into(),
                    content: "optimistic".into(),
                    username: None,
                    avatar: None,
                },
            )
            .await
            .unwrap();

        let snapshot = poller.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].id, sent.id);
        assert_eq!(
            snapshot.conversations[0].last_message.as_ref().map(|m| m.content.as_str()),
            Some("optimistic")
        );
        assert_eq!(cache.lock().unwrap().pending_count("c1"), 1);
    }

    #[tokio::test]
    async fn test_poll_errors_are_reported_then_cleared() {
        let source = Arc::new(FakeSource::default());
        source.fail.store(true, Ordering::SeqCst);
        let cache = Arc::new(Mutex::new(QueryCache::new()));
        let poller = ChatPoller::start(source.clone(), cache, "w1", Some("c1".into()), fast());
        let mut rx = poller.subscribe();

        let snapshot = wait_for(&mut rx, |s| s.error.is_some()).await;
        assert!(snapshot.error.unwrap().contains("500"));

        source.fail.store(false, Ordering::SeqCst);
        source.messages.lock().unwrap().push(message("m1", "back"));
        let snapshot = wait_for(&mut rx, |s| s.error.is_none() && !s.messages.is_empty()).await;
        assert_eq!(snapshot.messages[0].content, "back");
    }

    #[tokio::test]
    async fn test_conversation_success_keeps_message_error() {
        let source = Arc::new(FakeSource::default());
        source.fail.store(true, Ordering::SeqCst);
        let cache = Arc::new(Mutex::new(QueryCache::new()));
        let intervals = PollIntervals {
            messages: Duration::from_millis(50),
            conversations: Duration::from_millis(5),
        };
        let poller = ChatPoller::start(source.clone(), cache, "w1", Some("c1".into()), intervals);
        let mut rx = poller.subscribe();
        wait_for(&mut rx, |s| s.error.is_some() && !s.conversations.is_empty()).await;

        // Several conversation polls succeed while messages keep failing
        let seen = source.conversation_calls.load(Ordering::SeqCst);
        while source.conversation_calls.load(Ordering::SeqCst) < seen + 5 {
            assert!(poller.snapshot().error.is_some());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(poller.snapshot().error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_drop_stops_polling() {
        let source = Arc::new(FakeSource::default());
        let cache = Arc::new(Mutex::new(QueryCache::new()));
        let poller = ChatPoller::start(source.clone(), cache, "w1", Some("c1".into()), fast());
        let mut rx = poller.subscribe();
        wait_for(&mut rx, |s| !s.conversations.is_empty()).await;

        poller.stop();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_stop = source.message_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.message_calls.load(Ordering::SeqCst), after_stop);
    }
}
