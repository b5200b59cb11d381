//! Client-side query cache.
//!
//! Entries are keyed hierarchically so a mutation can invalidate a whole
//! family of queries by prefix. Every fetch takes a ticket carrying a
//! monotonically increasing epoch; a response is only applied if its epoch
//! is newer than the entry's, so a slow response can never overwrite a
//! fresher one.
//!
//! Sent messages are kept in an overlay until the server's list contains
//! them, then dropped from the overlay.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::board::models::{Conversation, Message, TaskFilters};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Workspaces,
    Members(String),
    Projects(String),
    Tasks(String, TaskFilters),
    Task(String),
    Conversations(String),
    Messages(String),
    Analytics(String),
    MonthlyAnalytics(String),
}

impl QueryKey {
    /// Hierarchical path used for prefix invalidation.
    pub fn path(&self) -> Vec<String> {
        match self {
            QueryKey::Workspaces => vec!["workspaces".into()],
            QueryKey::Members(ws) => vec!["members".into(), ws.clone()],
            QueryKey::Projects(ws) => vec!["projects".into(), ws.clone()],
            QueryKey::Tasks(ws, filters) => vec![
                "tasks".into(),
                ws.clone(),
                serde_json::to_string(filters).unwrap_or_default(),
            ],
            QueryKey::Task(id) => vec!["task".into(), id.clone()],
            QueryKey::Conversations(ws) => vec!["conversations".into(), ws.clone()],
            QueryKey::Messages(conv) => vec!["messages".into(), conv.clone()],
            QueryKey::Analytics(ws) => vec!["analytics".into(), ws.clone()],
            QueryKey::MonthlyAnalytics(ws) => {
                vec!["analytics".into(), ws.clone(), "monthly".into()]
            }
        }
    }

    pub fn has_prefix(&self, prefix: &[&str]) -> bool {
        let path = self.path();
        prefix.len() <= path.len() && prefix.iter().zip(&path).all(|(p, s)| p == s)
    }
}

/// Proof that a fetch was started; hand it back with the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub key: QueryKey,
    pub epoch: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    data: serde_json::Value,
    epoch: u64,
    stale: bool,
    updated_at: Instant,
}

#[derive(Debug, Default)]
pub struct QueryCache {
    entries: HashMap<QueryKey, Entry>,
    next_epoch: u64,
    pending_messages: HashMap<String, Vec<Message>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    pub fn begin_fetch(&mut self, key: &QueryKey) -> FetchTicket {
        FetchTicket {
            key: key.clone(),
            epoch: self.bump(),
        }
    }

    /// Store a response. Returns false if a newer response was already applied.
    pub fn complete_fetch<T: Serialize>(&mut self, ticket: FetchTicket, data: &T) -> bool {
        if let Some(entry) = self.entries.get(&ticket.key)
            && entry.epoch >= ticket.epoch
        {
            debug!(key = ?ticket.key, epoch = ticket.epoch, current = entry.epoch, "Dropping stale response");
            return false;
        }
        let data = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, key = ?ticket.key, "Failed to cache response");
                return false;
            }
        };
        if let QueryKey::Messages(conversation_id) = &ticket.key {
            self.reconcile_pending(conversation_id, &data);
        }
        self.entries.insert(
            ticket.key,
            Entry {
                data,
                epoch: ticket.epoch,
                stale: false,
                updated_at: Instant::now(),
            },
        );
        true
    }

    /// Write a value directly, superseding any fetch already in flight.
    pub fn set<T: Serialize>(&mut self, key: QueryKey, data: &T) {
        let ticket = self.begin_fetch(&key);
        self.complete_fetch(ticket, data);
    }

    pub fn get<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
        let entry = self.entries.get(key)?;
        serde_json::from_value(entry.data.clone()).ok()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Missing and invalidated entries both need a refetch.
    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.entries.get(key).is_none_or(|e| e.stale)
    }

    pub fn age(&self, key: &QueryKey) -> Option<std::time::Duration> {
        self.entries.get(key).map(|e| e.updated_at.elapsed())
    }

    /// Mark every entry under `prefix` stale. Returns how many were marked.
    pub fn invalidate_prefix(&mut self, prefix: &[&str]) -> usize {
        let mut count = 0;
        for (key, entry) in self.entries.iter_mut() {
            if key.has_prefix(prefix) {
                entry.stale = true;
                count += 1;
            }
        }
        count
    }

    pub fn remove(&mut self, key: &QueryKey) {
        self.entries.remove(key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending_messages.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A task was created, updated or deleted.
    pub fn task_changed(&mut self, workspace_id: &str, task_id: &str) {
        self.invalidate_prefix(&["tasks", workspace_id]);
        self.invalidate_prefix(&["task", task_id]);
        self.invalidate_prefix(&["analytics", workspace_id]);
    }

    /// A project was created, updated or deleted.
    pub fn project_changed(&mut self, workspace_id: &str) {
        self.invalidate_prefix(&["projects", workspace_id]);
        self.invalidate_prefix(&["tasks", workspace_id]);
        self.invalidate_prefix(&["analytics", workspace_id]);
    }

    pub fn workspace_changed(&mut self, workspace_id: &str) {
        self.invalidate_prefix(&["workspaces"]);
        self.invalidate_prefix(&["members", workspace_id]);
    }

    pub fn conversation_created(&mut self, workspace_id: &str) {
        self.invalidate_prefix(&["conversations", workspace_id]);
    }

    // ── Messages ──────────────────────────────────────────────────────

    /// Record a message we just sent so it shows before the next poll.
    ///
    /// Also replaces `lastMessage` on the cached conversation.
    pub fn add_optimistic_message(&mut self, message: Message) {
        let conversation_id = message.conversation_id.clone();
        let already_listed = self
            .get::<Vec<Message>>(&QueryKey::Messages(conversation_id.clone()))
            .is_some_and(|list| list.iter().any(|m| m.id == message.id));

        self.update_last_message(&message);

        if already_listed {
            return;
        }
        let pending = self.pending_messages.entry(conversation_id).or_default();
        if !pending.iter().any(|m| m.id == message.id) {
            pending.push(message);
        }
    }

    /// Rewritten entries take a fresh epoch so polls already in flight
    /// cannot put the old `lastMessage` back.
    fn update_last_message(&mut self, message: &Message) {
        let epoch = self.bump();
        for (key, entry) in self.entries.iter_mut() {
            if !matches!(key, QueryKey::Conversations(_)) {
                continue;
            }
            let Ok(mut conversations) =
                serde_json::from_value::<Vec<Conversation>>(entry.data.clone())
            else {
                continue;
            };
            let mut changed = false;
            for conversation in conversations.iter_mut() {
                if conversation.id == message.conversation_id {
                    conversation.last_message = Some(message.clone());
                    conversation.updated_at = message.created_at.clone();
                    changed = true;
                }
            }
            if changed {
                conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
                if let Ok(value) = serde_json::to_value(&conversations) {
                    entry.data = value;
                    entry.epoch = epoch;
                    entry.updated_at = Instant::now();
                }
            }
        }
    }

    fn reconcile_pending(&mut self, conversation_id: &str, data: &serde_json::Value) {
        let Some(pending) = self.pending_messages.get_mut(conversation_id) else {
            return;
        };
        let Ok(server) = serde_json::from_value::<Vec<Message>>(data.clone()) else {
            return;
        };
        pending.retain(|p| !server.iter().any(|m| m.id == p.id));
        if pending.is_empty() {
            self.pending_messages.remove(conversation_id);
        }
    }

    pub fn pending_count(&self, conversation_id: &str) -> usize {
        self.pending_messages
            .get(conversation_id)
            .map_or(0, Vec::len)
    }

    /// Server messages followed by any not-yet-listed sent messages.
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        let mut merged: Vec<Message> = self
            .get(&QueryKey::Messages(conversation_id.to_string()))
            .unwrap_or_default();
        if let Some(pending) = self.pending_messages.get(conversation_id) {
            for message in pending {
                if !merged.iter().any(|m| m.id == message.id) {
                    merged.push(message.clone());
                }
            }
        }
        merged
    }

    pub fn conversations(&self, workspace_id: &str) -> Vec<Conversation> {
        self.get(&QueryKey::Conversations(workspace_id.to_string()))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::models::TaskStatus;

    fn message(id: &str, conversation_id: &str, content: &str, at: &str) -> Message {
        Message {
            id: id.into(),
            conversation_id: conversation_id.into(),
            content: content.into(),
            sender_id: "u1".into(),
            username: Some("Ada".into()),
            avatar: Some(String::new()),
            created_at: at.into(),
        }
    }

    fn conversation(id: &str, updated_at: &str) -> Conversation {
        Conversation {
            id: id.into(),
            workspace_id: "w1".into(),
            name: id.into(),
            member_ids: vec!["u1".into()],
            created_at: "2025-01-01T00:00:00.000Z".into(),
            updated_at: updated_at.into(),
            last_message: None,
        }
    }

    #[test]
    fn test_stale_response_is_dropped() {
        let mut cache = QueryCache::new();
        let key = QueryKey::Messages("c1".into());

        let slow = cache.begin_fetch(&key);
        let fast = cache.begin_fetch(&key);
        assert!(fast.epoch > slow.epoch);

        let newer = vec![message("m1", "c1", "hi", "t1"), message("m2", "c1", "yo", "t2")];
        assert!(cache.complete_fetch(fast, &newer));
        assert!(!cache.complete_fetch(slow, &vec![message("m1", "c1", "hi", "t1")]));

        let cached: Vec<Message> = cache.get(&key).unwrap();
        assert_eq!(cached.len(), 2);
    }

    #[test]
    fn test_responses_in_order_are_applied() {
        let mut cache = QueryCache::new();
        let key = QueryKey::Workspaces;
        let first = cache.begin_fetch(&key);
        assert!(cache.complete_fetch(first, &vec!["a"]));
        let second = cache.begin_fetch(&key);
        assert!(cache.complete_fetch(second, &vec!["a", "b"]));
        assert_eq!(cache.get::<Vec<String>>(&key).unwrap().len(), 2);
    }

    #[test]
    fn test_key_paths_and_prefixes() {
        let filters = TaskFilters {
            status: Some(TaskStatus::Done),
            ..Default::default()
        };
        let key = QueryKey::Tasks("w1".into(), filters);
        assert!(key.has_prefix(&["tasks"]));
        assert!(key.has_prefix(&["tasks", "w1"]));
        assert!(!key.has_prefix(&["tasks", "w2"]));
        assert!(QueryKey::MonthlyAnalytics("w1".into()).has_prefix(&["analytics", "w1"]));
        assert!(!QueryKey::Task("t1".into()).has_prefix(&["tasks"]));
    }

    #[test]
    fn test_task_change_invalidates_lists_task_and_analytics() {
        let mut cache = QueryCache::new();
        let all = QueryKey::Tasks("w1".into(), TaskFilters::default());
        let done = QueryKey::Tasks(
            "w1".into(),
            TaskFilters {
                status: Some(TaskStatus::Done),
                ..Default::default()
            },
        );
        let other_ws = QueryKey::Tasks("w2".into(), TaskFilters::default());
        let task = QueryKey::Task("t1".into());
        let analytics = QueryKey::Analytics("w1".into());
        let conversations = QueryKey::Conversations("w1".into());
        for key in [&all, &done, &other_ws, &task, &analytics, &conversations] {
            cache.set(key.clone(), &serde_json::json!([]));
            assert!(!cache.is_stale(key));
        }

        cache.task_changed("w1", "t1");
        assert!(cache.is_stale(&all));
        assert!(cache.is_stale(&done));
        assert!(cache.is_stale(&task));
        assert!(cache.is_stale(&analytics));
        assert!(!cache.is_stale(&other_ws));
        assert!(!cache.is_stale(&conversations));
        // Invalidated data stays readable until refetched
        assert!(cache.get::<serde_json::Value>(&all).is_some());
    }

    #[test]
    fn test_missing_entry_is_stale() {
        let cache = QueryCache::new();
        assert!(cache.is_stale(&QueryKey::Workspaces));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_optimistic_message_merges_and_dedups() {
        let mut cache = QueryCache::new();
        let key = QueryKey::Messages("c1".into());
        cache.set(key.clone(), &vec![message("m1", "c1", "hi", "t1")]);

        let sent = message("m2", "c1", "mine", "t2");
        cache.add_optimistic_message(sent.clone());
        cache.add_optimistic_message(sent.clone());
        let merged = cache.messages("c1");
        assert_eq!(
            merged.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2"]
        );
        assert_eq!(cache.pending_count("c1"), 1);

        // Next poll includes the sent message plus a newer reply
        let ticket = cache.begin_fetch(&key);
        cache.complete_fetch(
            ticket,
            &vec![
                message("m1", "c1", "hi", "t1"),
                message("m2", "c1", "mine", "t2"),
                message("m3", "c1", "reply", "t3"),
            ],
        );
        assert_eq!(cache.pending_count("c1"), 0);
        let merged = cache.messages("c1");
        assert_eq!(
            merged.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2", "m3"]
        );
    }

    #[test]
    fn test_optimistic_message_survives_stale_poll() {
        let mut cache = QueryCache::new();
        let key = QueryKey::Messages("c1".into());
        let in_flight = cache.begin_fetch(&key);

        cache.add_optimistic_message(message("m1", "c1", "mine", "t1"));
        // Poll that started before the send comes back without it
        cache.complete_fetch(in_flight, &Vec::<Message>::new());
        assert_eq!(cache.messages("c1").len(), 1);
    }

    #[test]
    fn test_last_message_survives_stale_conversation_poll() {
        let mut cache = QueryCache::new();
        let key = QueryKey::Conversations("w1".into());
        cache.set(key.clone(), &vec![conversation("c1", "2025-01-01T00:00:00.000Z")]);
        let in_flight = cache.begin_fetch(&key);

        cache.add_optimistic_message(message("m1", "c1", "hi", "2025-01-03T00:00:00.000Z"));
        let applied = cache.complete_fetch(
            in_flight,
            &vec![conversation("c1", "2025-01-01T00:00:00.000Z")],
        );
        assert!(!applied);
        let conversations = cache.conversations("w1");
        assert_eq!(
            conversations[0].last_message.as_ref().map(|m| m.id.as_str()),
            Some("m1")
        );

        // A poll started after the send is applied as usual
        let fresh = cache.begin_fetch(&key);
        let mut listed = conversation("c1", "2025-01-03T00:00:00.000Z");
        listed.last_message = Some(message("m1", "c1", "hi", "2025-01-03T00:00:00.000Z"));
        assert!(cache.complete_fetch(fresh, &vec![listed]));
    }

    #[test]
    fn test_send_replaces_last_message_and_reorders() {
        let mut cache = QueryCache::new();
        let key = QueryKey::Conversations("w1".into());
        cache.set(
            key.clone(),
            &vec![
                conversation("c2", "2025-01-02T00:00:00.000Z"),
                conversation("c1", "2025-01-01T00:00:00.000Z"),
            ],
        );

        cache.add_optimistic_message(message("m1", "c1", "hi", "2025-01-03T00:00:00.000Z"));
        let conversations = cache.conversations("w1");
        assert_eq!(conversations[0].id, "c1");
        assert_eq!(
            conversations[0].last_message.as_ref().map(|m| m.content.as_str()),
            Some("hi")
        );
        assert!(conversations[1].last_message.is_none());
    }
}
