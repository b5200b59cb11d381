//! Task list view state.
//!
//! A view holds one [`TaskFilters`] value and folds user edits into it. The
//! select controls send `"all"` to mean "no filter"; text inputs send an
//! empty string to clear.

use serde::{Deserialize, Serialize};

use super::cache::QueryKey;
use crate::board::models::{TaskFilters, TaskStatus, double_option};

/// Sentinel that clears a select-style filter.
pub const ALL: &str = "all";

/// One edit to the filter state. Absent fields leave the filter unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// `Some(None)` (JSON `null`) clears the status filter.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<Option<TaskStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

fn select(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(ALL) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn text(value: String) -> Option<String> {
    Some(value).filter(|v| !v.trim().is_empty())
}

impl TaskFilters {
    pub fn apply(&mut self, update: FilterUpdate) {
        if let Some(project_id) = update.project_id {
            self.project_id = select(project_id);
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(assignee_id) = update.assignee_id {
            self.assignee_id = select(assignee_id);
        }
        if let Some(search) = update.search {
            self.search = text(search);
        }
        if let Some(due_date) = update.due_date {
            self.due_date = text(due_date);
        }
    }

    /// Builder-style [`apply`](Self::apply).
    pub fn with(mut self, update: FilterUpdate) -> Self {
        self.apply(update);
        self
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Cache key for the task list this filter state selects.
    pub fn query_key(&self, workspace_id: &str) -> QueryKey {
        QueryKey::Tasks(workspace_id.to_string(), self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> TaskFilters {
        TaskFilters {
            project_id: Some("p1".into()),
            status: Some(TaskStatus::Todo),
            assignee_id: Some("m1".into()),
            search: Some("login".into()),
            due_date: Some("2025-06-01".into()),
        }
    }

    #[test]
    fn test_all_sentinel_clears_selects() {
        let mut filters = filled();
        filters.apply(FilterUpdate {
            project_id: Some("all".into()),
            assignee_id: Some("ALL".into()),
            ..Default::default()
        });
        assert!(filters.project_id.is_none());
        assert!(filters.assignee_id.is_none());
        assert_eq!(filters.status, Some(TaskStatus::Todo));
        assert_eq!(filters.search.as_deref(), Some("login"));
    }

    #[test]
    fn test_explicit_none_clears_status() {
        let mut filters = filled();
        filters.apply(FilterUpdate {
            status: Some(None),
            ..Default::default()
        });
        assert!(filters.status.is_none());

        filters.apply(FilterUpdate {
            status: Some(Some(TaskStatus::Done)),
            ..Default::default()
        });
        assert_eq!(filters.status, Some(TaskStatus::Done));
    }

    #[test]
    fn test_empty_update_keeps_everything() {
        let mut filters = filled();
        filters.apply(FilterUpdate::default());
        assert_eq!(filters, filled());
    }

    #[test]
    fn test_empty_text_clears() {
        let filters = filled().with(FilterUpdate {
            search: Some(String::new()),
            due_date: Some("  ".into()),
            ..Default::default()
        });
        assert!(filters.search.is_none());
        assert!(filters.due_date.is_none());
        assert_eq!(filters.project_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_update_deserializes_null_status_as_clear() {
        let update: FilterUpdate = serde_json::from_str(r#"{"status": null}"#).unwrap();
        assert_eq!(update.status, Some(None));

        let update: FilterUpdate = serde_json::from_str("{}").unwrap();
        assert_eq!(update.status, None);

        let update: FilterUpdate = serde_json::from_str(r#"{"status": "in_review"}"#).unwrap();
        assert_eq!(update.status, Some(Some(TaskStatus::InReview)));
    }

    #[test]
    fn test_query_key_tracks_filters() {
        let mut filters = TaskFilters::default();
        let before = filters.query_key("w1");
        filters.apply(FilterUpdate {
            status: Some(Some(TaskStatus::Done)),
            ..Default::default()
        });
        assert_ne!(filters.query_key("w1"), before);
        filters.clear();
        assert_eq!(filters.query_key("w1"), before);
    }
}
