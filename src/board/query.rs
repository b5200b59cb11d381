//! Typed filter conditions for task listings.
//!
//! Conditions are ANDed together and compiled to a parameterised `WHERE`
//! clause. Column names come from the `TaskField` enum only, so user input
//! never reaches the SQL text.

use super::models::TaskStatus;

/// SQL function registered on every board connection that lowercases with
/// full Unicode case mapping. SQLite's own `lower()` folds ASCII only.
pub const FOLD_CASE_FN: &str = "fold_case";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskField {
    WorkspaceId,
    ProjectId,
    Status,
    AssigneeId,
    DueDate,
    Name,
    CreatedAt,
}

impl TaskField {
    fn column(&self) -> &'static str {
        match self {
            Self::WorkspaceId => "workspace_id",
            Self::ProjectId => "project_id",
            Self::Status => "status",
            Self::AssigneeId => "assignee_id",
            Self::DueDate => "due_date",
            Self::Name => "name",
            Self::CreatedAt => "created_at",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Equal(TaskField, String),
    NotEqual(TaskField, String),
    LessThan(TaskField, String),
    /// Inclusive lower bound, exclusive upper bound.
    Between(TaskField, String, String),
    /// Case-insensitive substring match.
    Search(TaskField, String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskQuery {
    conditions: Vec<Condition>,
}

impl TaskQuery {
    /// Every task query is scoped to a workspace.
    pub fn workspace(workspace_id: impl Into<String>) -> Self {
        Self {
            conditions: vec![Condition::Equal(TaskField::WorkspaceId, workspace_id.into())],
        }
    }

    pub fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn equal(self, field: TaskField, value: impl Into<String>) -> Self {
        self.with(Condition::Equal(field, value.into()))
    }

    /// Adds an equality condition only when a non-empty value is present.
    pub fn equal_opt(self, field: TaskField, value: Option<&str>) -> Self {
        match value.filter(|v| !v.is_empty()) {
            Some(v) => self.equal(field, v),
            None => self,
        }
    }

    pub fn status(self, status: TaskStatus) -> Self {
        self.equal(TaskField::Status, status.as_str())
    }

    pub fn not_status(self, status: TaskStatus) -> Self {
        self.with(Condition::NotEqual(TaskField::Status, status.as_str().to_string()))
    }

    pub fn less_than(self, field: TaskField, value: impl Into<String>) -> Self {
        self.with(Condition::LessThan(field, value.into()))
    }

    pub fn between(self, field: TaskField, from: impl Into<String>, until: impl Into<String>) -> Self {
        self.with(Condition::Between(field, from.into(), until.into()))
    }

    pub fn search(self, field: TaskField, term: Option<&str>) -> Self {
        match term.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => self.with(Condition::Search(field, t.to_string())),
            None => self,
        }
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Compile to a `WHERE` clause body and its positional parameters.
    ///
    /// An empty query compiles to `1 = 1`.
    pub fn to_sql(&self) -> (String, Vec<String>) {
        let mut clauses = Vec::with_capacity(self.conditions.len());
        let mut params: Vec<String> = Vec::new();

        for condition in &self.conditions {
            match condition {
                Condition::Equal(field, value) => {
                    params.push(value.clone());
                    clauses.push(format!("{} = ?{}", field.column(), params.len()));
                }
                Condition::NotEqual(field, value) => {
                    params.push(value.clone());
                    clauses.push(format!("{} != ?{}", field.column(), params.len()));
                }
                Condition::LessThan(field, value) => {
                    params.push(value.clone());
                    clauses.push(format!("{} < ?{}", field.column(), params.len()));
                }
                Condition::Between(field, from, until) => {
                    params.push(from.clone());
                    let lower = params.len();
                    params.push(until.clone());
                    clauses.push(format!(
                        "{col} >= ?{lower} AND {col} < ?{upper}",
                        col = field.column(),
                        upper = params.len()
                    ));
                }
                Condition::Search(field, term) => {
                    params.push(term.clone());
                    clauses.push(format!(
                        "instr({fold}({}), {fold}(?{})) > 0",
                        field.column(),
                        params.len(),
                        fold = FOLD_CASE_FN
                    ));
                }
            }
        }

        if clauses.is_empty() {
            ("1 = 1".to_string(), params)
        } else {
            (clauses.join(" AND "), params)
        }
    }
}
