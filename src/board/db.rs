use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use super::models::*;
use super::query::{FOLD_CASE_FN, TaskQuery};
use crate::errors::{BoardError, BoardResult};

/// Async-safe handle to the board database.
///
/// Wraps `BoardDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BoardDb>>,
}

impl DbHandle {
    pub fn new(db: BoardDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BoardDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Like `call`, for repository operations that return typed board errors.
    pub async fn run<F, R>(&self, f: F) -> BoardResult<R>
    where
        F: FnOnce(&BoardDb) -> BoardResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| BoardError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| BoardError::Internal(anyhow::anyhow!("DB task panicked: {}", e)))?
    }

    /// Acquire the database mutex synchronously. Used at startup and in
    /// tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, BoardDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send>;

pub struct BoardDb {
    conn: Connection,
    clock: Clock,
}

const USER_COLUMNS: &str = "id, name, email, created_at";
const WORKSPACE_COLUMNS: &str =
    "id, name, user_id, image_url, invite_code, created_at, updated_at";
const MEMBER_COLUMNS: &str = "id, workspace_id, user_id, role, name, created_at, updated_at";
const PROJECT_COLUMNS: &str = "id, workspace_id, name, image_url, created_at, updated_at";
const TASK_COLUMNS: &str = "id, workspace_id, project_id, name, status, due_date, assignee_id, position, description, created_at, updated_at";
const CONVERSATION_COLUMNS: &str = "id, workspace_id, name, member_ids, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, content, sender_id, username, avatar, created_at";

/// Gap between neighbouring task positions within a status column.
pub const POSITION_GAP: i64 = 1000;

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// `?start, ?start+1, ...` for an `IN (...)` list of `count` values.
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    what: &str,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.with_context(|| format!("Failed to read {} row", what))?);
    }
    Ok(out)
}

impl BoardDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self {
            conn,
            clock: Box::new(Utc::now),
        };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self {
            conn,
            clock: Box::new(Utc::now),
        };
        db.init()?;
        Ok(db)
    }

    /// Replace the clock used for system timestamps and analytics windows.
    pub fn set_clock<F>(&mut self, clock: F)
    where
        F: Fn() -> DateTime<Utc> + Send + 'static,
    {
        self.clock = Box::new(clock);
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn now_ts(&self) -> String {
        timestamp(self.now())
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.conn
            .create_scalar_function(
                FOLD_CASE_FN,
                1,
                FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
                |ctx| Ok(ctx.get::<Option<String>>(0)?.map(|s| s.to_lowercase())),
            )
            .context("Failed to register case folding function")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    email TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    token TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workspaces (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    image_url TEXT,
                    invite_code TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS members (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL,
                    role TEXT NOT NULL DEFAULT 'member',
                    name TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(workspace_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    image_url TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'backlog',
                    due_date TEXT,
                    assignee_id TEXT REFERENCES members(id) ON DELETE SET NULL,
                    position INTEGER NOT NULL DEFAULT 1000,
                    description TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    member_ids TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    content TEXT NOT NULL,
                    sender_id TEXT NOT NULL,
                    username TEXT,
                    avatar TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
                CREATE INDEX IF NOT EXISTS idx_members_user ON members(user_id);
                CREATE INDEX IF NOT EXISTS idx_projects_workspace ON projects(workspace_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_workspace ON tasks(workspace_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(workspace_id, status);
                CREATE INDEX IF NOT EXISTS idx_conversations_workspace ON conversations(workspace_id);
                CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users & sessions ──────────────────────────────────────────────

    /// Create the user for `email`, or refresh its display name.
    pub fn upsert_user(&self, name: &str, email: &str) -> Result<User> {
        self.conn
            .execute(
                "INSERT INTO users (id, name, email, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(email) DO UPDATE SET name = excluded.name",
                params![new_id(), name, email, self.now_ts()],
            )
            .context("Failed to upsert user")?;
        self.conn
            .query_row(
                &format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS),
                params![email],
                read_user,
            )
            .context("User not found after upsert")
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                params![id],
                read_user,
            )
            .optional()
            .context("Failed to query user")
    }

    pub fn create_session(&self, user_id: &str) -> Result<Session> {
        let session = Session {
            token: format!("{}{}", new_id(), new_id()),
            user_id: user_id.to_string(),
            created_at: self.now_ts(),
        };
        self.conn
            .execute(
                "INSERT INTO sessions (token, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![session.token, session.user_id, session.created_at],
            )
            .context("Failed to insert session")?;
        Ok(session)
    }

    pub fn user_for_token(&self, token: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT u.id, u.name, u.email, u.created_at
                 FROM sessions s JOIN users u ON u.id = s.user_id
                 WHERE s.token = ?1",
                params![token],
                read_user,
            )
            .optional()
            .context("Failed to resolve session")
    }

    pub fn delete_session(&self, token: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .context("Failed to delete session")?;
        Ok(count > 0)
    }

    // ── Workspaces ────────────────────────────────────────────────────

    /// Create a workspace and make `owner` its admin member in one transaction.
    pub fn create_workspace(
        &self,
        name: &str,
        image_url: Option<&str>,
        owner: &User,
        invite_code: &str,
    ) -> Result<(Workspace, Member)> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let now = self.now_ts();
        let workspace_id = new_id();
        let member_id = new_id();

        tx.execute(
            "INSERT INTO workspaces (id, name, user_id, image_url, invite_code, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![workspace_id, name, owner.id, image_url, invite_code, now],
        )
        .context("Failed to insert workspace")?;
        tx.execute(
            "INSERT INTO members (id, workspace_id, user_id, role, name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                member_id,
                workspace_id,
                owner.id,
                MemberRole::Admin.as_str(),
                owner.name,
                now
            ],
        )
        .context("Failed to insert admin member")?;
        tx.commit().context("Failed to commit workspace creation")?;

        let workspace = self
            .get_workspace(&workspace_id)?
            .context("Workspace not found after insert")?;
        let member = self
            .get_member_by_id(&member_id)?
            .context("Member not found after insert")?;
        Ok((workspace, member))
    }

    pub fn get_workspace(&self, id: &str) -> Result<Option<Workspace>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM workspaces WHERE id = ?1", WORKSPACE_COLUMNS),
                params![id],
                read_workspace,
            )
            .optional()
            .context("Failed to query workspace")
    }

    pub fn list_workspaces_for_user(&self, user_id: &str) -> Result<Vec<Workspace>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT w.id, w.name, w.user_id, w.image_url, w.invite_code, w.created_at, w.updated_at
                 FROM workspaces w JOIN members m ON m.workspace_id = w.id
                 WHERE m.user_id = ?1
                 ORDER BY w.created_at DESC, w.rowid DESC",
            )
            .context("Failed to prepare list_workspaces_for_user")?;
        let rows = stmt
            .query_map(params![user_id], read_workspace)
            .context("Failed to query workspaces")?;
        collect_rows(rows, "workspace")
    }

    pub fn update_workspace(
        &self,
        id: &str,
        name: Option<&str>,
        image_url: Option<Option<&str>>,
    ) -> Result<Workspace> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let now = self.now_ts();
        if let Some(n) = name {
            tx.execute(
                "UPDATE workspaces SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![n, now, id],
            )
            .context("Failed to update workspace name")?;
        }
        if let Some(img) = image_url {
            tx.execute(
                "UPDATE workspaces SET image_url = ?1, updated_at = ?2 WHERE id = ?3",
                params![img, now, id],
            )
            .context("Failed to update workspace image")?;
        }
        tx.commit().context("Failed to commit workspace update")?;
        self.get_workspace(id)?
            .context("Workspace not found after update")
    }

    pub fn set_invite_code(&self, id: &str, code: &str) -> Result<Workspace> {
        self.conn
            .execute(
                "UPDATE workspaces SET invite_code = ?1, updated_at = ?2 WHERE id = ?3",
                params![code, self.now_ts(), id],
            )
            .context("Failed to update invite code")?;
        self.get_workspace(id)?
            .context("Workspace not found after invite code reset")
    }

    /// Delete a workspace; members, projects, tasks and chat cascade.
    pub fn delete_workspace(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM workspaces WHERE id = ?1", params![id])
            .context("Failed to delete workspace")?;
        Ok(count > 0)
    }

    // ── Members ───────────────────────────────────────────────────────

    /// Membership lookup for `(workspace, user)`.
    pub fn get_member(&self, workspace_id: &str, user_id: &str) -> Result<Option<Member>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM members WHERE workspace_id = ?1 AND user_id = ?2",
                    MEMBER_COLUMNS
                ),
                params![workspace_id, user_id],
                read_member_row,
            )
            .optional()
            .context("Failed to query member")?;
        row.map(MemberRow::into_member).transpose()
    }

    pub fn get_member_by_id(&self, id: &str) -> Result<Option<Member>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM members WHERE id = ?1", MEMBER_COLUMNS),
                params![id],
                read_member_row,
            )
            .optional()
            .context("Failed to query member")?;
        row.map(MemberRow::into_member).transpose()
    }

    pub fn create_member(
        &self,
        workspace_id: &str,
        user_id: &str,
        role: MemberRole,
        name: &str,
    ) -> Result<Member> {
        let id = new_id();
        let now = self.now_ts();
        self.conn
            .execute(
                "INSERT INTO members (id, workspace_id, user_id, role, name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![id, workspace_id, user_id, role.as_str(), name, now],
            )
            .context("Failed to insert member")?;
        self.get_member_by_id(&id)?
            .context("Member not found after insert")
    }

    /// Remove a membership; tasks assigned to it become unassigned.
    pub fn delete_member(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM members WHERE id = ?1", params![id])
            .context("Failed to delete member")?;
        Ok(count > 0)
    }

    pub fn count_admins(&self, workspace_id: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM members WHERE workspace_id = ?1 AND role = 'admin'",
                params![workspace_id],
                |row| row.get(0),
            )
            .context("Failed to count admins")?;
        Ok(count as usize)
    }

    /// Members of a workspace joined with their users' emails.
    pub fn list_member_details(&self, workspace_id: &str) -> Result<Vec<MemberDetail>> {
        self.query_member_details("m.workspace_id = ?1", vec![workspace_id.to_string()])
    }

    /// Batched member lookup by member id; unknown ids are skipped.
    pub fn member_details_by_ids(&self, ids: &[String]) -> Result<Vec<MemberDetail>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.query_member_details(
            &format!("m.id IN ({})", placeholders(1, ids.len())),
            ids.to_vec(),
        )
    }

    fn query_member_details(&self, filter: &str, values: Vec<String>) -> Result<Vec<MemberDetail>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT m.id, m.workspace_id, m.user_id, m.role, m.name, m.created_at, m.updated_at, u.email
                 FROM members m LEFT JOIN users u ON u.id = m.user_id
                 WHERE {}
                 ORDER BY m.created_at, m.rowid",
                filter
            ))
            .context("Failed to prepare member details query")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((read_member_row(row)?, row.get::<_, Option<String>>(7)?))
            })
            .context("Failed to query member details")?;
        collect_rows(rows, "member")?
            .into_iter()
            .map(|(row, email)| {
                Ok(MemberDetail {
                    member: row.into_member()?,
                    email,
                })
            })
            .collect()
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(
        &self,
        workspace_id: &str,
        name: &str,
        image_url: Option<&str>,
    ) -> Result<Project> {
        let id = new_id();
        let now = self.now_ts();
        self.conn
            .execute(
                "INSERT INTO projects (id, workspace_id, name, image_url, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, workspace_id, name, image_url, now],
            )
            .context("Failed to insert project")?;
        self.get_project(&id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
                params![id],
                read_project,
            )
            .optional()
            .context("Failed to query project")
    }

    pub fn list_projects(&self, workspace_id: &str) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM projects WHERE workspace_id = ?1 ORDER BY created_at DESC, rowid DESC",
                PROJECT_COLUMNS
            ))
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map(params![workspace_id], read_project)
            .context("Failed to query projects")?;
        collect_rows(rows, "project")
    }

    /// Batched project lookup; unknown ids are skipped.
    pub fn get_projects_by_ids(&self, ids: &[String]) -> Result<Vec<Project>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM projects WHERE id IN ({})",
                PROJECT_COLUMNS,
                placeholders(1, ids.len())
            ))
            .context("Failed to prepare get_projects_by_ids")?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), read_project)
            .context("Failed to query projects")?;
        collect_rows(rows, "project")
    }

    pub fn count_projects(&self, workspace_id: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM projects WHERE workspace_id = ?1",
                params![workspace_id],
                |row| row.get(0),
            )
            .context("Failed to count projects")?;
        Ok(count as usize)
    }

    pub fn update_project(
        &self,
        id: &str,
        name: Option<&str>,
        image_url: Option<Option<&str>>,
    ) -> Result<Project> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let now = self.now_ts();
        if let Some(n) = name {
            tx.execute(
                "UPDATE projects SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![n, now, id],
            )
            .context("Failed to update project name")?;
        }
        if let Some(img) = image_url {
            tx.execute(
                "UPDATE projects SET image_url = ?1, updated_at = ?2 WHERE id = ?3",
                params![img, now, id],
            )
            .context("Failed to update project image")?;
        }
        tx.commit().context("Failed to commit project update")?;
        self.get_project(id)?
            .context("Project not found after update")
    }

    pub fn delete_project(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .context("Failed to delete project")?;
        Ok(count > 0)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    /// Insert a task at the end of its status column.
    ///
    /// The position is the highest position in the same (workspace, status)
    /// plus `POSITION_GAP`, or `POSITION_GAP` for an empty column. Reading the
    /// maximum and inserting happen in one transaction.
    pub fn insert_task(&self, task: &NewTask) -> Result<Task> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let max_pos: Option<i64> = tx
            .query_row(
                "SELECT MAX(position) FROM tasks WHERE workspace_id = ?1 AND status = ?2",
                params![task.workspace_id, task.status.as_str()],
                |row| row.get(0),
            )
            .context("Failed to get max position")?;
        let position = max_pos.map_or(POSITION_GAP, |p| p + POSITION_GAP);

        let id = new_id();
        let now = self.now_ts();
        tx.execute(
            "INSERT INTO tasks (id, workspace_id, project_id, name, status, due_date, assignee_id, position, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                id,
                task.workspace_id,
                task.project_id,
                task.name,
                task.status.as_str(),
                task.due_date,
                task.assignee_id,
                position,
                task.description,
                now
            ],
        )
        .context("Failed to insert task")?;
        tx.commit().context("Failed to commit task insert")?;

        self.get_task(&id)?.context("Task not found after insert")
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                read_task_row,
            )
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Tasks matching every condition, newest first.
    pub fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>> {
        let (filter, values) = query.to_sql();
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM tasks WHERE {} ORDER BY created_at DESC, rowid DESC",
                TASK_COLUMNS, filter
            ))
            .context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), read_task_row)
            .context("Failed to query tasks")?;
        collect_rows(rows, "task")?
            .into_iter()
            .map(TaskRow::into_task)
            .collect()
    }

    pub fn count_tasks(&self, query: &TaskQuery) -> Result<usize> {
        let (filter, values) = query.to_sql();
        let count: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM tasks WHERE {}", filter),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )
            .context("Failed to count tasks")?;
        Ok(count as usize)
    }

    /// Apply the provided fields of `patch`. `assigneeId` must already be
    /// resolved (the `assignedToId` alias is ignored here).
    pub fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<Task> {
        // Use unchecked_transaction so all updates are atomic.
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let now = self.now_ts();

        if let Some(name) = &patch.name {
            tx.execute(
                "UPDATE tasks SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, now, id],
            )
            .context("Failed to update task name")?;
        }
        if let Some(status) = patch.status {
            tx.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )
            .context("Failed to update task status")?;
        }
        if let Some(project_id) = &patch.project_id {
            tx.execute(
                "UPDATE tasks SET project_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![project_id, now, id],
            )
            .context("Failed to update task project")?;
        }
        if let Some(due_date) = &patch.due_date {
            tx.execute(
                "UPDATE tasks SET due_date = ?1, updated_at = ?2 WHERE id = ?3",
                params![due_date, now, id],
            )
            .context("Failed to update task due date")?;
        }
        if let Some(assignee_id) = &patch.assignee_id {
            tx.execute(
                "UPDATE tasks SET assignee_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![assignee_id, now, id],
            )
            .context("Failed to update task assignee")?;
        }
        if let Some(description) = &patch.description {
            tx.execute(
                "UPDATE tasks SET description = ?1, updated_at = ?2 WHERE id = ?3",
                params![description, now, id],
            )
            .context("Failed to update task description")?;
        }
        if let Some(position) = patch.position {
            tx.execute(
                "UPDATE tasks SET position = ?1, updated_at = ?2 WHERE id = ?3",
                params![position, now, id],
            )
            .context("Failed to update task position")?;
        }

        tx.commit().context("Failed to commit task update")?;
        self.get_task(id)?.context("Task not found after update")
    }

    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .context("Failed to delete task")?;
        Ok(count > 0)
    }

    // ── Conversations & messages ──────────────────────────────────────

    pub fn create_conversation(
        &self,
        workspace_id: &str,
        name: &str,
        member_ids: &[String],
    ) -> Result<Conversation> {
        let id = new_id();
        let now = self.now_ts();
        let members_json =
            serde_json::to_string(member_ids).context("Failed to serialize member ids")?;
        self.conn
            .execute(
                "INSERT INTO conversations (id, workspace_id, name, member_ids, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, workspace_id, name, members_json, now],
            )
            .context("Failed to insert conversation")?;
        self.get_conversation(&id)?
            .context("Conversation not found after insert")
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS),
                params![id],
                read_conversation_row,
            )
            .optional()
            .context("Failed to query conversation")?;
        row.map(ConversationRow::into_conversation).transpose()
    }

    /// Conversations in a workspace that include `user_id`, most recently
    /// active first, each carrying its latest message.
    pub fn list_conversations_for_user(
        &self,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<Vec<Conversation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.id, c.workspace_id, c.name, c.member_ids, c.created_at, c.updated_at
                 FROM conversations c
                 WHERE c.workspace_id = ?1
                   AND EXISTS (SELECT 1 FROM json_each(c.member_ids) WHERE json_each.value = ?2)
                 ORDER BY c.updated_at DESC, c.rowid DESC",
            )
            .context("Failed to prepare list_conversations_for_user")?;
        let rows = stmt
            .query_map(params![workspace_id, user_id], read_conversation_row)
            .context("Failed to query conversations")?;
        let mut conversations = collect_rows(rows, "conversation")?
            .into_iter()
            .map(ConversationRow::into_conversation)
            .collect::<Result<Vec<_>>>()?;

        let ids: Vec<String> = conversations.iter().map(|c| c.id.clone()).collect();
        let mut last = self.last_messages(&ids)?;
        for conversation in &mut conversations {
            conversation.last_message = last.remove(&conversation.id);
        }
        Ok(conversations)
    }

    /// Latest message per conversation in a single grouped query.
    pub fn last_messages(&self, conversation_ids: &[String]) -> Result<HashMap<String, Message>> {
        if conversation_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT m.id, m.conversation_id, m.content, m.sender_id, m.username, m.avatar, m.created_at
                 FROM messages m
                 WHERE m.conversation_id IN ({})
                   AND m.rowid = (
                       SELECT m2.rowid FROM messages m2
                       WHERE m2.conversation_id = m.conversation_id
                       ORDER BY m2.created_at DESC, m2.rowid DESC
                       LIMIT 1
                   )",
                placeholders(1, conversation_ids.len())
            ))
            .context("Failed to prepare last_messages")?;
        let rows = stmt
            .query_map(params_from_iter(conversation_ids.iter()), read_message)
            .context("Failed to query last messages")?;
        Ok(collect_rows(rows, "message")?
            .into_iter()
            .map(|m| (m.conversation_id.clone(), m))
            .collect())
    }

    /// Store a message and bump the conversation's `updated_at`.
    pub fn insert_message(
        &self,
        conversation_id: &str,
        content: &str,
        sender_id: &str,
        username: &str,
        avatar: &str,
    ) -> Result<Message> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let id = new_id();
        let now = self.now_ts();
        tx.execute(
            "INSERT INTO messages (id, conversation_id, content, sender_id, username, avatar, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, conversation_id, content, sender_id, username, avatar, now],
        )
        .context("Failed to insert message")?;
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now, conversation_id],
        )
        .context("Failed to bump conversation")?;
        tx.commit().context("Failed to commit message insert")?;

        self.conn
            .query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                params![id],
                read_message,
            )
            .context("Message not found after insert")
    }

    /// Messages in creation order. With `after`, only messages that follow
    /// the given message; an unknown cursor yields the full list.
    pub fn list_messages(&self, conversation_id: &str, after: Option<&str>) -> Result<Vec<Message>> {
        let cursor: Option<(String, i64)> = match after {
            Some(after_id) => self
                .conn
                .query_row(
                    "SELECT created_at, rowid FROM messages WHERE id = ?1 AND conversation_id = ?2",
                    params![after_id, conversation_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .context("Failed to resolve message cursor")?,
            None => None,
        };

        let messages = match cursor {
            Some((created_at, rowid)) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "SELECT {} FROM messages
                         WHERE conversation_id = ?1
                           AND (created_at > ?2 OR (created_at = ?2 AND rowid > ?3))
                         ORDER BY created_at, rowid",
                        MESSAGE_COLUMNS
                    ))
                    .context("Failed to prepare list_messages")?;
                let rows = stmt
                    .query_map(params![conversation_id, created_at, rowid], read_message)
                    .context("Failed to query messages")?;
                collect_rows(rows, "message")?
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "SELECT {} FROM messages WHERE conversation_id = ?1 ORDER BY created_at, rowid",
                        MESSAGE_COLUMNS
                    ))
                    .context("Failed to prepare list_messages")?;
                let rows = stmt
                    .query_map(params![conversation_id], read_message)
                    .context("Failed to query messages")?;
                collect_rows(rows, "message")?
            }
        };
        Ok(messages)
    }

    pub fn count_messages(&self, conversation_id: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .context("Failed to count messages")?;
        Ok(count as usize)
    }
}

// ── Row mapping ──────────────────────────────────────────────────────

fn read_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn read_workspace(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: row.get(0)?,
        name: row.get(1)?,
        user_id: row.get(2)?,
        image_url: row.get(3)?,
        invite_code: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn read_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        image_url: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn read_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        content: row.get(2)?,
        sender_id: row.get(3)?,
        username: row.get(4)?,
        avatar: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Intermediate row struct for members before parsing the role string.
struct MemberRow {
    id: String,
    workspace_id: String,
    user_id: String,
    role: String,
    name: String,
    created_at: String,
    updated_at: String,
}

fn read_member_row(row: &Row<'_>) -> rusqlite::Result<MemberRow> {
    Ok(MemberRow {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        user_id: row.get(2)?,
        role: row.get(3)?,
        name: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

impl MemberRow {
    fn into_member(self) -> Result<Member> {
        let role = MemberRole::from_str(&self.role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse member role")?;
        Ok(Member {
            id: self.id,
            workspace_id: self.workspace_id,
            user_id: self.user_id,
            role,
            name: self.name,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for tasks before parsing the status string.
struct TaskRow {
    id: String,
    workspace_id: String,
    project_id: String,
    name: String,
    status: String,
    due_date: Option<String>,
    assignee_id: Option<String>,
    position: i64,
    description: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_task_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        project_id: row.get(2)?,
        name: row.get(3)?,
        status: row.get(4)?,
        due_date: row.get(5)?,
        assignee_id: row.get(6)?,
        position: row.get(7)?,
        description: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;
        Ok(Task {
            id: self.id,
            workspace_id: self.workspace_id,
            project_id: self.project_id,
            name: self.name,
            status,
            due_date: self.due_date,
            assignee_id: self.assignee_id,
            position: self.position,
            description: self.description,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for conversations; `member_ids` is stored as JSON.
struct ConversationRow {
    id: String,
    workspace_id: String,
    name: String,
    member_ids: String,
    created_at: String,
    updated_at: String,
}

fn read_conversation_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        member_ids: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

impl ConversationRow {
    fn into_conversation(self) -> Result<Conversation> {
        let member_ids: Vec<String> = serde_json::from_str(&self.member_ids)
            .context("Failed to parse conversation member ids JSON")?;
        Ok(Conversation {
            id: self.id,
            workspace_id: self.workspace_id,
            name: self.name,
            member_ids,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_message: None,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
