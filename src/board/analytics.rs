//! Workspace analytics computed from live count queries.
//!
//! "Assigned" always means assigned to the caller's member record. The
//! monthly variant windows every count by task creation time over UTC
//! calendar months.

use chrono::{DateTime, Datelike, TimeZone, Utc};

use super::db::BoardDb;
use super::models::{MonthlyAnalytics, TaskStatus, User, WorkspaceAnalytics, timestamp};
use super::query::{TaskField, TaskQuery};
use super::workspaces::require_member;
use crate::errors::{BoardError, BoardResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TaskCounts {
    total: usize,
    assigned: usize,
    completed: usize,
    overdue: usize,
    incomplete: usize,
}

/// Half-open `[from, until)` creation window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

fn month_start(year: i32, month: u32) -> BoardResult<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| BoardError::Internal(anyhow::anyhow!("Invalid month {}-{}", year, month)))
}

/// The calendar month containing `now` and the one before it.
pub fn month_windows(now: DateTime<Utc>) -> BoardResult<(Window, Window)> {
    let (year, month) = (now.year(), now.month());
    let this_start = month_start(year, month)?;
    let next_start = if month == 12 {
        month_start(year + 1, 1)?
    } else {
        month_start(year, month + 1)?
    };
    let last_start = if month == 1 {
        month_start(year - 1, 12)?
    } else {
        month_start(year, month - 1)?
    };
    Ok((
        Window {
            from: this_start,
            until: next_start,
        },
        Window {
            from: last_start,
            until: this_start,
        },
    ))
}

fn count_tasks(
    db: &BoardDb,
    workspace_id: &str,
    member_id: &str,
    window: Option<&Window>,
    now: &str,
) -> BoardResult<TaskCounts> {
    let base = || {
        let query = TaskQuery::workspace(workspace_id);
        match window {
            Some(w) => query.between(TaskField::CreatedAt, timestamp(w.from), timestamp(w.until)),
            None => query,
        }
    };
    let assigned = || base().equal(TaskField::AssigneeId, member_id);

    Ok(TaskCounts {
        total: db.count_tasks(&base())?,
        assigned: db.count_tasks(&assigned())?,
        completed: db.count_tasks(&assigned().status(TaskStatus::Done))?,
        overdue: db.count_tasks(
            &assigned()
                .not_status(TaskStatus::Done)
                .less_than(TaskField::DueDate, now),
        )?,
        incomplete: db.count_tasks(&assigned().not_status(TaskStatus::Done))?,
    })
}

/// All-time counts for the caller in a workspace.
pub fn workspace_analytics(
    db: &BoardDb,
    user: &User,
    workspace_id: &str,
) -> BoardResult<WorkspaceAnalytics> {
    let member = require_member(db, workspace_id, &user.id)?;
    let now = timestamp(db.now());
    let counts = count_tasks(db, workspace_id, &member.id, None, &now)?;
    Ok(WorkspaceAnalytics {
        total_projects: db.count_projects(workspace_id)?,
        total_tasks: counts.total,
        assigned_tasks: counts.assigned,
        completed_tasks: counts.completed,
        overdue_tasks: counts.overdue,
        incomplete_task_count: counts.incomplete,
    })
}

fn diff(this: usize, last: usize) -> i64 {
    this as i64 - last as i64
}

/// This month's counts and their change against last month.
pub fn monthly_analytics(
    db: &BoardDb,
    user: &User,
    workspace_id: &str,
) -> BoardResult<MonthlyAnalytics> {
    let member = require_member(db, workspace_id, &user.id)?;
    let now = db.now();
    let now_ts = timestamp(now);
    let (this_month, last_month) = month_windows(now)?;
    let this = count_tasks(db, workspace_id, &member.id, Some(&this_month), &now_ts)?;
    let last = count_tasks(db, workspace_id, &member.id, Some(&last_month), &now_ts)?;

    Ok(MonthlyAnalytics {
        total_projects: db.count_projects(workspace_id)?,
        task_count: this.total,
        task_difference: diff(this.total, last.total),
        assigned_task_count: this.assigned,
        assigned_task_difference: diff(this.assigned, last.assigned),
        completed_task_count: this.completed,
        completed_task_difference: diff(this.completed, last.completed),
        overdue_task_count: this.overdue,
        overdue_task_difference: diff(this.overdue, last.overdue),
        incomplete_task_count: this.incomplete,
        incomplete_task_difference: diff(this.incomplete, last.incomplete),
    })
}
