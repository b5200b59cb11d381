//! Task repository: listing with filters and joins, CRUD, kanban positions.
//!
//! Membership is resolved before any mutation. The primary entity missing is
//! `NotFound`; a joined project or assignee missing degrades to `null`.

use std::collections::HashMap;

use tracing::debug;

use super::db::BoardDb;
use super::models::*;
use super::query::{TaskField, TaskQuery};
use super::workspaces::require_member;
use crate::errors::{BoardError, BoardResult};

fn existing(db: &BoardDb, task_id: &str) -> BoardResult<Task> {
    db.get_task(task_id)?
        .ok_or_else(|| BoardError::not_found("Task", task_id))
}

fn validate_name(name: &str) -> BoardResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(BoardError::validation("Task name is required"));
    }
    Ok(name.to_string())
}

fn validate_project(db: &BoardDb, workspace_id: &str, project_id: &str) -> BoardResult<Project> {
    let project = db
        .get_project(project_id)?
        .ok_or_else(|| BoardError::not_found("Project", project_id))?;
    if project.workspace_id != workspace_id {
        return Err(BoardError::validation(
            "Project does not belong to this workspace",
        ));
    }
    Ok(project)
}

fn validate_assignee(db: &BoardDb, workspace_id: &str, member_id: &str) -> BoardResult<Member> {
    match db.get_member_by_id(member_id)? {
        Some(member) if member.workspace_id == workspace_id => Ok(member),
        _ => Err(BoardError::validation(
            "Assignee is not a member of this workspace",
        )),
    }
}

fn normalize_due(raw: &str) -> BoardResult<Option<String>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    normalize_due_date(raw).map(Some).map_err(BoardError::Validation)
}

/// Build the list query for a workspace and a set of filters.
pub fn build_query(workspace_id: &str, filters: &TaskFilters) -> BoardResult<TaskQuery> {
    let mut query = TaskQuery::workspace(workspace_id)
        .equal_opt(TaskField::ProjectId, filters.project_id.as_deref())
        .equal_opt(TaskField::AssigneeId, filters.assignee_id.as_deref())
        .search(TaskField::Name, filters.search.as_deref());
    if let Some(status) = filters.status {
        query = query.status(status);
    }
    if let Some(due) = filters.due_date.as_deref() {
        if let Some(due) = normalize_due(due)? {
            query = query.equal(TaskField::DueDate, due);
        }
    }
    Ok(query)
}

/// Join projects and assignees onto a page of tasks with one query each.
fn populate(db: &BoardDb, tasks: Vec<Task>) -> BoardResult<Vec<PopulatedTask>> {
    let mut project_ids: Vec<String> = tasks.iter().map(|t| t.project_id.clone()).collect();
    project_ids.sort();
    project_ids.dedup();
    let mut member_ids: Vec<String> = tasks.iter().filter_map(|t| t.assignee_id.clone()).collect();
    member_ids.sort();
    member_ids.dedup();

    let projects: HashMap<String, Project> = db
        .get_projects_by_ids(&project_ids)?
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();
    let members: HashMap<String, MemberDetail> = db
        .member_details_by_ids(&member_ids)?
        .into_iter()
        .map(|m| (m.member.id.clone(), m))
        .collect();

    Ok(tasks
        .into_iter()
        .map(|task| {
            let project = projects.get(&task.project_id).cloned();
            let assignee = task
                .assignee_id
                .as_ref()
                .and_then(|id| members.get(id))
                .cloned();
            PopulatedTask {
                document: TaskDocument::from(task),
                project,
                assigned_to: assignee.clone(),
                assignee,
            }
        })
        .collect())
}

pub fn list(
    db: &BoardDb,
    user: &User,
    workspace_id: &str,
    filters: &TaskFilters,
) -> BoardResult<TaskPage> {
    require_member(db, workspace_id, &user.id)?;
    let query = build_query(workspace_id, filters)?;
    let tasks = db.list_tasks(&query)?;
    let total = tasks.len();
    debug!(workspace_id = %workspace_id, total, "Listed tasks");
    Ok(TaskPage {
        documents: populate(db, tasks)?,
        total,
    })
}

pub fn get(db: &BoardDb, user: &User, task_id: &str) -> BoardResult<PopulatedTask> {
    let task = existing(db, task_id)?;
    require_member(db, &task.workspace_id, &user.id)?;
    let mut populated = populate(db, vec![task])?;
    populated
        .pop()
        .ok_or_else(|| BoardError::not_found("Task", task_id))
}

/// Create a task at the end of its status column.
///
/// Without an explicit assignee the task is assigned to the creating member.
pub fn create(db: &BoardDb, user: &User, mut input: NewTask) -> BoardResult<TaskDocument> {
    let member = require_member(db, &input.workspace_id, &user.id)?;
    input.name = validate_name(&input.name)?;
    validate_project(db, &input.workspace_id, &input.project_id)?;

    let assignee_id = match input.requested_assignee() {
        Some(id) => validate_assignee(db, &input.workspace_id, id)?.id,
        None => member.id,
    };
    input.assignee_id = Some(assignee_id);
    input.assigned_to_id = None;
    input.due_date = match input.due_date.as_deref() {
        Some(raw) => normalize_due(raw)?,
        None => None,
    };
    input.description = input.description.filter(|d| !d.is_empty());

    let task = db.insert_task(&input)?;
    debug!(task_id = %task.id, position = task.position, "Task created");
    Ok(TaskDocument::from(task))
}

/// Apply a partial update. The workspace of a task never changes.
pub fn update(
    db: &BoardDb,
    user: &User,
    task_id: &str,
    patch: TaskPatch,
) -> BoardResult<TaskDocument> {
    let task = existing(db, task_id)?;
    require_member(db, &task.workspace_id, &user.id)?;

    let name = patch.name.as_deref().map(validate_name).transpose()?;
    if let Some(project_id) = patch.project_id.as_deref() {
        validate_project(db, &task.workspace_id, project_id)?;
    }
    let assignee_id = match patch.requested_assignee() {
        Some(Some(id)) => Some(Some(validate_assignee(db, &task.workspace_id, id)?.id)),
        Some(None) => Some(None),
        None => None,
    };
    let due_date = match patch.due_date.as_ref() {
        Some(Some(raw)) => Some(normalize_due(raw)?),
        Some(None) => Some(None),
        None => None,
    };

    let normalized = TaskPatch {
        name,
        status: patch.status,
        project_id: patch.project_id,
        due_date,
        assignee_id,
        assigned_to_id: None,
        description: patch.description,
        position: patch.position,
    };
    if normalized.is_empty() {
        return Ok(TaskDocument::from(task));
    }
    Ok(TaskDocument::from(db.update_task(task_id, &normalized)?))
}

/// Delete a task, returning it so callers know which workspace it left.
pub fn delete(db: &BoardDb, user: &User, task_id: &str) -> BoardResult<Task> {
    let task = existing(db, task_id)?;
    require_member(db, &task.workspace_id, &user.id)?;
    db.delete_task(task_id)?;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::workspaces;
    use anyhow::Result;

    struct Fixture {
        db: BoardDb,
        ada: User,
        workspace: Workspace,
        project: Project,
    }

    fn fixture() -> Result<Fixture> {
        let db = BoardDb::new_in_memory()?;
        let ada = db.upsert_user("Ada", "ada@example.com")?;
        let workspace = workspaces::create(
            &db,
            &ada,
            NewWorkspace {
                name: "Acme".into(),
                image_url: None,
            },
        )?;
        let project = db.create_project(&workspace.id, "Website", None)?;
        Ok(Fixture {
            db,
            ada,
            workspace,
            project,
        })
    }

    impl Fixture {
        fn task(&self, name: &str, status: TaskStatus) -> NewTask {
            NewTask::new(name, status, &self.workspace.id, &self.project.id)
        }
    }

    #[test]
    fn test_positions_increase_by_gap() -> Result<()> {
        let f = fixture()?;
        let mut positions = Vec::new();
        for i in 0..4 {
            let t = create(&f.db, &f.ada, f.task(&format!("T{}", i), TaskStatus::Todo))?;
            positions.push(t.task.position);
        }
        assert_eq!(positions, vec![1000, 2000, 3000, 4000]);
        Ok(())
    }

    #[test]
    fn test_create_defaults_assignee_to_creator() -> Result<()> {
        let f = fixture()?;
        let member = workspaces::require_member(&f.db, &f.workspace.id, &f.ada.id)?;
        let doc = create(&f.db, &f.ada, f.task("Write docs", TaskStatus::Todo))?;
        assert_eq!(doc.task.assignee_id.as_deref(), Some(member.id.as_str()));
        assert_eq!(doc.assigned_to_id, doc.task.assignee_id);
        Ok(())
    }

    #[test]
    fn test_create_validates_inputs() -> Result<()> {
        let f = fixture()?;

        let err = create(&f.db, &f.ada, f.task("  ", TaskStatus::Todo)).unwrap_err();
        assert!(matches!(err, BoardError::Validation(_)));

        let mut bad_assignee = f.task("A", TaskStatus::Todo);
        bad_assignee.assigned_to_id = Some("nobody".into());
        let err = create(&f.db, &f.ada, bad_assignee).unwrap_err();
        assert!(matches!(err, BoardError::Validation(_)));

        let mut bad_due = f.task("A", TaskStatus::Todo);
        bad_due.due_date = Some("soon".into());
        assert!(matches!(
            create(&f.db, &f.ada, bad_due),
            Err(BoardError::Validation(_))
        ));

        let (other, _) = f.db.create_workspace("Other", None, &f.ada, "QWERTY")?;
        let foreign = f.db.create_project(&other.id, "Foreign", None)?;
        let mut cross = f.task("A", TaskStatus::Todo);
        cross.project_id = foreign.id.clone();
        let err = create(&f.db, &f.ada, cross).unwrap_err();
        assert_eq!(err.to_string(), "Project does not belong to this workspace");
        Ok(())
    }

    #[test]
    fn test_list_requires_membership() -> Result<()> {
        let f = fixture()?;
        let eve = f.db.upsert_user("Eve", "eve@example.com")?;
        let err = list(&f.db, &eve, &f.workspace.id, &TaskFilters::default()).unwrap_err();
        assert!(matches!(err, BoardError::Unauthorized));
        Ok(())
    }

    #[test]
    fn test_list_filters_and_joins() -> Result<()> {
        let f = fixture()?;
        let mut with_due = f.task("Write docs", TaskStatus::Todo);
        with_due.due_date = Some("2030-05-01".into());
        create(&f.db, &f.ada, with_due)?;
        create(&f.db, &f.ada, f.task("Ship", TaskStatus::Done))?;

        let page = list(&f.db, &f.ada, &f.workspace.id, &TaskFilters::default())?;
        assert_eq!(page.total, 2);
        let first = &page.documents[0];
        assert_eq!(first.task().name, "Ship");
        assert_eq!(first.project.as_ref().map(|p| p.name.as_str()), Some("Website"));
        assert_eq!(
            first.assignee.as_ref().map(|a| a.email.as_deref()),
            Some(Some("ada@example.com"))
        );
        assert_eq!(first.assignee, first.assigned_to);

        let todo = TaskFilters {
            status: Some(TaskStatus::Todo),
            ..Default::default()
        };
        let page = list(&f.db, &f.ada, &f.workspace.id, &todo)?;
        assert_eq!(page.total, 1);
        assert_eq!(page.documents[0].task().name, "Write docs");

        let by_due = TaskFilters {
            due_date: Some("2030-05-01T00:00:00Z".into()),
            ..Default::default()
        };
        assert_eq!(list(&f.db, &f.ada, &f.workspace.id, &by_due)?.total, 1);

        let search = TaskFilters {
            search: Some("DOCS".into()),
            project_id: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(list(&f.db, &f.ada, &f.workspace.id, &search)?.total, 1);
        Ok(())
    }

    #[test]
    fn test_search_folds_non_ascii_case() -> Result<()> {
        let f = fixture()?;
        create(&f.db, &f.ada, f.task("Été planning", TaskStatus::Todo))?;
        create(&f.db, &f.ada, f.task("Straße repair", TaskStatus::Todo))?;
        create(&f.db, &f.ada, f.task("Ete budget", TaskStatus::Todo))?;

        let search = |term: &str| TaskFilters {
            search: Some(term.into()),
            ..Default::default()
        };
        let page = list(&f.db, &f.ada, &f.workspace.id, &search("été"))?;
        assert_eq!(page.total, 1);
        assert_eq!(page.documents[0].task().name, "Été planning");

        assert_eq!(list(&f.db, &f.ada, &f.workspace.id, &search("ÉTÉ PLAN"))?.total, 1);
        assert_eq!(list(&f.db, &f.ada, &f.workspace.id, &search("STRASSE"))?.total, 0);
        assert_eq!(list(&f.db, &f.ada, &f.workspace.id, &search("STRAßE"))?.total, 1);
        Ok(())
    }

    #[test]
    fn test_get_missing_and_foreign() -> Result<()> {
        let f = fixture()?;
        let eve = f.db.upsert_user("Eve", "eve@example.com")?;
        let doc = create(&f.db, &f.ada, f.task("A", TaskStatus::Todo))?;

        assert!(matches!(
            get(&f.db, &f.ada, "missing"),
            Err(BoardError::NotFound { .. })
        ));
        assert!(matches!(
            get(&f.db, &eve, &doc.task.id),
            Err(BoardError::Unauthorized)
        ));
        Ok(())
    }

    #[test]
    fn test_assignee_leaving_unassigns_task() -> Result<()> {
        let f = fixture()?;
        let bob = f.db.upsert_user("Bob", "bob@example.com")?;
        let bob_member = f
            .db
            .create_member(&f.workspace.id, &bob.id, MemberRole::Member, "Bob")?;
        let mut input = f.task("A", TaskStatus::Todo);
        input.assignee_id = Some(bob_member.id.clone());
        let doc = create(&f.db, &f.ada, input)?;

        workspaces::leave(&f.db, &bob, &f.workspace.id)?;
        let fetched = get(&f.db, &f.ada, &doc.task.id)?;
        assert!(fetched.assignee.is_none());
        assert!(fetched.assigned_to.is_none());
        assert!(fetched.project.is_some());
        Ok(())
    }

    #[test]
    fn test_update_status_keeps_other_fields() -> Result<()> {
        let f = fixture()?;
        let mut input = f.task("Write docs", TaskStatus::Todo);
        input.description = Some("draft".into());
        let created = create(&f.db, &f.ada, input)?;

        update(&f.db, &f.ada, &created.task.id, TaskPatch::status(TaskStatus::Done))?;
        let fetched = get(&f.db, &f.ada, &created.task.id)?;
        assert_eq!(fetched.task().status, TaskStatus::Done);
        assert_eq!(fetched.task().name, created.task.name);
        assert_eq!(fetched.task().description, created.task.description);
        assert_eq!(fetched.task().assignee_id, created.task.assignee_id);
        assert_eq!(fetched.task().position, created.task.position);
        assert_eq!(fetched.task().workspace_id, created.task.workspace_id);
        Ok(())
    }

    #[test]
    fn test_update_clears_and_validates() -> Result<()> {
        let f = fixture()?;
        let created = create(&f.db, &f.ada, f.task("A", TaskStatus::Todo))?;

        let cleared = update(
            &f.db,
            &f.ada,
            &created.task.id,
            TaskPatch {
                assignee_id: Some(None),
                ..Default::default()
            },
        )?;
        assert!(cleared.task.assignee_id.is_none());
        assert!(cleared.assigned_to_id.is_none());

        let err = update(
            &f.db,
            &f.ada,
            &created.task.id,
            TaskPatch {
                name: Some(String::new()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, BoardError::Validation(_)));

        let unchanged = update(&f.db, &f.ada, &created.task.id, TaskPatch::default())?;
        assert_eq!(unchanged.task.updated_at, cleared.task.updated_at);
        Ok(())
    }

    #[test]
    fn test_delete_then_get_is_not_found() -> Result<()> {
        let f = fixture()?;
        let created = create(&f.db, &f.ada, f.task("A", TaskStatus::Todo))?;
        let deleted = delete(&f.db, &f.ada, &created.task.id)?;
        assert_eq!(deleted.id, created.task.id);
        assert!(matches!(
            get(&f.db, &f.ada, &created.task.id),
            Err(BoardError::NotFound { .. })
        ));
        Ok(())
    }
}
