use super::db::BoardDb;
use super::models::{NewProject, Project, ProjectPatch, User};
use super::workspaces::{require_admin, require_member};
use crate::errors::{BoardError, BoardResult};

fn existing(db: &BoardDb, project_id: &str) -> BoardResult<Project> {
    db.get_project(project_id)?
        .ok_or_else(|| BoardError::not_found("Project", project_id))
}

fn validate_name(name: &str) -> BoardResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(BoardError::validation("Name is required"));
    }
    Ok(name.to_string())
}

pub fn create(db: &BoardDb, user: &User, input: NewProject) -> BoardResult<Project> {
    require_member(db, &input.workspace_id, &user.id)?;
    let name = validate_name(&input.name)?;
    Ok(db.create_project(
        &input.workspace_id,
        &name,
        input.image_url.as_deref().filter(|u| !u.is_empty()),
    )?)
}

pub fn list(db: &BoardDb, user: &User, workspace_id: &str) -> BoardResult<Vec<Project>> {
    require_member(db, workspace_id, &user.id)?;
    Ok(db.list_projects(workspace_id)?)
}

pub fn get(db: &BoardDb, user: &User, project_id: &str) -> BoardResult<Project> {
    let project = existing(db, project_id)?;
    require_member(db, &project.workspace_id, &user.id)?;
    Ok(project)
}

pub fn update(db: &BoardDb, user: &User, project_id: &str, patch: ProjectPatch) -> BoardResult<Project> {
    let project = existing(db, project_id)?;
    require_member(db, &project.workspace_id, &user.id)?;
    let name = patch.name.as_deref().map(validate_name).transpose()?;
    let image_url = patch.image_url.as_ref().map(|u| u.as_deref());
    Ok(db.update_project(project_id, name.as_deref(), image_url)?)
}

/// Delete a project and its tasks. Admins only.
pub fn delete(db: &BoardDb, user: &User, project_id: &str) -> BoardResult<Project> {
    let project = existing(db, project_id)?;
    require_admin(db, &project.workspace_id, &user.id)?;
    db.delete_project(project_id)?;
    Ok(project)
}
