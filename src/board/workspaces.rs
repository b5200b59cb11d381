//! Workspaces, membership checks and invite codes.

use tracing::info;

use super::db::BoardDb;
use super::models::{JoinWorkspace, Member, MemberDetail, MemberRole, NewWorkspace, User, Workspace, WorkspacePatch};
use crate::errors::{BoardError, BoardResult};

pub const INVITE_CODE_LEN: usize = 6;
const INVITE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Random 6-character invite code.
pub fn generate_invite_code() -> String {
    uuid::Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(INVITE_CODE_LEN)
        .map(|b| INVITE_ALPHABET[*b as usize % INVITE_ALPHABET.len()] as char)
        .collect()
}

/// The caller's membership in `workspace_id`, or `Unauthorized`.
pub fn require_member(db: &BoardDb, workspace_id: &str, user_id: &str) -> BoardResult<Member> {
    db.get_member(workspace_id, user_id)?
        .ok_or(BoardError::Unauthorized)
}

pub fn require_admin(db: &BoardDb, workspace_id: &str, user_id: &str) -> BoardResult<Member> {
    let member = require_member(db, workspace_id, user_id)?;
    if member.is_admin() {
        Ok(member)
    } else {
        Err(BoardError::Unauthorized)
    }
}

fn existing(db: &BoardDb, workspace_id: &str) -> BoardResult<Workspace> {
    db.get_workspace(workspace_id)?
        .ok_or_else(|| BoardError::not_found("Workspace", workspace_id))
}

fn validate_name(name: &str) -> BoardResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(BoardError::validation("Name is required"));
    }
    Ok(name.to_string())
}

pub fn create(db: &BoardDb, user: &User, input: NewWorkspace) -> BoardResult<Workspace> {
    let name = validate_name(&input.name)?;
    let (workspace, _) = db.create_workspace(
        &name,
        input.image_url.as_deref().filter(|u| !u.is_empty()),
        user,
        &generate_invite_code(),
    )?;
    info!(workspace_id = %workspace.id, user_id = %user.id, "Workspace created");
    Ok(workspace)
}

/// Workspaces the caller is a member of.
pub fn list(db: &BoardDb, user: &User) -> BoardResult<Vec<Workspace>> {
    Ok(db.list_workspaces_for_user(&user.id)?)
}

pub fn get(db: &BoardDb, user: &User, workspace_id: &str) -> BoardResult<Workspace> {
    let workspace = existing(db, workspace_id)?;
    require_member(db, workspace_id, &user.id)?;
    Ok(workspace)
}

pub fn update(
    db: &BoardDb,
    user: &User,
    workspace_id: &str,
    patch: WorkspacePatch,
) -> BoardResult<Workspace> {
    existing(db, workspace_id)?;
    require_admin(db, workspace_id, &user.id)?;
    let name = patch.name.as_deref().map(validate_name).transpose()?;
    let image_url = patch.image_url.as_ref().map(|u| u.as_deref());
    Ok(db.update_workspace(workspace_id, name.as_deref(), image_url)?)
}

pub fn delete(db: &BoardDb, user: &User, workspace_id: &str) -> BoardResult<String> {
    existing(db, workspace_id)?;
    require_admin(db, workspace_id, &user.id)?;
    db.delete_workspace(workspace_id)?;
    info!(workspace_id = %workspace_id, "Workspace deleted");
    Ok(workspace_id.to_string())
}

/// Issue a fresh invite code; the previous one stops working.
pub fn reset_invite_code(db: &BoardDb, user: &User, workspace_id: &str) -> BoardResult<Workspace> {
    existing(db, workspace_id)?;
    require_admin(db, workspace_id, &user.id)?;
    Ok(db.set_invite_code(workspace_id, &generate_invite_code())?)
}

/// Join a workspace with its current invite code as a regular member.
pub fn join(
    db: &BoardDb,
    user: &User,
    workspace_id: &str,
    input: JoinWorkspace,
) -> BoardResult<Workspace> {
    let workspace = existing(db, workspace_id)?;
    if db.get_member(workspace_id, &user.id)?.is_some() {
        return Err(BoardError::validation("Already a member"));
    }
    if !workspace.invite_code.eq_ignore_ascii_case(input.code.trim()) {
        return Err(BoardError::validation("Invalid invite code"));
    }
    db.create_member(workspace_id, &user.id, MemberRole::Member, &user.name)?;
    info!(workspace_id = %workspace_id, user_id = %user.id, "Member joined workspace");
    Ok(workspace)
}

/// Leave a workspace. The last admin cannot leave.
pub fn leave(db: &BoardDb, user: &User, workspace_id: &str) -> BoardResult<Member> {
    existing(db, workspace_id)?;
    let member = require_member(db, workspace_id, &user.id)?;
    if member.is_admin() && db.count_admins(workspace_id)? <= 1 {
        return Err(BoardError::validation(
            "The last admin cannot leave the workspace",
        ));
    }
    db.delete_member(&member.id)?;
    info!(workspace_id = %workspace_id, user_id = %user.id, "Member left workspace");
    Ok(member)
}

pub fn members(db: &BoardDb, user: &User, workspace_id: &str) -> BoardResult<Vec<MemberDetail>> {
    require_member(db, workspace_id, &user.id)?;
    Ok(db.list_member_details(workspace_id)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn setup() -> Result<(BoardDb, User, User)> {
        let db = BoardDb::new_in_memory()?;
        let owner = db.upsert_user("Ada", "ada@example.com")?;
        let other = db.upsert_user("Bob", "bob@example.com")?;
        Ok((db, owner, other))
    }

    fn new_workspace(name: &str) -> NewWorkspace {
        NewWorkspace {
            name: name.into(),
            image_url: None,
        }
    }

    #[test]
    fn test_invite_code_shape() {
        let code = generate_invite_code();
        assert_eq!(code.len(), INVITE_CODE_LEN);
        assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_create_rejects_blank_name() -> Result<()> {
        let (db, owner, _) = setup()?;
        let err = create(&db, &owner, new_workspace("   ")).unwrap_err();
        assert!(matches!(err, BoardError::Validation(_)));
        Ok(())
    }

    #[test]
    fn test_join_flow() -> Result<()> {
        let (db, owner, bob) = setup()?;
        let workspace = create(&db, &owner, new_workspace("Acme"))?;

        let err = get(&db, &bob, &workspace.id).unwrap_err();
        assert!(matches!(err, BoardError::Unauthorized));

        let err = join(&db, &bob, &workspace.id, JoinWorkspace { code: "WRONG1".into() }).unwrap_err();
        assert_eq!(err.to_string(), "Invalid invite code");

        join(
            &db,
            &bob,
            &workspace.id,
            JoinWorkspace {
                code: workspace.invite_code.clone(),
            },
        )?;
        let member = require_member(&db, &workspace.id, &bob.id)?;
        assert_eq!(member.role, MemberRole::Member);
        assert_eq!(member.name, "Bob");

        let err = join(
            &db,
            &bob,
            &workspace.id,
            JoinWorkspace {
                code: workspace.invite_code.clone(),
            },
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Already a member");

        assert_eq!(members(&db, &owner, &workspace.id)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_reset_invite_code_invalidates_old_code() -> Result<()> {
        let (db, owner, bob) = setup()?;
        let workspace = create(&db, &owner, new_workspace("Acme"))?;
        let old_code = workspace.invite_code.clone();

        let mut reset = reset_invite_code(&db, &owner, &workspace.id)?;
        while reset.invite_code == old_code {
            reset = reset_invite_code(&db, &owner, &workspace.id)?;
        }

        let err = join(&db, &bob, &workspace.id, JoinWorkspace { code: old_code }).unwrap_err();
        assert!(matches!(err, BoardError::Validation(_)));
        join(&db, &bob, &workspace.id, JoinWorkspace { code: reset.invite_code })?;
        Ok(())
    }

    #[test]
    fn test_admin_only_operations() -> Result<()> {
        let (db, owner, bob) = setup()?;
        let workspace = create(&db, &owner, new_workspace("Acme"))?;
        join(
            &db,
            &bob,
            &workspace.id,
            JoinWorkspace {
                code: workspace.invite_code.clone(),
            },
        )?;

        let patch = WorkspacePatch {
            name: Some("Renamed".into()),
            ..Default::default()
        };
        assert!(matches!(
            update(&db, &bob, &workspace.id, patch.clone()),
            Err(BoardError::Unauthorized)
        ));
        assert!(matches!(
            reset_invite_code(&db, &bob, &workspace.id),
            Err(BoardError::Unauthorized)
        ));
        assert!(matches!(delete(&db, &bob, &workspace.id), Err(BoardError::Unauthorized)));

        let renamed = update(&db, &owner, &workspace.id, patch)?;
        assert_eq!(renamed.name, "Renamed");
        assert_eq!(delete(&db, &owner, &workspace.id)?, workspace.id);
        assert!(matches!(
            get(&db, &owner, &workspace.id),
            Err(BoardError::NotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_last_admin_cannot_leave() -> Result<()> {
        let (db, owner, bob) = setup()?;
        let workspace = create(&db, &owner, new_workspace("Acme"))?;
        join(
            &db,
            &bob,
            &workspace.id,
            JoinWorkspace {
                code: workspace.invite_code.clone(),
            },
        )?;

        let err = leave(&db, &owner, &workspace.id).unwrap_err();
        assert!(matches!(err, BoardError::Validation(_)));

        leave(&db, &bob, &workspace.id)?;
        assert!(matches!(
            require_member(&db, &workspace.id, &bob.id),
            Err(BoardError::Unauthorized)
        ));
        Ok(())
    }

    #[test]
    fn test_list_only_returns_joined_workspaces() -> Result<()> {
        let (db, owner, bob) = setup()?;
        create(&db, &owner, new_workspace("Acme"))?;
        create(&db, &bob, new_workspace("Bobco"))?;
        let listed = list(&db, &owner)?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Acme");
        Ok(())
    }
}
