//! Conversations and messages.
//!
//! Visibility follows `memberIds`: a conversation exists for a user only if
//! their user id is in it. Sending bumps the conversation so active threads
//! sort first.

use tracing::debug;

use super::db::BoardDb;
use super::models::{Conversation, Message, NewConversation, NewMessage, User};
use super::workspaces::require_member;
use crate::errors::{BoardError, BoardResult};

/// Default upper bound on message length, in characters.
pub const MAX_MESSAGE_LEN: usize = 1000;

fn existing(db: &BoardDb, conversation_id: &str) -> BoardResult<Conversation> {
    db.get_conversation(conversation_id)?
        .ok_or_else(|| BoardError::not_found("Conversation", conversation_id))
}

/// The conversation, if the caller takes part in it.
fn participating(db: &BoardDb, user: &User, conversation_id: &str) -> BoardResult<Conversation> {
    let conversation = existing(db, conversation_id)?;
    if !conversation.has_member(&user.id) {
        return Err(BoardError::Unauthorized);
    }
    Ok(conversation)
}

pub fn list_conversations(
    db: &BoardDb,
    user: &User,
    workspace_id: &str,
) -> BoardResult<Vec<Conversation>> {
    require_member(db, workspace_id, &user.id)?;
    Ok(db.list_conversations_for_user(workspace_id, &user.id)?)
}

/// Create a conversation. The creator is always a member; duplicate ids are
/// dropped and every member must belong to the workspace.
pub fn create_conversation(
    db: &BoardDb,
    user: &User,
    input: NewConversation,
) -> BoardResult<Conversation> {
    require_member(db, &input.workspace_id, &user.id)?;
    let name = input.name.trim();
    if name.is_empty() {
        return Err(BoardError::validation("Conversation name is required"));
    }

    let mut member_ids: Vec<String> = Vec::with_capacity(input.member_ids.len() + 1);
    for id in input.member_ids.into_iter().chain(std::iter::once(user.id.clone())) {
        if !id.is_empty() && !member_ids.contains(&id) {
            member_ids.push(id);
        }
    }
    for id in &member_ids {
        if db.get_member(&input.workspace_id, id)?.is_none() {
            return Err(BoardError::validation(format!(
                "User {} is not a member of this workspace",
                id
            )));
        }
    }

    let conversation = db.create_conversation(&input.workspace_id, name, &member_ids)?;
    debug!(conversation_id = %conversation.id, members = member_ids.len(), "Conversation created");
    Ok(conversation)
}

/// Messages in creation order, optionally only those after a message id.
pub fn list_messages(
    db: &BoardDb,
    user: &User,
    conversation_id: &str,
    after: Option<&str>,
) -> BoardResult<Vec<Message>> {
    participating(db, user, conversation_id)?;
    Ok(db.list_messages(conversation_id, after.filter(|a| !a.is_empty()))?)
}

/// Validate and store a message from the caller.
///
/// Returns the conversation alongside the message so callers can address
/// the participants.
pub fn send_message(
    db: &BoardDb,
    user: &User,
    input: NewMessage,
    max_len: usize,
) -> BoardResult<(Conversation, Message)> {
    let conversation = participating(db, user, &input.conversation_id)?;

    let len = input.content.chars().count();
    if len == 0 {
        return Err(BoardError::validation("Message cannot be empty"));
    }
    if len > max_len {
        return Err(BoardError::validation(format!(
            "Message cannot exceed {} characters",
            max_len
        )));
    }

    let username = input
        .username
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| user.name.clone());
    let avatar = input.avatar.unwrap_or_default();
    let message = db.insert_message(&conversation.id, &input.content, &user.id, &username, &avatar)?;
    debug!(conversation_id = %conversation.id, message_id = %message.id, "Message sent");
    Ok((conversation, message))
}
