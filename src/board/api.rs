use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequest, Path, Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::broadcast;
use tracing::error;

use super::auth::{self, CurrentUser};
use super::chat::{self, MAX_MESSAGE_LEN};
use super::db::{BoardDb, DbHandle};
use super::models::*;
use super::ws::{BoardEvent, WsMessage, broadcast_message};
use super::{analytics, projects, tasks, workspaces};
use crate::errors::BoardError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub events: broadcast::Sender<BoardEvent>,
    pub max_message_len: usize,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(db: BoardDb) -> SharedState {
        Self::with_limits(db, MAX_MESSAGE_LEN)
    }

    pub fn with_limits(db: BoardDb, max_message_len: usize) -> SharedState {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            db: DbHandle::new(db),
            events,
            max_message_len,
        })
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<BoardError> for ApiError {
    fn from(err: BoardError) -> Self {
        match err {
            BoardError::Unauthorized => ApiError::Unauthorized,
            BoardError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            BoardError::Validation(msg) => ApiError::BadRequest(msg),
            BoardError::LockPoisoned | BoardError::Internal(_) => {
                error!(error = ?err, "Request failed");
                ApiError::Internal("Internal server error".into())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// JSON body extractor whose rejections use the `{error}` shape.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

fn data<T: Serialize>(value: T) -> Json<Envelope<T>> {
    Json(Envelope { data: value })
}

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{} is required", name)))
}

// ── Query parameters ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceParams {
    pub workspace_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksParams {
    pub workspace_id: Option<String>,
    pub project_id: Option<String>,
    pub status: Option<String>,
    pub assignee_id: Option<String>,
    pub assigned_to_id: Option<String>,
    pub search: Option<String>,
    pub due_date: Option<String>,
}

impl ListTasksParams {
    fn filters(&self) -> Result<TaskFilters, ApiError> {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        let status = match non_empty(&self.status) {
            Some(s) => Some(s.parse::<TaskStatus>().map_err(ApiError::BadRequest)?),
            None => None,
        };
        Ok(TaskFilters {
            project_id: non_empty(&self.project_id),
            status,
            assignee_id: non_empty(&self.assignee_id).or_else(|| non_empty(&self.assigned_to_id)),
            search: non_empty(&self.search),
            due_date: non_empty(&self.due_date),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMessagesParams {
    pub conversation_id: Option<String>,
    pub after: Option<String>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/current", get(current_user))
        .route("/api/auth/logout", post(logout))
        .route("/api/workspaces", get(list_workspaces).post(create_workspace))
        .route(
            "/api/workspaces/{workspace_id}",
            get(get_workspace)
                .patch(update_workspace)
                .delete(delete_workspace),
        )
        .route(
            "/api/workspaces/{workspace_id}/reset-invite-code",
            post(reset_invite_code),
        )
        .route("/api/workspaces/{workspace_id}/join", post(join_workspace))
        .route("/api/workspaces/{workspace_id}/leave", post(leave_workspace))
        .route(
            "/api/workspaces/{workspace_id}/analytics",
            get(workspace_analytics),
        )
        .route(
            "/api/workspaces/{workspace_id}/analytics/monthly",
            get(monthly_analytics),
        )
        .route("/api/members", get(list_members))
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/{project_id}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route(
            "/api/tasks/{task_id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route(
            "/api/chat/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/api/chat/messages", get(list_messages).post(send_message))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn login(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resp = state.db.run(move |db| auth::login(db, req)).await?;
    Ok(data(resp))
}

async fn current_user(current: CurrentUser) -> impl IntoResponse {
    data(current.user)
}

async fn logout(
    State(state): State<SharedState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let token = current.token;
    state.db.run(move |db| auth::logout(db, &token)).await?;
    Ok(data(serde_json::json!({"success": true})))
}

// Workspaces

async fn list_workspaces(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let list = state.db.run(move |db| workspaces::list(db, &user)).await?;
    Ok(data(list))
}

async fn create_workspace(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    ApiJson(req): ApiJson<NewWorkspace>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace = state
        .db
        .run(move |db| workspaces::create(db, &user, req))
        .await?;
    Ok((StatusCode::CREATED, data(workspace)))
}

async fn get_workspace(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(workspace_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace = state
        .db
        .run(move |db| workspaces::get(db, &user, &workspace_id))
        .await?;
    Ok(data(workspace))
}

async fn update_workspace(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(workspace_id): Path<String>,
    ApiJson(req): ApiJson<WorkspacePatch>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace = state
        .db
        .run(move |db| workspaces::update(db, &user, &workspace_id, req))
        .await?;
    Ok(data(workspace))
}

async fn delete_workspace(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(workspace_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state
        .db
        .run(move |db| workspaces::delete(db, &user, &workspace_id))
        .await?;
    Ok(data(Deleted { id }))
}

async fn reset_invite_code(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(workspace_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace = state
        .db
        .run(move |db| workspaces::reset_invite_code(db, &user, &workspace_id))
        .await?;
    Ok(data(workspace))
}

async fn join_workspace(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(workspace_id): Path<String>,
    ApiJson(req): ApiJson<JoinWorkspace>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace = state
        .db
        .run(move |db| workspaces::join(db, &user, &workspace_id, req))
        .await?;
    Ok(data(workspace))
}

async fn leave_workspace(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(workspace_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let member = state
        .db
        .run(move |db| workspaces::leave(db, &user, &workspace_id))
        .await?;
    Ok(data(Deleted { id: member.id }))
}

async fn workspace_analytics(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(workspace_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let analytics = state
        .db
        .run(move |db| analytics::workspace_analytics(db, &user, &workspace_id))
        .await?;
    Ok(data(analytics))
}

async fn monthly_analytics(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(workspace_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let analytics = state
        .db
        .run(move |db| analytics::monthly_analytics(db, &user, &workspace_id))
        .await?;
    Ok(data(analytics))
}

async fn list_members(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Query(params): Query<WorkspaceParams>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace_id = required(params.workspace_id, "workspaceId")?;
    let members = state
        .db
        .run(move |db| workspaces::members(db, &user, &workspace_id))
        .await?;
    Ok(data(members))
}

// Projects

async fn list_projects(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Query(params): Query<WorkspaceParams>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace_id = required(params.workspace_id, "workspaceId")?;
    let list = state
        .db
        .run(move |db| projects::list(db, &user, &workspace_id))
        .await?;
    Ok(data(list))
}

async fn create_project(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    ApiJson(req): ApiJson<NewProject>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .db
        .run(move |db| projects::create(db, &user, req))
        .await?;
    Ok((StatusCode::CREATED, data(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .db
        .run(move |db| projects::get(db, &user, &project_id))
        .await?;
    Ok(data(project))
}

async fn update_project(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(project_id): Path<String>,
    ApiJson(req): ApiJson<ProjectPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .db
        .run(move |db| projects::update(db, &user, &project_id, req))
        .await?;
    Ok(data(project))
}

async fn delete_project(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .db
        .run(move |db| projects::delete(db, &user, &project_id))
        .await?;
    Ok(data(Deleted { id: project.id }))
}

// Tasks

async fn list_tasks(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Query(params): Query<ListTasksParams>,
) -> Result<impl IntoResponse, ApiError> {
    let filters = params.filters()?;
    let workspace_id = required(params.workspace_id, "workspaceId")?;
    let page = state
        .db
        .run(move |db| tasks::list(db, &user, &workspace_id, &filters))
        .await?;
    Ok(data(page))
}

async fn create_task(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    ApiJson(req): ApiJson<NewTask>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .db
        .run(move |db| tasks::create(db, &user, req))
        .await?;
    broadcast_message(
        &state.events,
        &task.task.workspace_id,
        None,
        &WsMessage::TaskCreated { task: task.clone() },
    );
    Ok((StatusCode::CREATED, data(task)))
}

async fn get_task(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .db
        .run(move |db| tasks::get(db, &user, &task_id))
        .await?;
    Ok(data(task))
}

async fn update_task(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(task_id): Path<String>,
    ApiJson(req): ApiJson<TaskPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .db
        .run(move |db| tasks::update(db, &user, &task_id, req))
        .await?;
    broadcast_message(
        &state.events,
        &task.task.workspace_id,
        None,
        &WsMessage::TaskUpdated { task: task.clone() },
    );
    Ok(data(task))
}

async fn delete_task(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .db
        .run(move |db| tasks::delete(db, &user, &task_id))
        .await?;
    broadcast_message(
        &state.events,
        &task.workspace_id,
        None,
        &WsMessage::TaskDeleted {
            task_id: task.id.clone(),
        },
    );
    Ok(data(Deleted { id: task.id }))
}

// Chat

async fn list_conversations(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Query(params): Query<WorkspaceParams>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace_id = required(params.workspace_id, "workspaceId")?;
    let conversations = state
        .db
        .run(move |db| chat::list_conversations(db, &user, &workspace_id))
        .await?;
    Ok(data(conversations))
}

async fn create_conversation(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    ApiJson(req): ApiJson<NewConversation>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state
        .db
        .run(move |db| chat::create_conversation(db, &user, req))
        .await?;
    broadcast_message(
        &state.events,
        &conversation.workspace_id,
        Some(conversation.member_ids.clone()),
        &WsMessage::ConversationCreated {
            conversation: conversation.clone(),
        },
    );
    Ok((StatusCode::CREATED, data(conversation)))
}

async fn list_messages(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    Query(params): Query<ListMessagesParams>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation_id = required(params.conversation_id, "conversationId")?;
    let after = params.after;
    let messages = state
        .db
        .run(move |db| chat::list_messages(db, &user, &conversation_id, after.as_deref()))
        .await?;
    Ok(data(messages))
}

async fn send_message(
    State(state): State<SharedState>,
    CurrentUser { user, .. }: CurrentUser,
    ApiJson(req): ApiJson<NewMessage>,
) -> Result<impl IntoResponse, ApiError> {
    let max_len = state.max_message_len;
    let (conversation, message) = state
        .db
        .run(move |db| chat::send_message(db, &user, req, max_len))
        .await?;
    broadcast_message(
        &state.events,
        &conversation.workspace_id,
        Some(conversation.member_ids),
        &WsMessage::MessageSent {
            message: message.clone(),
        },
    );
    Ok((StatusCode::CREATED, data(message)))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_app() -> (Router, SharedState) {
        let state = AppState::new(BoardDb::new_in_memory().unwrap());
        (api_router().with_state(state.clone()), state)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn login_as(app: &Router, name: &str) -> String {
        let resp = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/auth/login",
                None,
                Some(serde_json::json!({"name": name, "email": format!("{}@example.com", name.to_lowercase())})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        body["data"]["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let response = app
            .oneshot(request("GET", "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_requests_without_session_are_unauthorized() {
        let (app, _) = test_app();
        let response = app
            .clone()
            .oneshot(request("GET", "/api/workspaces", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["error"], "Unauthorized");

        let response = app
            .oneshot(request("GET", "/api/workspaces", Some("bogus"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_current_and_logout() {
        let (app, _) = test_app();
        let token = login_as(&app, "Ada").await;

        let response = app
            .clone()
            .oneshot(request("GET", "/api/auth/current", Some(&token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["data"]["email"], "ada@example.com");

        let response = app
            .clone()
            .oneshot(request("POST", "/api/auth/logout", Some(&token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request("GET", "/api/auth/current", Some(&token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request_with_error_shape() {
        let (app, _) = test_app();
        let token = login_as(&app, "Ada").await;
        let response = app
            .oneshot(request(
                "POST",
                "/api/workspaces",
                Some(&token),
                Some(serde_json::json!({"imageUrl": "x"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_missing_workspace_param_is_bad_request() {
        let (app, _) = test_app();
        let token = login_as(&app, "Ada").await;
        let response = app
            .oneshot(request("GET", "/api/tasks", Some(&token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["error"], "workspaceId is required");
    }

    #[tokio::test]
    async fn test_invalid_status_filter_is_bad_request() {
        let (app, _) = test_app();
        let token = login_as(&app, "Ada").await;
        let response = app
            .oneshot(request(
                "GET",
                "/api/tasks?workspaceId=w1&status=blocked",
                Some(&token),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_task_broadcasts_ws() {
        let (app, state) = test_app();
        let token = login_as(&app, "Ada").await;
        let mut rx = state.events.subscribe();

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/workspaces",
                Some(&token),
                Some(serde_json::json!({"name": "Acme"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let workspace: serde_json::Value = body_json(response.into_body()).await;
        let workspace_id = workspace["data"]["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/projects",
                Some(&token),
                Some(serde_json::json!({"name": "Website", "workspaceId": workspace_id})),
            ))
            .await
            .unwrap();
        let project: serde_json::Value = body_json(response.into_body()).await;
        let project_id = project["data"]["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(request(
                "POST",
                "/api/tasks",
                Some(&token),
                Some(serde_json::json!({
                    "name": "WS test task",
                    "status": "todo",
                    "workspaceId": workspace_id,
                    "projectId": project_id,
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.workspace_id, workspace_id);
        assert!(event.audience.is_none());
        let parsed: serde_json::Value = serde_json::from_str(&event.payload).unwrap();
        assert_eq!(parsed["type"], "TaskCreated");
        assert_eq!(parsed["data"]["task"]["name"], "WS test task");
        assert_eq!(parsed["data"]["task"]["position"], 1000);
    }

    #[test]
    fn test_board_errors_map_to_api_errors() {
        assert!(matches!(
            ApiError::from(BoardError::Unauthorized),
            ApiError::Unauthorized
        ));
        match ApiError::from(BoardError::not_found("Task", "t1")) {
            ApiError::NotFound(msg) => assert_eq!(msg, "Task t1 not found"),
            other => panic!("unexpected {:?}", other),
        }
        match ApiError::from(BoardError::Internal(anyhow::anyhow!("secret path /var/db"))) {
            ApiError::Internal(msg) => assert!(!msg.contains("secret")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
