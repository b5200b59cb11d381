//! Typed HTTP client for the board API.

use reqwest::{Method, RequestBuilder, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::board::models::*;
use crate::errors::ClientError;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Pull `data` out of a `{ "data": ... }` body.
pub fn decode_envelope<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ClientError> {
    let mut value: serde_json::Value = serde_json::from_slice(bytes)?;
    let data = value
        .get_mut("data")
        .map(serde_json::Value::take)
        .ok_or(ClientError::MissingData)?;
    Ok(serde_json::from_value(data)?)
}

/// Message from an `{ "error": ... }` body, or the raw body text.
pub fn decode_error(bytes: &[u8]) -> String {
    serde_json::from_slice::<ErrorBody>(bytes)
        .map(|body| body.error)
        .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned())
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let invalid = |message: String| ClientError::InvalidUrl {
            url: base_url.to_string(),
            message,
        };
        let parsed = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(invalid("URL cannot carry a path".into()));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: parsed,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    /// Append percent-encoded path segments to the base URL.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl {
                url: self.base_url.to_string(),
                message: "URL cannot carry a path".into(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, ClientError> {
        let req = self.http.request(method, self.endpoint(segments)?);
        Ok(match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        })
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ClientError> {
        let resp = req.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            let message = decode_error(&bytes);
            debug!(status = status.as_u16(), message = %message, "API request failed");
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }
        decode_envelope(&bytes)
    }

    // ── Auth ──────────────────────────────────────────────────────────

    /// Sign in and keep the session token for later requests.
    pub async fn login(&mut self, name: &str, email: &str) -> Result<User, ClientError> {
        let body = LoginRequest {
            name: name.to_string(),
            email: email.to_string(),
        };
        let resp: LoginResponse = self
            .send(self.request(Method::POST, &["api", "auth", "login"])?.json(&body))
            .await?;
        self.token = Some(resp.token);
        Ok(resp.user)
    }

    pub async fn current_user(&self) -> Result<User, ClientError> {
        let req = self.request(Method::GET, &["api", "auth", "current"])?;
        self.send(req).await
    }

    pub async fn logout(&mut self) -> Result<(), ClientError> {
        let _: serde_json::Value = self
            .send(self.request(Method::POST, &["api", "auth", "logout"])?)
            .await?;
        self.token = None;
        Ok(())
    }

    // ── Workspaces ────────────────────────────────────────────────────

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>, ClientError> {
        self.send(self.request(Method::GET, &["api", "workspaces"])?).await
    }

    pub async fn create_workspace(&self, input: &NewWorkspace) -> Result<Workspace, ClientError> {
        self.send(self.request(Method::POST, &["api", "workspaces"])?.json(input))
            .await
    }

    pub async fn get_workspace(&self, workspace_id: &str) -> Result<Workspace, ClientError> {
        let req = self.request(Method::GET, &["api", "workspaces", workspace_id])?;
        self.send(req).await
    }

    pub async fn update_workspace(
        &self,
        workspace_id: &str,
        patch: &WorkspacePatch,
    ) -> Result<Workspace, ClientError> {
        self.send(
            self.request(Method::PATCH, &["api", "workspaces", workspace_id])?
                .json(patch),
        )
        .await
    }

    pub async fn delete_workspace(&self, workspace_id: &str) -> Result<Deleted, ClientError> {
        let req = self.request(Method::DELETE, &["api", "workspaces", workspace_id])?;
        self.send(req).await
    }

    pub async fn reset_invite_code(&self, workspace_id: &str) -> Result<Workspace, ClientError> {
        let req = self.request(
            Method::POST,
            &["api", "workspaces", workspace_id, "reset-invite-code"],
        )?;
        self.send(req).await
    }

    pub async fn join_workspace(
        &self,
        workspace_id: &str,
        code: &str,
    ) -> Result<Workspace, ClientError> {
        let body = JoinWorkspace {
            code: code.to_string(),
        };
        self.send(
            self.request(Method::POST, &["api", "workspaces", workspace_id, "join"])?
                .json(&body),
        )
        .await
    }

    pub async fn leave_workspace(&self, workspace_id: &str) -> Result<Deleted, ClientError> {
        let req = self.request(Method::POST, &["api", "workspaces", workspace_id, "leave"])?;
        self.send(req).await
    }

    pub async fn list_members(&self, workspace_id: &str) -> Result<Vec<MemberDetail>, ClientError> {
        self.send(
            self.request(Method::GET, &["api", "members"])?
                .query(&[("workspaceId", workspace_id)]),
        )
        .await
    }

    pub async fn analytics(&self, workspace_id: &str) -> Result<WorkspaceAnalytics, ClientError> {
        let req = self.request(Method::GET, &["api", "workspaces", workspace_id, "analytics"])?;
        self.send(req).await
    }

    pub async fn monthly_analytics(
        &self,
        workspace_id: &str,
    ) -> Result<MonthlyAnalytics, ClientError> {
        let req = self.request(
            Method::GET,
            &["api", "workspaces", workspace_id, "analytics", "monthly"],
        )?;
        self.send(req).await
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub async fn list_projects(&self, workspace_id: &str) -> Result<Vec<Project>, ClientError> {
        self.send(
            self.request(Method::GET, &["api", "projects"])?
                .query(&[("workspaceId", workspace_id)]),
        )
        .await
    }

    pub async fn create_project(&self, input: &NewProject) -> Result<Project, ClientError> {
        self.send(self.request(Method::POST, &["api", "projects"])?.json(input))
            .await
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Project, ClientError> {
        let req = self.request(Method::GET, &["api", "projects", project_id])?;
        self.send(req).await
    }

    pub async fn update_project(
        &self,
        project_id: &str,
        patch: &ProjectPatch,
    ) -> Result<Project, ClientError> {
        self.send(
            self.request(Method::PATCH, &["api", "projects", project_id])?
                .json(patch),
        )
        .await
    }

    pub async fn delete_project(&self, project_id: &str) -> Result<Deleted, ClientError> {
        let req = self.request(Method::DELETE, &["api", "projects", project_id])?;
        self.send(req).await
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub async fn list_tasks(
        &self,
        workspace_id: &str,
        filters: &TaskFilters,
    ) -> Result<TaskPage, ClientError> {
        self.send(
            self.request(Method::GET, &["api", "tasks"])?
                .query(&[("workspaceId", workspace_id)])
                .query(filters),
        )
        .await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<PopulatedTask, ClientError> {
        let req = self.request(Method::GET, &["api", "tasks", task_id])?;
        self.send(req).await
    }

    pub async fn create_task(&self, input: &NewTask) -> Result<TaskDocument, ClientError> {
        self.send(self.request(Method::POST, &["api", "tasks"])?.json(input))
            .await
    }

    pub async fn update_task(
        &self,
        task_id: &str,
        patch: &TaskPatch,
    ) -> Result<TaskDocument, ClientError> {
        self.send(
            self.request(Method::PATCH, &["api", "tasks", task_id])?
                .json(patch),
        )
        .await
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<Deleted, ClientError> {
        let req = self.request(Method::DELETE, &["api", "tasks", task_id])?;
        self.send(req).await
    }

    // ── Chat ──────────────────────────────────────────────────────────

    pub async fn list_conversations(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<Conversation>, ClientError> {
        self.send(
            self.request(Method::GET, &["api", "chat", "conversations"])?
                .query(&[("workspaceId", workspace_id)]),
        )
        .await
    }

    pub async fn create_conversation(
        &self,
        input: &NewConversation,
    ) -> Result<Conversation, ClientError> {
        self.send(
            self.request(Method::POST, &["api", "chat", "conversations"])?
                .json(input),
        )
        .await
    }

    pub async fn list_messages(
        &self,
        conversation_id: &str,
        after: Option<&str>,
    ) -> Result<Vec<Message>, ClientError> {
        let mut req = self
            .request(Method::GET, &["api", "chat", "messages"])?
            .query(&[("conversationId", conversation_id)]);
        if let Some(after) = after {
            req = req.query(&[("after", after)]);
        }
        self.send(req).await
    }

    pub async fn send_message(&self, input: &NewMessage) -> Result<Message, ClientError> {
        self.send(self.request(Method::POST, &["api", "chat", "messages"])?.json(input))
            .await
    }
}
