//! Team board back-end: workspaces, projects, tasks, chat and analytics.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    ├─ api.rs   (route handlers, AppState)        │
//! └──────────┘ WebSocket│    ├─ auth.rs  (sessions, CurrentUser)           │
//!                       │    └─ ws.rs    (push channel, WsMessage)         │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  workspaces / projects / tasks / chat /          │
//!                       │  analytics  (membership checks, validation)      │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  db.rs  (BoardDb, DbHandle)  ← query.rs          │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                              |
//! |-----------|-------------------------------------------------------------|
//! | `models`  | Shared types: `Task`, `Conversation`, `Member`, envelopes   |
//! | `query`   | `TaskQuery` condition builder compiled to SQL               |
//! | `db`      | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)         |
//!
//! Repository functions are synchronous and take `&BoardDb`; handlers run
//! them on the blocking pool through `DbHandle::run`.

pub mod analytics;
pub mod api;
pub mod auth;
pub mod chat;
pub mod db;
pub mod models;
pub mod projects;
pub mod query;
pub mod server;
pub mod tasks;
pub mod workspaces;
pub mod ws;
