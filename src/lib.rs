//! Treasury back-office core
//!
//! Transactional outbox, multi-tenant RBAC and the directory shadow of
//! identities owned by the authentication service.
//! Re-exports modules for the binaries and integration tests.

pub mod api;
pub mod authz;
pub mod bus;
pub mod domain;
pub mod handlers;
pub mod jobs;
pub mod outbox;
pub mod repository;

pub mod config;
pub mod db;
mod error;
pub mod telemetry;

pub use authz::{AuthorizationEngine, AuthzError};
pub use config::Config;
pub use domain::{AuthContext, DomainError};
pub use error::{AppError, AppResult, ErrorResponse};
