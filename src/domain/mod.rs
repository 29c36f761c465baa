//! Domain module
//!
//! Core domain types: RBAC model, directory shadow, events and payloads.

pub mod context;
pub mod directory;
pub mod error;
pub mod events;
pub mod payload;
pub mod rbac;

pub use context::{AuthContext, SUPERUSER_SCOPE};
pub use directory::{DirectoryUser, SyncStatus, UserStatus};
pub use error::DomainError;
pub use events::{IdentityEvent, IdentityEventError, RbacEvent};
pub use payload::{Payload, Scalar};
pub use rbac::{Assignment, GrantPattern, NewPermission, Permission, Role, RolePermission};
