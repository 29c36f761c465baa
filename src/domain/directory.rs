//! Directory shadow model
//!
//! Local mirror of identities owned by the external authentication service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::DomainError;

/// Lifecycle status of a directory user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Inactive,
    Suspended,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
            UserStatus::Suspended => "suspended",
        }
    }
}

impl FromStr for UserStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(UserStatus::Active),
            "inactive" => Ok(UserStatus::Inactive),
            "suspended" => Ok(UserStatus::Suspended),
            other => Err(DomainError::Validation(format!("unknown user status '{}'", other))),
        }
    }
}

/// Freshness of the local copy relative to the authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(DomainError::Validation(format!("unknown sync status '{}'", other))),
        }
    }
}

/// Tenant-scoped shadow of an external identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Identifier assigned by the authentication service
    pub external_id: Uuid,
    pub email: String,
    pub status: UserStatus,
    pub sync_status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DirectoryUser {
    /// Fresh shadow row for a first sync
    pub fn synced(tenant_id: Uuid, external_id: Uuid, email: String, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            external_id,
            email,
            status: UserStatus::Active,
            sync_status: SyncStatus::Synced,
            last_sync_at: Some(at),
            created_at: at,
            updated_at: at,
        }
    }

    /// Apply a re-sync observed at `observed_at`.
    ///
    /// Last writer by timestamp wins: an observation older than `last_sync_at`
    /// only confirms the sync status and leaves the email alone.
    pub fn apply_sync(&mut self, email: &str, observed_at: DateTime<Utc>) {
        let newer = self.last_sync_at.map_or(true, |last| observed_at >= last);
        if newer {
            self.email = email.to_string();
            self.last_sync_at = Some(observed_at);
        }
        self.sync_status = SyncStatus::Synced;
        self.updated_at = Utc::now();
    }
}
