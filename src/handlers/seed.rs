//! Seed data
//!
//! Default treasury permission catalog and the per-tenant system roles.
//! Both seeders are idempotent and safe to rerun during tenant onboarding.

use uuid::Uuid;

use crate::domain::{AuthContext, DomainError, NewPermission, Role, SUPERUSER_SCOPE};
use crate::error::AppError;

use super::{PermissionHandler, ProvisionRoleCommand, RoleHandler};

/// (code, name, module, action, description)
pub const DEFAULT_PERMISSIONS: &[(&str, &str, &str, &str, &str)] = &[
    ("treasury.payments.create", "Create Payment Intent", "payments", "create", "Create payment intents"),
    ("treasury.payments.process", "Process Payments", "payments", "process", "Process payment transactions"),
    ("treasury.payments.refund", "Process Refunds", "payments", "refund", "Process refunds"),
    ("treasury.payments.approve", "Approve Payments", "payments", "approve", "Approve payments and refunds"),
    ("treasury.payments.view", "View Payments", "payments", "view", "View payment records"),
    ("treasury.invoices.create", "Create Invoices", "invoices", "create", "Create invoices"),
    ("treasury.invoices.edit", "Edit Invoices", "invoices", "edit", "Edit invoices"),
    ("treasury.invoices.approve", "Approve Invoices", "invoices", "approve", "Approve invoices"),
    ("treasury.invoices.send", "Send Invoices", "invoices", "send", "Send invoices to customers"),
    ("treasury.invoices.view", "View Invoices", "invoices", "view", "View invoices"),
    ("treasury.ledger.create", "Create Journal Entries", "ledger", "create", "Create journal entries"),
    ("treasury.ledger.approve", "Approve Journal Entries", "ledger", "approve", "Approve journal entries"),
    ("treasury.ledger.post", "Post Journal Entries", "ledger", "post", "Post journal entries"),
    ("treasury.ledger.reverse", "Reverse Entries", "ledger", "reverse", "Reverse journal entries"),
    ("treasury.ledger.view", "View Ledger", "ledger", "view", "View ledger entries"),
    ("treasury.banking.reconcile", "Reconcile Accounts", "banking", "reconcile", "Reconcile bank accounts"),
    ("treasury.banking.import", "Import Bank Statements", "banking", "import", "Import bank statements"),
    ("treasury.banking.view", "View Bank Accounts", "banking", "view", "View bank accounts"),
    ("treasury.expenses.create", "Create Expenses", "expenses", "create", "Create expenses"),
    ("treasury.expenses.approve", "Approve Expenses", "expenses", "approve", "Approve expenses"),
    ("treasury.expenses.view", "View Expenses", "expenses", "view", "View expenses"),
    ("treasury.config.view", "View Configuration", "config", "view", "View configuration"),
    ("treasury.config.manage", "Manage Configuration", "config", "manage", "Manage configuration"),
    ("treasury.users.manage", "Manage Users", "users", "manage", "Manage users and roles"),
];

/// Template for a role seeded into every tenant
#[derive(Debug, Clone, Copy)]
pub struct SystemRole {
    pub code: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub grants: &'static [&'static str],
}

pub const SYSTEM_ROLES: &[SystemRole] = &[
    SystemRole {
        code: "finance_admin",
        name: "Finance Administrator",
        description: "Full access to all financial operations",
        grants: &[
            "treasury.payments.*",
            "treasury.invoices.*",
            "treasury.ledger.*",
            "treasury.banking.*",
            "treasury.expenses.*",
            "treasury.config.*",
            "treasury.users.manage",
        ],
    },
    SystemRole {
        code: "accountant",
        name: "Accountant",
        description: "Can create/edit invoices, bills, journal entries and process payments",
        grants: &[
            "treasury.payments.create",
            "treasury.payments.process",
            "treasury.payments.refund",
            "treasury.payments.view",
            "treasury.invoices.create",
            "treasury.invoices.edit",
            "treasury.invoices.view",
            "treasury.ledger.create",
            "treasury.ledger.view",
            "treasury.banking.reconcile",
            "treasury.banking.view",
            "treasury.expenses.create",
            "treasury.expenses.view",
        ],
    },
    SystemRole {
        code: "cashier",
        name: "Cashier",
        description: "Can process payments and issue receipts",
        grants: &[
            "treasury.payments.create",
            "treasury.payments.process",
            "treasury.payments.view",
            "treasury.invoices.view",
        ],
    },
    SystemRole {
        code: "approver",
        name: "Approver",
        description: "Can approve invoices, bills, expenses and journal entries",
        grants: &[
            "treasury.payments.approve",
            "treasury.payments.view",
            "treasury.invoices.approve",
            "treasury.invoices.view",
            "treasury.ledger.approve",
            "treasury.ledger.post",
            "treasury.ledger.view",
            "treasury.expenses.approve",
            "treasury.expenses.view",
        ],
    },
    SystemRole {
        code: "viewer",
        name: "Finance Viewer",
        description: "Read-only access to financial data",
        grants: &[
            "treasury.payments.view",
            "treasury.invoices.view",
            "treasury.ledger.view",
            "treasury.banking.view",
            "treasury.expenses.view",
            "treasury.config.view",
        ],
    },
];

/// Insert the missing entries of [`DEFAULT_PERMISSIONS`]; returns how many were created
pub async fn seed_permission_catalog(handler: &PermissionHandler) -> Result<usize, AppError> {
    let mut created = 0;

    for (code, name, module, action, description) in DEFAULT_PERMISSIONS {
        match handler.get_by_code(code).await {
            Ok(_) => continue,
            Err(AppError::Domain(DomainError::NotFound { .. })) => {}
            Err(e) => return Err(e),
        }

        let permission = NewPermission::new(code, name, module, action)
            .with_resource(module)
            .with_description(description);
        handler.create(permission).await?;
        created += 1;
    }

    tracing::info!(created, total = DEFAULT_PERMISSIONS.len(), "Permission catalog seeded");
    Ok(created)
}

/// Provision the [`SYSTEM_ROLES`] a tenant does not have yet.
///
/// Run after the catalog is seeded; grants expand against the catalog as it
/// is at this moment.
pub async fn seed_system_roles(
    handler: &RoleHandler,
    tenant_id: Uuid,
) -> Result<Vec<Role>, AppError> {
    let context = AuthContext::new(tenant_id, Uuid::nil()).with_scope(SUPERUSER_SCOPE);
    let mut created = Vec::new();

    for template in SYSTEM_ROLES {
        match handler.get_by_code(tenant_id, template.code).await {
            Ok(_) => continue,
            Err(AppError::Domain(DomainError::NotFound { .. })) => {}
            Err(e) => return Err(e),
        }

        let command = ProvisionRoleCommand::new(tenant_id, template.code, template.name)
            .with_description(template.description)
            .with_grants(template.grants.iter().copied())
            .system();
        let result = handler.provision(command, &context).await?;
        created.push(result.role);
    }

    tracing::info!(tenant_id = %tenant_id, created = created.len(), "System roles seeded");
    Ok(created)
}
