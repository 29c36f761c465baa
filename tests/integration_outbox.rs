//! Outbox and inbound event integration tests over the in-memory adapters

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use treasury_backoffice::bus::MessageBus;
use treasury_backoffice::handlers::{AssignRoleCommand, ProvisionRoleCommand, RevokeRoleCommand};
use treasury_backoffice::jobs::identity_consumer::{USER_CREATED_DURABLE, USER_UPDATED_DURABLE};
use treasury_backoffice::jobs::{IdentityConsumer, RelayConfig};
use treasury_backoffice::outbox::{OutboxMessage, OutboxRepository, OutboxStatus};
use treasury_backoffice::AuthContext;

mod common;

#[tokio::test]
async fn test_rbac_mutations_reach_the_bus_in_order() {
    let h = common::Harness::new();
    let admin = h.admin();

    let role = h
        .roles
        .provision(ProvisionRoleCommand::new(h.tenant_id, "cashier", "Cashier"), &admin)
        .await
        .unwrap()
        .role;
    let user = Uuid::new_v4();
    h.directory.sync_user(h.tenant_id, user, "cash@acme.io").await.unwrap();
    h.assignments
        .assign(AssignRoleCommand::new(h.tenant_id, user, role.id), &admin)
        .await
        .unwrap();
    h.assignments
        .revoke(RevokeRoleCommand::new(h.tenant_id, user, role.id), &admin)
        .await
        .unwrap();

    let report = h.relay(RelayConfig::default()).run_cycle().await.unwrap();
    assert_eq!(report.claimed, 3);
    assert_eq!(report.published, 3);

    let provisioned = h.bus.messages("treasury.role.provisioned").await;
    let assigned = h.bus.messages("treasury.role.assigned").await;
    let revoked = h.bus.messages("treasury.role.revoked").await;
    assert_eq!((provisioned.len(), assigned.len(), revoked.len()), (1, 1, 1));

    let message = OutboxMessage::from_bytes(&assigned[0]).unwrap();
    assert_eq!(message.tenant_id, h.tenant_id);
    assert_eq!(message.aggregate_id, user);

    // Message ids are the record ids, so consumers can deduplicate
    let records = h.store.outbox_records().await;
    assert_eq!(message.event_id, records[1].id);
    assert!(records.iter().all(|r| r.status == OutboxStatus::Published));
}

#[tokio::test]
async fn test_publish_fails_twice_then_succeeds() {
    let h = common::Harness::new();
    let admin = h.admin();
    h.roles
        .provision(ProvisionRoleCommand::new(h.tenant_id, "viewer", "Viewer"), &admin)
        .await
        .unwrap();
    let record_id = h.store.outbox_records().await[0].id;
    let relay = h.relay(RelayConfig::default());

    h.bus.fail_next_publishes(2);
    for _ in 0..3 {
        relay.run_cycle().await.unwrap();
    }

    let record = h.store.get(record_id).await.unwrap().unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(record.status, OutboxStatus::Published);
    assert!(record.published_at.is_some());
}

#[tokio::test]
async fn test_two_relays_never_share_a_record() {
    let h = common::Harness::new();
    let admin = h.admin();
    for i in 0..6 {
        let code = format!("role_{}", i);
        h.roles
            .provision(ProvisionRoleCommand::new(h.tenant_id, &code, &code), &admin)
            .await
            .unwrap();
    }

    let config = |id: &str| RelayConfig {
        batch_size: 3,
        relay_id: id.to_string(),
        ..RelayConfig::default()
    };
    let first = h.relay(config("relay-a"));
    let second = h.relay(config("relay-b"));

    let (a, b) = tokio::join!(first.run_cycle(), second.run_cycle());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.published + b.published, 6);
    assert_eq!(h.bus.messages("treasury.role.provisioned").await.len(), 6);
}

#[tokio::test]
async fn test_identity_events_feed_the_directory() {
    let h = common::Harness::new();
    let shutdown = CancellationToken::new();
    let consumers = IdentityConsumer::user_lifecycle(
        std::sync::Arc::new(h.bus.clone()),
        h.directory.clone(),
    );
    let handles: Vec<_> = consumers
        .into_iter()
        .map(|consumer| consumer.start(shutdown.clone()))
        .collect();

    let user = Uuid::new_v4();
    let created = json!({
        "user_id": user.to_string(),
        "tenant_id": h.tenant_id.to_string(),
        "email": "ana@acme.io",
        "created_at": "2026-01-01T00:00:00Z",
    });
    let updated = json!({
        "user_id": user.to_string(),
        "tenant_id": h.tenant_id.to_string(),
        "email": "ana.silva@acme.io",
        "updated_at": "2026-01-02T00:00:00Z",
    });
    h.bus.publish("auth.user.created", created.to_string().as_bytes()).await.unwrap();
    h.bus.publish("auth.user.updated", updated.to_string().as_bytes()).await.unwrap();
    // A duplicate creation event must not create a second row
    h.bus.publish("auth.user.created", created.to_string().as_bytes()).await.unwrap();

    let mut settled = false;
    for _ in 0..100 {
        let created_acks = h.bus.acked_count("auth.user.created", USER_CREATED_DURABLE).await;
        let updated_acks = h.bus.acked_count("auth.user.updated", USER_UPDATED_DURABLE).await;
        if created_acks == 2 && updated_acks == 1 {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(settled, "identity events were not all acknowledged");

    let users = h.directory.list_users(h.tenant_id).await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].email, "ana.silva@acme.io");

    // The synced user can now be given a role
    let role = h
        .roles
        .provision(ProvisionRoleCommand::new(h.tenant_id, "viewer", "Viewer"), &h.admin())
        .await
        .unwrap()
        .role;
    h.assignments
        .assign(AssignRoleCommand::new(h.tenant_id, user, role.id), &h.admin())
        .await
        .unwrap();
    assert!(h
        .engine
        .check_role(&AuthContext::new(h.tenant_id, user), "viewer")
        .await
        .unwrap());

    shutdown.cancel();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("consumer should stop")
            .unwrap();
    }
}
