mod common;

use bundle_vault::identity::hash_token_actor;
use bundle_vault::models::{
    AuditEventType, AuditOutcome, GetPolicyRequest, ListAuditEventsRequest, PolicyBinding,
    PullActiveBundleRequest, PushBundleVersionRequest, Role, Scope, SetPolicyRequest,
};
use bundle_vault::VaultError;
use chrono::{Duration, TimeZone, Utc};
use common::{
    bind_roles, call, count, env_file, scope, vault, CapturedLogs, ADMIN, READER, WRITER,
};

fn binding(subject: &str, role: Role) -> PolicyBinding {
    PolicyBinding {
        subject: subject.to_string(),
        role,
    }
}

#[tokio::test]
async fn fresh_scope_reports_revision_zero_until_bootstrap() {
    let (vault, pool) = vault().await;
    let revision = bundle_vault::db::policy_bindings::get_revision(&pool, &scope())
        .await
        .unwrap();
    assert_eq!(revision, 0);

    // The bootstrap admin's first contact provisions its binding and bumps the revision.
    let policy = vault
        .policy
        .get_policy(
            &call(ADMIN),
            GetPolicyRequest {
                scope: Some(scope()),
            },
        )
        .await
        .unwrap();
    assert_eq!(policy.policy_revision, 1);
    assert_eq!(policy.bindings, vec![binding(ADMIN, Role::Admin)]);
}

#[tokio::test]
async fn each_set_policy_bumps_revision_by_exactly_one() {
    let (vault, _pool) = vault().await;

    let mut last = None;
    for bindings in [
        vec![binding(ADMIN, Role::Admin)],
        vec![binding(ADMIN, Role::Admin), binding(WRITER, Role::Writer)],
        vec![binding(ADMIN, Role::Admin)],
    ] {
        let response = vault
            .policy
            .set_policy(
                &call(ADMIN),
                SetPolicyRequest {
                    scope: Some(scope()),
                    bindings: bindings.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(response.bindings, bindings);
        if let Some(previous) = last {
            assert_eq!(response.policy_revision, previous + 1);
        }
        last = Some(response.policy_revision);
    }

    let policy = vault
        .policy
        .get_policy(
            &call(ADMIN),
            GetPolicyRequest {
                scope: Some(scope()),
            },
        )
        .await
        .unwrap();
    assert_eq!(Some(policy.policy_revision), last);
    assert_eq!(policy.bindings, vec![binding(ADMIN, Role::Admin)]);
}

#[tokio::test]
async fn set_policy_replaces_bindings_wholesale() {
    let (vault, _pool) = vault().await;
    bind_roles(&vault, &scope()).await;

    vault
        .policy
        .set_policy(
            &call(ADMIN),
            SetPolicyRequest {
                scope: Some(scope()),
                bindings: vec![binding(ADMIN, Role::Admin), binding(READER, Role::Writer)],
            },
        )
        .await
        .unwrap();

    let push = |token: &'static str| {
        let vault = vault.clone();
        async move {
            vault
                .bundles
                .push_bundle_version(
                    &call(token),
                    PushBundleVersionRequest {
                        scope: Some(scope()),
                        files: vec![env_file("A=1")],
                    },
                )
                .await
        }
    };
    assert!(push(READER).await.is_ok());
    assert!(matches!(
        push(WRITER).await,
        Err(VaultError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn invalid_bindings_are_rejected_without_changes() {
    let (vault, pool) = vault().await;
    bind_roles(&vault, &scope()).await;
    let revision_before = bundle_vault::db::policy_bindings::get_revision(&pool, &scope())
        .await
        .unwrap();

    for bindings in [
        vec![binding(" ", Role::Reader)],
        vec![binding("a", Role::Reader), binding("a", Role::Admin)],
    ] {
        let err = vault
            .policy
            .set_policy(
                &call(ADMIN),
                SetPolicyRequest {
                    scope: Some(scope()),
                    bindings,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidArgument(_)));
    }

    assert_eq!(
        bundle_vault::db::policy_bindings::get_revision(&pool, &scope())
            .await
            .unwrap(),
        revision_before
    );
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM policy_bindings").await,
        3
    );
}

#[tokio::test]
async fn audit_events_filter_by_type_actor_and_time() {
    let (vault, _pool) = vault().await;
    bind_roles(&vault, &scope()).await;
    let start = Utc::now();

    vault
        .bundles
        .push_bundle_version(
            &call(WRITER),
            PushBundleVersionRequest {
                scope: Some(scope()),
                files: vec![env_file("A=1")],
            },
        )
        .await
        .unwrap();
    let _ = vault
        .bundles
        .push_bundle_version(
            &call(READER),
            PushBundleVersionRequest {
                scope: Some(scope()),
                files: vec![env_file("A=2")],
            },
        )
        .await;

    let pushes = vault
        .audit
        .list_audit_events(
            &call(ADMIN),
            ListAuditEventsRequest {
                scope: Some(scope()),
                event_type: Some(AuditEventType::Push),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(pushes.events.len(), 2);
    assert_eq!(pushes.events[0].outcome, AuditOutcome::Denied);
    assert_eq!(pushes.events[1].outcome, AuditOutcome::Success);
    assert!(pushes.events[1].bundle_version_id.is_some());

    let by_writer = vault
        .audit
        .list_audit_events(
            &call(ADMIN),
            ListAuditEventsRequest {
                scope: Some(scope()),
                actor: Some(hash_token_actor(WRITER)),
                from_time: Some(start),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(by_writer.events.len(), 1);
    assert_eq!(by_writer.events[0].event_type, AuditEventType::Push);

    let future = vault
        .audit
        .list_audit_events(
            &call(ADMIN),
            ListAuditEventsRequest {
                scope: Some(scope()),
                from_time: Some(Utc::now() + Duration::hours(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(future.events.is_empty());

    let err = vault
        .audit
        .list_audit_events(
            &call(ADMIN),
            ListAuditEventsRequest {
                scope: Some(scope()),
                from_time: Some(Utc::now()),
                to_time: Some(Utc::now() - Duration::hours(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidArgument(_)));
}

#[tokio::test]
async fn audit_events_paginate_and_stay_in_scope() {
    let (vault, _pool) = vault().await;
    let other = Scope::new("ws-other", "proj", "dev");
    bind_roles(&vault, &scope()).await;
    bind_roles(&vault, &other).await;

    for _ in 0..3 {
        vault
            .bundles
            .push_bundle_version(
                &call(WRITER),
                PushBundleVersionRequest {
                    scope: Some(scope()),
                    files: vec![env_file("A=1")],
                },
            )
            .await
            .unwrap();
    }

    let first = vault
        .audit
        .list_audit_events(
            &call(ADMIN),
            ListAuditEventsRequest {
                scope: Some(scope()),
                event_type: Some(AuditEventType::Push),
                limit: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(first.events.len(), 2);
    assert_eq!(first.next_cursor.as_deref(), Some("2"));
    assert!(first.events[0].created_at >= first.events[1].created_at);

    let second = vault
        .audit
        .list_audit_events(
            &call(ADMIN),
            ListAuditEventsRequest {
                scope: Some(scope()),
                event_type: Some(AuditEventType::Push),
                limit: Some(2),
                cursor: first.next_cursor.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(second.events.len(), 1);
    assert!(second.next_cursor.is_none());

    let elsewhere = vault
        .audit
        .list_audit_events(
            &call(ADMIN),
            ListAuditEventsRequest {
                scope: Some(other),
                event_type: Some(AuditEventType::Push),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(elsewhere.events.is_empty());
}

#[tokio::test]
async fn reads_record_list_events() {
    let (vault, pool) = vault().await;
    bind_roles(&vault, &scope()).await;

    vault
        .policy
        .get_policy(
            &call(ADMIN),
            GetPolicyRequest {
                scope: Some(scope()),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM audit_events WHERE event_type = 'list' AND outcome = 'success'"
        )
        .await,
        1
    );
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM audit_events WHERE event_type = 'policy_update'"
        )
        .await,
        1
    );
}

#[tokio::test]
async fn audit_write_failure_does_not_mask_results() {
    let (vault, pool) = vault().await;
    bind_roles(&vault, &scope()).await;
    sqlx::query("DROP TABLE audit_events")
        .execute(&pool)
        .await
        .unwrap();

    let logs = CapturedLogs::default();
    let guard = logs.install();

    let pushed = vault
        .bundles
        .push_bundle_version(
            &call(WRITER),
            PushBundleVersionRequest {
                scope: Some(scope()),
                files: vec![env_file("A=1")],
            },
        )
        .await
        .unwrap();
    let pulled = vault
        .bundles
        .pull_active_bundle(
            &call(READER),
            PullActiveBundleRequest {
                scope: Some(scope()),
                bundle_version_id: None,
            },
        )
        .await
        .unwrap();
    let policy = vault
        .policy
        .set_policy(
            &call(ADMIN),
            SetPolicyRequest {
                scope: Some(scope()),
                bindings: vec![binding(ADMIN, Role::Admin), binding(READER, Role::Reader)],
            },
        )
        .await
        .unwrap();
    let denied = vault
        .bundles
        .push_bundle_version(
            &call(READER),
            PushBundleVersionRequest {
                scope: Some(scope()),
                files: vec![env_file("A=2")],
            },
        )
        .await;
    drop(guard);

    assert_eq!(
        pulled.version.bundle_version_id,
        pushed.version.bundle_version_id
    );
    assert_eq!(pulled.files, vec![env_file("A=1")]);
    assert!(matches!(denied, Err(VaultError::PermissionDenied(_))));

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM bundle_versions").await, 1);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM active_bundle_pointers").await,
        1
    );
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM policy_bindings").await, 2);
    assert_eq!(
        bundle_vault::db::policy_bindings::get_revision(&pool, &scope())
            .await
            .unwrap(),
        policy.policy_revision
    );

    let output = logs.contents();
    assert!(output.contains("audit write failed"), "{output}");
}

#[tokio::test]
async fn ancient_lower_bound_matches_every_event() {
    let (vault, _pool) = vault().await;
    bind_roles(&vault, &scope()).await;

    let events = vault
        .audit
        .list_audit_events(
            &call(ADMIN),
            ListAuditEventsRequest {
                scope: Some(scope()),
                from_time: Some(Utc.with_ymd_and_hms(1600, 1, 1, 0, 0, 0).unwrap()),
                to_time: Some(Utc.with_ymd_and_hms(2300, 1, 1, 0, 0, 0).unwrap()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(events.events.len(), 1);
    assert_eq!(events.events[0].event_type, AuditEventType::PolicyUpdate);
}
