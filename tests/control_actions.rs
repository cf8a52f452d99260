//! Integration tests for verified control actions through the engine.

mod common;

use common::TestHost;
use jailwarden::EngineError;
use jailwarden::audit::AuditPhase;
use jailwarden::executor::Phase;
use jailwarden::probe::RunState;

#[tokio::test]
async fn disabling_a_stopped_jail_absorbs_the_not_ok_reply() {
    let host = TestHost::standard().await;
    host.daemon.add_jail("sshd", false);

    let outcome = host.engine.disable("sshd", false).await.unwrap();
    assert!(outcome.success);
    assert!(outcome.nok_ignored);
    assert_eq!(outcome.final_state, Some(RunState::Disabled));

    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["finalState"], "DISABLED");
    assert_eq!(json["nokIgnored"], true);
}

#[tokio::test]
async fn strict_mode_surfaces_the_not_ok_reply() {
    let host = TestHost::standard().await;
    let err = host.engine.enable("sshd", true).await.unwrap_err();
    assert!(matches!(err, EngineError::IdempotentNoOp(_)));
    assert!(host.daemon.is_active("sshd"));
}

#[tokio::test]
async fn disable_then_enable_round_trips() {
    let host = TestHost::standard().await;
    host.daemon.ban("sshd", "192.0.2.1");

    let before = host.engine.list_jails().await;
    assert!(before.jail("sshd").unwrap().enabled);

    let off = host.engine.disable("sshd", false).await.unwrap();
    assert_eq!(off.final_state, Some(RunState::Disabled));
    assert!(!off.nok_ignored);
    assert_eq!(
        off.phases,
        vec![Phase::Idle, Phase::Dispatched, Phase::Verifying, Phase::Succeeded]
    );
    let mid = host.engine.list_jails().await;
    assert!(!mid.jail("sshd").unwrap().enabled);

    let on = host.engine.enable("sshd", false).await.unwrap();
    assert_eq!(on.final_state, Some(RunState::Enabled));
    let after = host.engine.list_jails().await;
    assert!(after.jail("sshd").unwrap().enabled);
}

#[tokio::test]
async fn repeated_enable_is_idempotent() {
    let host = TestHost::standard().await;
    for _ in 0..3 {
        let outcome = host.engine.enable("nginx-404", false).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.final_state, Some(RunState::Enabled));
    }
    assert!(host.daemon.is_active("nginx-404"));
}

#[tokio::test]
async fn toggle_flips_observed_state() {
    let host = TestHost::standard().await;
    let outcome = host.engine.toggle("nginx-404", false).await.unwrap();
    assert_eq!(outcome.final_state, Some(RunState::Enabled));
    let outcome = host.engine.toggle("nginx-404", false).await.unwrap();
    assert_eq!(outcome.final_state, Some(RunState::Disabled));
}

#[tokio::test]
async fn accepted_command_without_effect_fails_verification() {
    let host = TestHost::standard().await;
    host.daemon.freeze("sshd");

    let err = host.engine.disable("sshd", false).await.unwrap_err();
    let EngineError::ActionVerificationFailed(failure) = err else {
        panic!("expected verification failure, got {err:?}");
    };
    assert_eq!(failure.target, "DISABLED");
    assert_eq!(failure.actual, "ENABLED");
    assert!(!failure.suggested_check.is_empty());
}

#[tokio::test]
async fn enable_is_refused_when_the_filter_is_missing() {
    let host = TestHost::builder()
        .jail_conf("[sshd]\nenabled = true\n\n[custom-app]\nfilter = custom-app\n")
        .build()
        .await;
    host.daemon.add_jail("custom-app", false);

    let err = host.engine.enable("custom-app", false).await.unwrap_err();
    assert_eq!(err.error_code(), "preflight_failed");
    assert_eq!(host.daemon.count_calls("start"), 0);
}

#[tokio::test]
async fn invalid_names_never_reach_the_daemon() {
    let host = TestHost::standard().await;
    for bad in ["", "ssh d", "a;rm -rf /", "x".repeat(200).as_str()] {
        let err = host.engine.disable(bad, false).await.unwrap_err();
        assert_eq!(err.error_code(), "validation_error");
    }
    assert!(host.daemon.calls().is_empty());
    assert!(host.engine.audit_recent(10).is_empty());
}

#[tokio::test]
async fn unban_removes_the_address() {
    let host = TestHost::standard().await;
    host.daemon.ban("sshd", "192.0.2.1");
    host.daemon.ban("sshd", "192.0.2.2");

    let outcome = host.engine.unban("sshd", "192.0.2.1").await.unwrap();
    assert!(outcome.success);
    assert_eq!(host.daemon.banned("sshd"), vec!["192.0.2.2"]);

    let view = host.engine.list_jails().await;
    assert_eq!(view.jail("sshd").unwrap().currently_banned, 1);

    let err = host.engine.unban("sshd", "not-an-ip").await.unwrap_err();
    assert_eq!(err.error_code(), "validation_error");
}

#[tokio::test]
async fn unreachable_daemon_is_reported_as_unavailable() {
    let host = TestHost::standard().await;
    host.daemon.set_running(false);
    let err = host.engine.enable("nginx-404", false).await.unwrap_err();
    assert!(matches!(err, EngineError::EnforcementUnavailable(_)));
    assert_eq!(err.status_code().as_u16(), 503);
}

#[tokio::test]
async fn restart_waits_for_the_daemon_and_clears_the_cache() {
    let host = TestHost::standard().await;
    host.engine.list_jails().await;
    assert!(!host.engine.cache().is_empty());

    host.daemon.set_running(false);
    let outcome = host.engine.restart_service().await.unwrap();
    assert!(outcome.success);
    assert!(host.engine.cache().is_empty());
    assert!(host.daemon.count_calls("ping") >= 1);
}

#[tokio::test]
async fn every_action_is_audited_twice() {
    let host = TestHost::standard().await;
    host.engine.disable("sshd", false).await.unwrap();
    let _ = host.engine.enable("nginx-404", true).await;
    host.daemon.freeze("nginx-404");
    let _ = host.engine.disable("nginx-404", false).await;

    let records = host.engine.audit_recent(100);
    assert_eq!(records.len(), 6);
    let attempts = records.iter().filter(|r| r.phase == AuditPhase::Attempt).count();
    assert_eq!(attempts, 3);
    let failed = records
        .iter()
        .filter(|r| r.phase == AuditPhase::Outcome && r.success == Some(false))
        .count();
    assert_eq!(failed, 1);
}
