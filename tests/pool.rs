mod common;

use common::harness;
use fleetlog::errors::TailErrorKind;
use fleetlog::services::credentials::Credentials;

const GROUP: &str = "3";
const HOST: &str = "10.1.1.1";
const DIR: &str = "/var/log/app";

#[tokio::test]
async fn unreachable_host_yields_none_not_an_error() {
    let h = harness(GROUP, &[(HOST, DIR)], 2).await;
    h.fleet.refuse(HOST);

    let session = h.pool.get_session(HOST, None).await.expect("soft failure");
    assert!(session.is_none());

    // Once the host is reachable again the same pool entry recovers.
    h.fleet.allow(HOST);
    let session = h.pool.get_session(HOST, None).await.expect("recovered");
    assert!(session.is_some());
}

#[tokio::test]
async fn missing_credentials_fail_hard() {
    let h = harness(GROUP, &[(HOST, DIR)], 2).await;
    let err = h
        .pool
        .get_session("10.9.9.9", None)
        .await
        .expect_err("no credentials anywhere");
    assert_eq!(err.kind, TailErrorKind::CredentialsNotFound);
}

#[tokio::test]
async fn explicit_credentials_are_persisted_after_connecting() {
    let h = harness(GROUP, &[(HOST, DIR)], 2).await;
    let creds = Credentials {
        username: "deploy".to_string(),
        secret: "s3cret".to_string(),
    };

    let session = h
        .pool
        .get_session("10.2.2.2", Some(creds.clone()))
        .await
        .expect("connect");
    assert!(session.is_some());
    assert_eq!(h.credentials.get("10.2.2.2").await, Some(creds));
}

#[tokio::test]
async fn changed_credentials_replace_the_connection() {
    let h = harness(GROUP, &[(HOST, DIR)], 2).await;
    let first = h.pool.get_session(HOST, None).await.expect("first connect");
    assert!(first.is_some());
    assert_eq!(h.fleet.connects(), 1);

    let rotated = Credentials {
        username: "ops".to_string(),
        secret: "rotated".to_string(),
    };
    let second = h
        .pool
        .get_session(HOST, Some(rotated.clone()))
        .await
        .expect("reconnect");
    assert!(second.is_some());
    assert_eq!(h.fleet.connects(), 2, "old session replaced by a new dial");
    assert_eq!(h.credentials.get(HOST).await, Some(rotated));

    // Unchanged credentials reuse the existing session.
    let third = h.pool.get_session(HOST, None).await.expect("reuse");
    assert!(third.is_some());
    assert_eq!(h.fleet.connects(), 2);
}

#[tokio::test]
async fn credential_rotation_applies_partial_updates() {
    let h = harness(GROUP, &[(HOST, DIR)], 2).await;

    let updated = h
        .credentials
        .update(HOST, None, Some("rotated"))
        .await
        .expect("update");
    assert!(updated);
    let stored = h.credentials.get(HOST).await.expect("stored entry");
    assert_eq!(stored.username, "ops");
    assert_eq!(stored.secret, "rotated");

    // The next acquisition sees the rotated secret and redials.
    let session = h.pool.get_session(HOST, None).await.expect("connect");
    assert!(session.is_some());

    let missing = h
        .credentials
        .update("10.255.0.1", Some("nobody"), None)
        .await
        .expect("update on unknown host");
    assert!(!missing);
}

#[tokio::test]
async fn close_connection_evicts_and_forgets_credentials() {
    let h = harness(GROUP, &[(HOST, DIR)], 2).await;
    h.pool.get_session(HOST, None).await.expect("connect");
    assert_eq!(h.pool.len(), 1);

    h.pool.close_connection(HOST).await.expect("close");
    assert!(h.pool.is_empty());
    assert_eq!(h.credentials.get(HOST).await, None);
}

#[tokio::test]
async fn close_all_is_idempotent() {
    let h = harness(GROUP, &[(HOST, DIR), ("10.1.1.2", DIR)], 2).await;
    h.pool.get_session(HOST, None).await.expect("connect");
    h.pool.get_session("10.1.1.2", None).await.expect("connect");
    assert_eq!(h.pool.len(), 2);

    h.pool.close_all().await;
    assert!(h.pool.is_empty());
    h.pool.close_all().await;
    assert!(h.pool.is_empty());
}

#[tokio::test]
async fn dead_session_is_redialed_on_next_use() {
    let h = harness(GROUP, &[(HOST, DIR)], 2).await;
    let first = h.pool.get_session(HOST, None).await.expect("connect");
    assert!(!first.expect("session").is_closed());
    assert_eq!(h.fleet.connects(), 1);

    h.fleet.kill_sessions(HOST);

    // The validity check under the connect lock notices the dead transport
    // and dials a fresh session before handing it out.
    let second = h.pool.get_session(HOST, None).await.expect("redial");
    let second = second.expect("session");
    assert!(!second.is_closed());
    assert_eq!(h.fleet.connects(), 2);
}

#[tokio::test]
async fn group_fetch_survives_pool_shutdown_and_restart_state() {
    let h = harness(GROUP, &[(HOST, DIR)], 2).await;
    h.fleet.set_file(HOST, "/var/log/app/svc.log", b"a\nb\n");
    h.tailer.fetch(GROUP, false).await.expect("fetch");
    h.pool.shutdown().await;
    assert!(h.pool.is_empty());

    // Offset and mirror state outlive the connections.
    let records = h.offsets.load(GROUP, HOST, DIR);
    assert_eq!(records["svc.log"].offset, 4);
    assert_eq!(h.mirror_bytes(GROUP, HOST, DIR, "svc.log"), b"a\nb\n");
}
