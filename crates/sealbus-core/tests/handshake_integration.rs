//! Group key transport over real TCP connections.

use std::time::Duration;

use sealbus_core::handshake::{request_group_key, serve_group_key};
use sealbus_core::{Identity, NodeError, SecretStore};
use tempfile::tempdir;
use tokio::net::TcpListener;

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_member_hands_key_to_applicant() {
    let dir = tempdir().unwrap();
    let member = SecretStore::create(dir.path().join("member.redb"), "pw").unwrap();
    let applicant = SecretStore::create(dir.path().join("applicant.redb"), "pw").unwrap();
    member.create_group("team").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let applicant_key = applicant.identity_public_key();
    let member_key = member.identity_public_key();

    let (served, fetched) = tokio::join!(
        serve_group_key(&listener, &member, "team", "M", &applicant_key, TIMEOUT),
        request_group_key(addr, &applicant, "team", "A", &member_key, TIMEOUT),
    );
    served.unwrap();
    fetched.unwrap();

    assert_eq!(
        applicant.get_key_for_group("team"),
        member.get_key_for_group("team")
    );
}

#[tokio::test]
async fn test_impostor_applicant_gets_nothing() {
    let dir = tempdir().unwrap();
    let member = SecretStore::create(dir.path().join("member.redb"), "pw").unwrap();
    let impostor = SecretStore::create(dir.path().join("impostor.redb"), "pw").unwrap();
    member.create_group("team").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // The member expects someone else entirely
    let expected = Identity::generate().public_key();
    let member_key = member.identity_public_key();

    let (served, fetched) = tokio::join!(
        serve_group_key(&listener, &member, "team", "M", &expected, TIMEOUT),
        request_group_key(addr, &impostor, "team", "X", &member_key, TIMEOUT),
    );
    assert!(matches!(served, Err(NodeError::HandshakeAuth(_))));
    assert!(fetched.is_err());
    assert!(!impostor.has_key_for_group("team"));
}

#[tokio::test]
async fn test_applicant_rejects_impostor_member() {
    let dir = tempdir().unwrap();
    let impostor = SecretStore::create(dir.path().join("impostor.redb"), "pw").unwrap();
    let applicant = SecretStore::create(dir.path().join("applicant.redb"), "pw").unwrap();
    impostor.create_group("team").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let applicant_key = applicant.identity_public_key();
    let expected_member = Identity::generate().public_key();

    let (_served, fetched) = tokio::join!(
        serve_group_key(&listener, &impostor, "team", "M", &applicant_key, TIMEOUT),
        request_group_key(addr, &applicant, "team", "A", &expected_member, TIMEOUT),
    );
    assert!(matches!(fetched, Err(NodeError::HandshakeAuth(_))));
    assert!(!applicant.has_key_for_group("team"));
}
