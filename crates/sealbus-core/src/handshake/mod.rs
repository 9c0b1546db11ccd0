//! Authenticated Diffie–Hellman handshake for group key transport.
//!
//! An applicant obtains a group key directly from an existing member, never
//! through the ledger. Both sides exchange signed ephemeral X25519 keys, check
//! the signature against the identity they expect the other side to hold, and
//! wrap the connection in an [`EncryptedStream`] keyed with the shared secret.
//!
//! Key transport over that stream:
//!
//! 1. applicant sends the group name it wants
//! 2. member checks it is the group being shared and sends its base64 key
//! 3. applicant imports the key with [`SecretStore::add_group`]
//!
//! No retries happen here. Callers bound every session with a timeout and
//! start a fresh one after a failure.

mod message;
mod session;
mod stream;

pub use message::{signable, DhMessage};
pub use session::{HandshakeRole, HandshakeSession, HandshakeState};
pub use stream::{EncryptedStream, MAX_LINE_LEN};

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{info, warn};

use crate::error::{NodeError, NodeResult};
use crate::identity::IdentityPublicKey;
use crate::storage::SecretStore;

/// Member side of key transport over an already-connected stream.
pub async fn share_key_over<S>(
    stream: S,
    store: &SecretStore,
    group: &str,
    my_id: &str,
    expected_peer: &IdentityPublicKey,
) -> NodeResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = store
        .get_key_for_group(group)
        .ok_or_else(|| NodeError::UnknownGroup(group.to_string()))?;

    let mut session = HandshakeSession::new(
        HandshakeRole::Responder,
        store.identity(),
        my_id,
        expected_peer.clone(),
    );
    let mut transport = session.run(stream).await?;

    let requested = transport.read_line().await?.ok_or_else(|| {
        NodeError::Transport("Applicant closed before naming a group".to_string())
    })?;
    if requested != group {
        session.close();
        return Err(NodeError::UnknownGroup(format!(
            "applicant asked for '{}', sharing '{}'",
            requested, group
        )));
    }

    transport.write_line(&key).await?;
    transport.shutdown().await?;
    session.close();

    info!(
        group = %group,
        peer = session.peer_id().unwrap_or_default(),
        "Shared group key"
    );
    Ok(())
}

/// Applicant side of key transport over an already-connected stream.
pub async fn fetch_key_over<S>(
    stream: S,
    store: &SecretStore,
    group: &str,
    my_id: &str,
    expected_peer: &IdentityPublicKey,
) -> NodeResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = HandshakeSession::new(
        HandshakeRole::Initiator,
        store.identity(),
        my_id,
        expected_peer.clone(),
    );
    let mut transport = session.run(stream).await?;

    transport.write_line(group).await?;
    let key = transport.read_line().await?.ok_or_else(|| {
        NodeError::Transport(format!("Member closed without sending key for '{}'", group))
    })?;
    session.close();

    store.add_group(group, &key)?;
    info!(
        group = %group,
        peer = session.peer_id().unwrap_or_default(),
        "Joined group"
    );
    Ok(())
}

/// Accept one applicant on `listener` and hand it the key for `group`.
///
/// Waiting for the connection is unbounded; the handshake and transfer that
/// follow must finish within `timeout`.
pub async fn serve_group_key(
    listener: &TcpListener,
    store: &SecretStore,
    group: &str,
    my_id: &str,
    expected_peer: &IdentityPublicKey,
    timeout: Duration,
) -> NodeResult<()> {
    if !store.has_key_for_group(group) {
        return Err(NodeError::UnknownGroup(group.to_string()));
    }

    let (stream, addr) = listener
        .accept()
        .await
        .map_err(|e| NodeError::Transport(e.to_string()))?;
    info!(group = %group, peer_addr = %addr, "Applicant connected");

    match tokio::time::timeout(
        timeout,
        share_key_over(stream, store, group, my_id, expected_peer),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!(group = %group, peer_addr = %addr, "Handshake timed out");
            Err(NodeError::Transport(format!(
                "Handshake timed out after {:?}",
                timeout
            )))
        }
    }
}

/// Connect to a member at `addr` and import the key for `group`.
///
/// Connecting, the handshake and the transfer together must finish within
/// `timeout`.
pub async fn request_group_key<A>(
    addr: A,
    store: &SecretStore,
    group: &str,
    my_id: &str,
    expected_peer: &IdentityPublicKey,
    timeout: Duration,
) -> NodeResult<()>
where
    A: ToSocketAddrs,
{
    let attempt = async {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NodeError::Transport(format!("Connect failed: {}", e)))?;
        fetch_key_over(stream, store, group, my_id, expected_peer).await
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => {
            warn!(group = %group, "Handshake timed out");
            Err(NodeError::Transport(format!(
                "Handshake timed out after {:?}",
                timeout
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_key_transport_over_duplex() {
        let dir = tempdir().unwrap();
        let member = SecretStore::create(dir.path().join("m.redb"), "pw").unwrap();
        let applicant = SecretStore::create(dir.path().join("a.redb"), "pw").unwrap();
        member.create_group("g").unwrap();

        let (m_io, a_io) = tokio::io::duplex(8192);
        let expect_applicant = applicant.identity_public_key();
        let expect_member = member.identity_public_key();

        let (served, fetched) = tokio::join!(
            share_key_over(m_io, &member, "g", "member", &expect_applicant),
            fetch_key_over(a_io, &applicant, "g", "applicant", &expect_member),
        );
        served.unwrap();
        fetched.unwrap();

        assert_eq!(
            applicant.get_key_for_group("g"),
            member.get_key_for_group("g")
        );
    }

    #[tokio::test]
    async fn test_wrong_group_request_is_refused() {
        let dir = tempdir().unwrap();
        let member = SecretStore::create(dir.path().join("m.redb"), "pw").unwrap();
        let applicant = SecretStore::create(dir.path().join("a.redb"), "pw").unwrap();
        member.create_group("g").unwrap();

        let (m_io, a_io) = tokio::io::duplex(8192);
        let expect_applicant = applicant.identity_public_key();
        let expect_member = member.identity_public_key();

        let (served, fetched) = tokio::join!(
            share_key_over(m_io, &member, "g", "member", &expect_applicant),
            fetch_key_over(a_io, &applicant, "h", "applicant", &expect_member),
        );
        assert!(matches!(served, Err(NodeError::UnknownGroup(_))));
        assert!(fetched.is_err());
        assert!(!applicant.has_key_for_group("h"));
    }

    #[tokio::test]
    async fn test_serve_unknown_group_fails_fast() {
        let dir = tempdir().unwrap();
        let member = SecretStore::create(dir.path().join("m.redb"), "pw").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = member.identity_public_key();

        let result = serve_group_key(
            &listener,
            &member,
            "nope",
            "member",
            &peer,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(NodeError::UnknownGroup(_))));
    }

    #[tokio::test]
    async fn test_request_times_out_on_silent_member() {
        let dir = tempdir().unwrap();
        let applicant = SecretStore::create(dir.path().join("a.redb"), "pw").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept but never answer
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let peer = applicant.identity_public_key();
        let result = request_group_key(
            addr,
            &applicant,
            "g",
            "applicant",
            &peer,
            Duration::from_millis(200),
        )
        .await;
        assert!(matches!(result, Err(NodeError::Transport(_))));
    }
}
