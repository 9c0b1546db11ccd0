//! Handshake state machine.
//!
//! ```text
//! Init -> AwaitingPeerKey -> KeyAgreed -> Transporting -> Closed
//! ```
//!
//! Any failure moves the session straight to `Closed`. The peer's message is
//! verified against the expected identity before the shared secret is
//! computed.

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, warn};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use super::message::DhMessage;
use super::stream::{read_raw_line, write_raw_line, EncryptedStream};
use crate::crypto::GroupKey;
use crate::error::{NodeError, NodeResult};
use crate::identity::{Identity, IdentityPublicKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    AwaitingPeerKey,
    KeyAgreed,
    Transporting,
    Closed,
}

/// Which side speaks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Sends its key first (the applicant)
    Initiator,
    /// Answers the initiator (the member)
    Responder,
}

/// One authenticated key agreement with a known peer.
pub struct HandshakeSession {
    role: HandshakeRole,
    state: HandshakeState,
    identity: Identity,
    local_id: String,
    expected_peer: IdentityPublicKey,
    peer_id: Option<String>,
}

impl HandshakeSession {
    pub fn new(
        role: HandshakeRole,
        identity: Identity,
        local_id: impl Into<String>,
        expected_peer: IdentityPublicKey,
    ) -> Self {
        Self {
            role,
            state: HandshakeState::Init,
            identity,
            local_id: local_id.into(),
            expected_peer,
            peer_id: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Sender ID announced by the peer, once its message was verified
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    /// Run the exchange over `stream` and return the encrypted transport.
    pub async fn run<S>(&mut self, stream: S) -> NodeResult<EncryptedStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != HandshakeState::Init {
            return Err(NodeError::HandshakeAuth(format!(
                "Session already used (state {:?})",
                self.state
            )));
        }

        match self.exchange(stream).await {
            Ok(transport) => {
                self.state = HandshakeState::Transporting;
                Ok(transport)
            }
            Err(e) => {
                warn!(role = ?self.role, error = %e, "Handshake aborted");
                self.state = HandshakeState::Closed;
                Err(e)
            }
        }
    }

    /// Mark the session finished after the transport is done with.
    pub fn close(&mut self) {
        self.state = HandshakeState::Closed;
    }

    async fn exchange<S>(&mut self, stream: S) -> NodeResult<EncryptedStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stream);

        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).map_err(|e| {
            NodeError::HandshakeAuth(format!("Failed to generate ephemeral key: {}", e))
        })?;
        let ephemeral_secret = X25519StaticSecret::from(seed);
        let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);
        let own = DhMessage::signed(&self.local_id, &ephemeral_public, &self.identity);
        self.state = HandshakeState::AwaitingPeerKey;

        if self.role == HandshakeRole::Initiator {
            write_raw_line(reader.get_mut(), &own.to_line()?).await?;
        }

        let line = read_raw_line(&mut reader).await?.ok_or_else(|| {
            NodeError::Transport("Peer closed the connection during handshake".to_string())
        })?;
        let peer = DhMessage::from_line(&line)
            .map_err(|e| NodeError::HandshakeAuth(e.to_string()))?;
        peer.verify(&self.expected_peer)?;
        let peer_public = peer.ephemeral_key()?;

        if self.role == HandshakeRole::Responder {
            write_raw_line(reader.get_mut(), &own.to_line()?).await?;
        }

        let shared = ephemeral_secret.diffie_hellman(&peer_public);
        if !shared.was_contributory() {
            return Err(NodeError::HandshakeAuth(
                "Peer sent a low-order ephemeral key".to_string(),
            ));
        }
        self.state = HandshakeState::KeyAgreed;
        self.peer_id = Some(peer.sender_id.clone());

        debug!(
            role = ?self.role,
            peer = %peer.sender_id,
            "Handshake key agreed"
        );

        let session_key = GroupKey::from(*shared.as_bytes());
        Ok(EncryptedStream::new(reader, &session_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Identity, Identity) {
        (Identity::generate(), Identity::generate())
    }

    #[tokio::test]
    async fn test_honest_parties_share_key() {
        let (alice, bob) = pair();
        let (a_io, b_io) = tokio::io::duplex(8192);

        let mut initiator =
            HandshakeSession::new(HandshakeRole::Initiator, alice.clone(), "A", bob.public_key());
        let mut responder =
            HandshakeSession::new(HandshakeRole::Responder, bob, "B", alice.public_key());

        let (a, b) = tokio::join!(initiator.run(a_io), responder.run(b_io));
        let mut a = a.unwrap();
        let mut b = b.unwrap();

        assert_eq!(initiator.state(), HandshakeState::Transporting);
        assert_eq!(responder.state(), HandshakeState::Transporting);
        assert_eq!(initiator.peer_id(), Some("B"));
        assert_eq!(responder.peer_id(), Some("A"));

        a.write_line("known string").await.unwrap();
        assert_eq!(b.read_line().await.unwrap().as_deref(), Some("known string"));
        b.write_line("reply").await.unwrap();
        assert_eq!(a.read_line().await.unwrap().as_deref(), Some("reply"));
    }

    #[tokio::test]
    async fn test_impostor_responder_aborts() {
        let (alice, bob) = pair();
        let mallory = Identity::generate();
        let (a_io, b_io) = tokio::io::duplex(8192);

        // Alice expects Bob but Mallory answers
        let mut initiator =
            HandshakeSession::new(HandshakeRole::Initiator, alice.clone(), "A", bob.public_key());
        let mut responder =
            HandshakeSession::new(HandshakeRole::Responder, mallory, "B", alice.public_key());

        let responder_task = tokio::spawn(async move {
            let result = responder.run(b_io).await;
            // Keep the transport open so the initiator fails on the signature,
            // not on end of stream.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            result.map(|_| ())
        });

        let result = initiator.run(a_io).await;
        assert!(matches!(result, Err(NodeError::HandshakeAuth(_))));
        assert_eq!(initiator.state(), HandshakeState::Closed);
        assert!(initiator.peer_id().is_none());

        // Mallory's side completes, but nobody will talk to it
        responder_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_impostor_initiator_rejected_before_reply() {
        let (alice, bob) = pair();
        let mallory = Identity::generate();
        let (a_io, b_io) = tokio::io::duplex(8192);

        let mut initiator =
            HandshakeSession::new(HandshakeRole::Initiator, mallory, "A", bob.public_key());
        let mut responder =
            HandshakeSession::new(HandshakeRole::Responder, bob, "B", alice.public_key());

        let initiator_task = tokio::spawn(async move { initiator.run(a_io).await.map(|_| ()) });

        let result = responder.run(b_io).await;
        assert!(matches!(result, Err(NodeError::HandshakeAuth(_))));
        assert_eq!(responder.state(), HandshakeState::Closed);

        // Responder dropped the stream without answering
        assert!(matches!(
            initiator_task.await.unwrap(),
            Err(NodeError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_session_cannot_be_reused() {
        let (alice, bob) = pair();
        let mut session =
            HandshakeSession::new(HandshakeRole::Initiator, alice, "A", bob.public_key());
        let (a_io, b_io) = tokio::io::duplex(64);
        drop(b_io);
        assert!(session.run(a_io).await.is_err());

        let (a_io, _b_io) = tokio::io::duplex(64);
        assert!(matches!(
            session.run(a_io).await,
            Err(NodeError::HandshakeAuth(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_from_peer_aborts() {
        use tokio::io::AsyncWriteExt;

        let (alice, bob) = pair();
        let (a_io, mut b_io) = tokio::io::duplex(8192);
        let mut responder =
            HandshakeSession::new(HandshakeRole::Responder, alice, "A", bob.public_key());

        b_io.write_all(b"hello there\n").await.unwrap();
        let result = responder.run(a_io).await;
        assert!(matches!(result, Err(NodeError::HandshakeAuth(_))));
    }
}
