//! Agent-backed authentication: key iteration, signature-tag validation
//! and the bridge for forwarded agent channels.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{frame_signature, init_logs, wire};
use sshmux::agent::{Agent, AgentError};
use sshmux::client::{connect_stream, Config, ExecOptions, Handler, Msg};
use sshmux::key::PublicKey;
use sshmux::transport::{
    ChannelOpenKind, ChannelOpenRequest, Packet, TransportEvent,
};
use sshmux::{Channel, ChannelId, Error};

struct TestAgent {
    keys: Vec<PublicKey>,
    /// Keys whose signatures come back framed with the wrong algorithm.
    mismatched: Vec<Vec<u8>>,
    bridged: Arc<AtomicUsize>,
}

#[async_trait]
impl Agent for TestAgent {
    async fn request_identities(&mut self) -> Result<Vec<PublicKey>, AgentError> {
        Ok(self.keys.clone())
    }

    async fn sign_request(&mut self, key: &PublicKey, data: &[u8]) -> Result<Vec<u8>, AgentError> {
        assert!(!data.is_empty());
        let algorithm = if self.mismatched.contains(&key.blob) {
            "ssh-rsa"
        } else {
            key.algorithm.as_str()
        };
        Ok(frame_signature(algorithm, b"agent-signature"))
    }

    fn bridge(&mut self, _channel: Channel<Msg>) {
        self.bridged.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Client {
    agent_failures: Arc<AtomicUsize>,
    agent_opens: Arc<AtomicUsize>,
}

impl Client {
    fn new(agent_failures: Arc<AtomicUsize>) -> Self {
        Client {
            agent_failures,
            agent_opens: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Handler for Client {
    type Error = Error;

    async fn auth_agent_failure(&mut self, _error: &AgentError) -> Result<(), Self::Error> {
        self.agent_failures.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn server_channel_open_agent_forward(&mut self, _id: ChannelId) -> Result<(), Self::Error> {
        self.agent_opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn agent_responder(packet: &Packet) -> Vec<TransportEvent> {
    match packet {
        Packet::ServiceRequest { .. } => vec![TransportEvent::ServiceAccept {
            name: "ssh-userauth".to_string(),
        }],
        Packet::AuthNone { .. } => vec![TransportEvent::AuthFailure {
            methods_left: sshmux::auth::MethodSet::PUBLICKEY,
            partial_success: false,
        }],
        Packet::AuthPublicKey {
            key,
            signature: None,
            ..
        } => vec![TransportEvent::AuthPkOk {
            algorithm: key.algorithm.clone(),
            blob: key.blob.clone(),
        }],
        Packet::AuthPublicKey {
            signature: Some(signature),
            ..
        } => {
            assert_eq!(signature, b"agent-signature");
            vec![TransportEvent::AuthSuccess]
        }
        _ => vec![],
    }
}

fn probes(script: &common::Script) -> Vec<Vec<u8>> {
    script
        .sent()
        .iter()
        .filter_map(|p| match p {
            Packet::AuthPublicKey {
                key,
                signature: None,
                ..
            } => Some(key.blob.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn mismatched_signature_advances_to_next_key() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(agent_responder);
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let failures = Arc::new(AtomicUsize::new(0));
    let mut cfg = Config::new("testhost", "u");
    cfg.agent = Some(Box::new(TestAgent {
        keys: vec![
            PublicKey::new("ssh-ed25519", b"k1".to_vec()),
            PublicKey::new("ssh-ed25519", b"k2".to_vec()),
        ],
        mismatched: vec![b"k1".to_vec()],
        bridged: Arc::new(AtomicUsize::new(0)),
    }));
    connect_stream(cfg, stream, transport, Client::new(failures.clone()))
        .await
        .unwrap();

    // One bad signature, then the second key carried the attempt.
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(probes(&script), vec![b"k1".to_vec(), b"k2".to_vec()]);
    let signed = script
        .sent()
        .iter()
        .filter(|p| matches!(p, Packet::AuthPublicKey { signature: Some(_), key, .. } if key.blob == b"k2"))
        .count();
    assert_eq!(signed, 1);
}

#[tokio::test]
async fn exhausted_agent_keys_fall_through() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(agent_responder);
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let failures = Arc::new(AtomicUsize::new(0));
    let mut cfg = Config::new("testhost", "u");
    cfg.agent = Some(Box::new(TestAgent {
        keys: vec![
            PublicKey::new("ssh-ed25519", b"k1".to_vec()),
            PublicKey::new("ssh-ed25519", b"k2".to_vec()),
        ],
        mismatched: vec![b"k1".to_vec(), b"k2".to_vec()],
        bridged: Arc::new(AtomicUsize::new(0)),
    }));
    let err = connect_stream(cfg, stream, transport, Client::new(failures.clone()))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AllAuthMethodsFailed), "{err:?}");
    assert_eq!(failures.load(Ordering::SeqCst), 2);
    assert_eq!(probes(&script), vec![b"k1".to_vec(), b"k2".to_vec()]);
}

#[tokio::test]
async fn forwarded_agent_channels_reach_the_bridge() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(|packet| {
        match packet {
            Packet::ServiceRequest { .. } => vec![TransportEvent::ServiceAccept {
                name: "ssh-userauth".to_string(),
            }],
            Packet::AuthNone { .. } => vec![TransportEvent::AuthSuccess],
            Packet::ChannelOpenSession { sender, .. } => {
                vec![TransportEvent::ChannelOpenConfirmation {
                    recipient: *sender,
                    sender: 40,
                    window_size: 1 << 20,
                    maximum_packet_size: 32768,
                }]
            }
            Packet::AgentForward { .. } => {
                // Granting the request is what latches the permission on.
                vec![TransportEvent::ChannelSuccess {
                    recipient: 0u32.into(),
                }]
            }
            Packet::Exec { .. } => vec![TransportEvent::ChannelSuccess {
                recipient: 0u32.into(),
            }],
            _ => vec![],
        }
    });
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let bridged = Arc::new(AtomicUsize::new(0));
    let mut cfg = Config::new("testhost", "u");
    cfg.agent = Some(Box::new(TestAgent {
        keys: vec![],
        mismatched: vec![],
        bridged: bridged.clone(),
    }));
    cfg.agent_forward = true;
    let client = Client::new(Arc::new(AtomicUsize::new(0)));
    let agent_opens = client.agent_opens.clone();
    let handle = connect_stream(cfg, stream, transport, client).await.unwrap();

    let _channel = handle.exec("true", ExecOptions::default()).await.unwrap();
    script
        .wait_for_packet(|p| matches!(p, Packet::AgentForward { .. }))
        .await;

    // Now the server opens an agent channel back towards us.
    script.inject([TransportEvent::ChannelOpen(ChannelOpenRequest {
        kind: ChannelOpenKind::AgentForward,
        sender_channel: 41,
        initial_window_size: 4096,
        maximum_packet_size: 4096,
    })]);
    script
        .wait_for_packet(|p| matches!(p, Packet::ChannelOpenConfirmation { recipient: 41, .. }))
        .await;
    assert_eq!(bridged.load(Ordering::SeqCst), 1);
    assert_eq!(agent_opens.load(Ordering::SeqCst), 1);
}
