//! Authentication scenarios against a scripted transport: method
//! ordering, fallback, keyboard-interactive rounds, password change and
//! custom strategies.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{init_logs, wire, Script};
use sshmux::auth::{AuthHandler, Method, MethodSet, Prompt};
use sshmux::client::{connect_stream, Config, Handler};
use sshmux::key::{PublicKey, SignatureError, Signer};
use sshmux::transport::{HandshakeSummary, Packet, TransportEvent};
use sshmux::Error;

#[derive(Debug)]
struct Client {
    handshakes: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for Client {
    type Error = Error;

    async fn handshake(&mut self, _summary: &HandshakeSummary) -> Result<(), Self::Error> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn config(host_user: (&str, &str)) -> Config {
    Config::new(host_user.0, host_user.1)
}

fn accept_service(packet: &Packet) -> Option<Vec<TransportEvent>> {
    match packet {
        Packet::ServiceRequest { .. } => Some(vec![TransportEvent::ServiceAccept {
            name: "ssh-userauth".to_string(),
        }]),
        _ => None,
    }
}

fn auth_packets(script: &Script) -> Vec<&'static str> {
    script
        .sent()
        .iter()
        .filter_map(|p| match p {
            Packet::AuthNone { .. } => Some("none"),
            Packet::AuthPassword { .. } => Some("password"),
            Packet::AuthPublicKey {
                signature: None, ..
            } => Some("publickey-probe"),
            Packet::AuthPublicKey {
                signature: Some(_), ..
            } => Some("publickey"),
            Packet::AuthKeyboardInteractive { .. } => Some("keyboard-interactive"),
            Packet::AuthHostBased { .. } => Some("hostbased"),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn password_auth_happy_path() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(|packet| {
        if let Some(events) = accept_service(packet) {
            return events;
        }
        match packet {
            Packet::AuthNone { .. } => vec![TransportEvent::AuthFailure {
                methods_left: MethodSet::PASSWORD,
                partial_success: false,
            }],
            Packet::AuthPassword { user, password, .. } => {
                assert_eq!((user.as_str(), password.as_str()), ("u", "p"));
                vec![TransportEvent::AuthSuccess]
            }
            _ => vec![],
        }
    });
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let handshakes = Arc::new(AtomicUsize::new(0));
    let mut cfg = config(("testhost", "u"));
    cfg.password = Some("p".to_string());
    let handle = connect_stream(
        cfg,
        stream,
        transport,
        Client {
            handshakes: handshakes.clone(),
        },
    )
    .await
    .unwrap();

    assert_eq!(handshakes.load(Ordering::SeqCst), 1);
    assert_eq!(handle.remote_version(), Some("SSH-2.0-OpenSSH_9.6"));
    assert_eq!(auth_packets(&script), vec!["none", "password"]);
}

#[tokio::test]
async fn methods_fall_back_in_order() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(|packet| {
        if let Some(events) = accept_service(packet) {
            return events;
        }
        match packet {
            Packet::AuthNone { .. } => vec![TransportEvent::AuthFailure {
                methods_left: MethodSet::PUBLICKEY,
                partial_success: false,
            }],
            Packet::AuthPassword { .. } => vec![TransportEvent::AuthFailure {
                methods_left: MethodSet::PUBLICKEY,
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
                assert_eq!(signature, b"signed");
                vec![TransportEvent::AuthSuccess]
            }
            _ => vec![],
        }
    });
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let mut cfg = config(("testhost", "u"));
    cfg.password = Some("p".to_string());
    cfg.key = Some(Arc::new(FixedSigner));
    connect_stream(cfg, stream, transport, Client {
        handshakes: Arc::new(AtomicUsize::new(0)),
    })
    .await
    .unwrap();

    assert_eq!(
        auth_packets(&script),
        vec!["none", "password", "publickey-probe", "publickey"]
    );
}

struct FixedSigner;

#[async_trait]
impl Signer for FixedSigner {
    fn public(&self) -> PublicKey {
        PublicKey::new("ssh-ed25519", b"blob".to_vec())
    }

    async fn sign(&self, _data: &[u8]) -> Result<Vec<u8>, SignatureError> {
        Ok(b"signed".to_vec())
    }
}

struct FailingSigner;

#[async_trait]
impl Signer for FailingSigner {
    fn public(&self) -> PublicKey {
        PublicKey::new("ssh-ed25519", b"blob".to_vec())
    }

    async fn sign(&self, _data: &[u8]) -> Result<Vec<u8>, SignatureError> {
        Err(SignatureError("key refused to sign".to_string()))
    }
}

#[tokio::test]
async fn signing_failure_advances_to_next_method() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(|packet| {
        if let Some(events) = accept_service(packet) {
            return events;
        }
        match packet {
            Packet::AuthNone { .. } => vec![TransportEvent::AuthFailure {
                methods_left: MethodSet::PUBLICKEY | MethodSet::KEYBOARD_INTERACTIVE,
                partial_success: false,
            }],
            Packet::AuthPublicKey {
                signature: None, ..
            } => vec![TransportEvent::AuthPkOk {
                algorithm: "ssh-ed25519".to_string(),
                blob: b"blob".to_vec(),
            }],
            Packet::AuthKeyboardInteractive { .. } => vec![TransportEvent::AuthSuccess],
            _ => vec![],
        }
    });
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let mut cfg = config(("testhost", "u"));
    cfg.key = Some(Arc::new(FailingSigner));
    cfg.try_keyboard = true;
    connect_stream(cfg, stream, transport, Client {
        handshakes: Arc::new(AtomicUsize::new(0)),
    })
    .await
    .unwrap();

    // The probe went out, the signature never did.
    assert_eq!(
        auth_packets(&script),
        vec!["none", "publickey-probe", "keyboard-interactive"]
    );
}

struct KeyboardClient;

#[async_trait]
impl Handler for KeyboardClient {
    type Error = Error;

    async fn keyboard_interactive(
        &mut self,
        name: &str,
        _instructions: &str,
        prompts: &[Prompt],
    ) -> Result<Vec<String>, Self::Error> {
        assert_eq!(name, "pam");
        assert_eq!(prompts.len(), 1);
        assert!(!prompts[0].echo);
        Ok(vec!["secret".to_string()])
    }
}

#[tokio::test]
async fn keyboard_interactive_rounds() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(|packet| {
        if let Some(events) = accept_service(packet) {
            return events;
        }
        match packet {
            Packet::AuthNone { .. } => vec![TransportEvent::AuthFailure {
                methods_left: MethodSet::KEYBOARD_INTERACTIVE,
                partial_success: false,
            }],
            // First an empty round, answered without user involvement.
            Packet::AuthKeyboardInteractive { .. } => vec![TransportEvent::AuthInfoRequest {
                name: String::new(),
                instructions: String::new(),
                prompts: vec![],
            }],
            Packet::AuthInfoResponse { responses } if responses.is_empty() => {
                vec![TransportEvent::AuthInfoRequest {
                    name: "pam".to_string(),
                    instructions: "login".to_string(),
                    prompts: vec![Prompt {
                        prompt: "Password:".to_string(),
                        echo: false,
                    }],
                }]
            }
            Packet::AuthInfoResponse { responses } => {
                assert_eq!(responses, &["secret".to_string()]);
                vec![TransportEvent::AuthSuccess]
            }
            _ => vec![],
        }
    });
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let mut cfg = config(("testhost", "u"));
    cfg.try_keyboard = true;
    connect_stream(cfg, stream, transport, KeyboardClient)
        .await
        .unwrap();
}

struct ChangePasswordClient;

#[async_trait]
impl Handler for ChangePasswordClient {
    type Error = Error;

    async fn change_password(&mut self, prompt: &str) -> Result<Option<String>, Self::Error> {
        assert_eq!(prompt, "expired");
        Ok(Some("fresh".to_string()))
    }
}

#[tokio::test]
async fn password_change_request() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(|packet| {
        if let Some(events) = accept_service(packet) {
            return events;
        }
        match packet {
            Packet::AuthNone { .. } => vec![TransportEvent::AuthFailure {
                methods_left: MethodSet::PASSWORD,
                partial_success: false,
            }],
            Packet::AuthPassword {
                password,
                new_password: None,
                ..
            } => {
                assert_eq!(password, "stale");
                vec![TransportEvent::AuthPasswordChangeRequired {
                    prompt: "expired".to_string(),
                }]
            }
            Packet::AuthPassword {
                password,
                new_password: Some(new_password),
                ..
            } => {
                assert_eq!((password.as_str(), new_password.as_str()), ("stale", "fresh"));
                vec![TransportEvent::AuthSuccess]
            }
            _ => vec![],
        }
    });
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let mut cfg = config(("testhost", "u"));
    cfg.password = Some("stale".to_string());
    connect_stream(cfg, stream, transport, ChangePasswordClient)
        .await
        .unwrap();
}

#[tokio::test]
async fn exhausted_methods_fail_the_connect() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(|packet| {
        if let Some(events) = accept_service(packet) {
            return events;
        }
        match packet {
            Packet::AuthNone { .. } | Packet::AuthPassword { .. } => {
                vec![TransportEvent::AuthFailure {
                    methods_left: MethodSet::PUBLICKEY,
                    partial_success: false,
                }]
            }
            _ => vec![],
        }
    });
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let mut cfg = config(("testhost", "u"));
    cfg.password = Some("p".to_string());
    let err = connect_stream(cfg, stream, transport, Client {
        handshakes: Arc::new(AtomicUsize::new(0)),
    })
    .await
    .unwrap_err();
    assert!(matches!(err, Error::AllAuthMethodsFailed), "{err:?}");
}

struct RecordingStrategy {
    calls: Arc<Mutex<Vec<(Option<MethodSet>, bool)>>>,
    queue: Vec<Method>,
}

#[async_trait]
impl AuthHandler for RecordingStrategy {
    async fn next_method(
        &mut self,
        methods_left: Option<&MethodSet>,
        partial_success: bool,
    ) -> Option<Method> {
        self.calls
            .lock()
            .unwrap()
            .push((methods_left.copied(), partial_success));
        if self.queue.is_empty() {
            None
        } else {
            Some(self.queue.remove(0))
        }
    }
}

#[tokio::test]
async fn custom_strategy_sees_partial_success() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(|packet| {
        if let Some(events) = accept_service(packet) {
            return events;
        }
        match packet {
            Packet::AuthNone { .. } => vec![TransportEvent::AuthFailure {
                methods_left: MethodSet::PASSWORD,
                partial_success: true,
            }],
            Packet::AuthPassword { .. } => vec![TransportEvent::AuthSuccess],
            _ => vec![],
        }
    });
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut cfg = config(("testhost", "u"));
    cfg.auth_handler = Some(Box::new(RecordingStrategy {
        calls: calls.clone(),
        queue: vec![
            Method::None,
            Method::Password {
                password: "p".to_string(),
            },
        ],
    }));
    connect_stream(cfg, stream, transport, Client {
        handshakes: Arc::new(AtomicUsize::new(0)),
    })
    .await
    .unwrap();

    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], (None, false));
    assert_eq!(calls[1], (Some(MethodSet::PASSWORD), true));
}
