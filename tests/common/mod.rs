//! A scripted stand-in for the framed transport: outbound packets are
//! recorded and may trigger scripted reply events, and tests can inject
//! unsolicited server events at any time. A small pump task writes a
//! wake-up byte into the client's stream whenever events are queued, so
//! the event loop drains them exactly like parsed wire data.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use sshmux::key::PublicKey;
use sshmux::transport::{
    CompatFlags, HandshakeSummary, Packet, SignatureDomain, Transport, TransportError,
    TransportEvent,
};
use sshmux::{Preferred, SshId};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

type Responder = Box<dyn FnMut(&Packet) -> Vec<TransportEvent> + Send>;

enum Signal {
    Kick,
    Close,
}

struct Shared {
    pending: Mutex<VecDeque<TransportEvent>>,
    sent: Mutex<Vec<Packet>>,
    responder: Mutex<Option<Responder>>,
    kick: mpsc::UnboundedSender<Signal>,
    version: OnceLock<String>,
    compat: Mutex<CompatFlags>,
    cleaned_up: Mutex<bool>,
}

pub struct ScriptedTransport {
    shared: Arc<Shared>,
}

/// The test's remote control over a [`ScriptedTransport`].
#[derive(Clone)]
pub struct Script {
    shared: Arc<Shared>,
}

impl Script {
    /// Queue unsolicited server events and wake the client loop.
    pub fn inject(&self, events: impl IntoIterator<Item = TransportEvent>) {
        self.shared.pending.lock().unwrap().extend(events);
        let _ = self.shared.kick.send(Signal::Kick);
    }

    /// Install the reply script: called once per outbound packet, the
    /// returned events are delivered back to the client.
    pub fn respond_with(&self, f: impl FnMut(&Packet) -> Vec<TransportEvent> + Send + 'static) {
        *self.shared.responder.lock().unwrap() = Some(Box::new(f));
    }

    /// Everything the client has sent so far.
    pub fn sent(&self) -> Vec<Packet> {
        self.shared.sent.lock().unwrap().clone()
    }

    pub fn set_compat(&self, flags: CompatFlags) {
        *self.shared.compat.lock().unwrap() = flags;
    }

    pub fn was_cleaned_up(&self) -> bool {
        *self.shared.cleaned_up.lock().unwrap()
    }

    /// Kill the connection from the server side: the client sees EOF.
    pub fn close(&self) {
        let _ = self.shared.kick.send(Signal::Close);
    }

    /// Queue the usual session preamble: server identification and a
    /// finished handshake.
    pub fn handshake(&self, version: &str) {
        let _ = self.shared.version.set(version.to_string());
        self.inject([
            TransportEvent::Version {
                ident: version.to_string(),
            },
            TransportEvent::HandshakeComplete {
                summary: HandshakeSummary {
                    kex: "curve25519-sha256".into(),
                    host_key: "ssh-ed25519".into(),
                    cipher: "chacha20-poly1305@openssh.com".into(),
                    mac: "hmac-sha2-256".into(),
                    compression: "none".into(),
                },
            },
        ]);
    }

    /// Wait until a sent packet satisfies `pred`, or panic after a
    /// couple of seconds.
    pub async fn wait_for_packet(&self, mut pred: impl FnMut(&Packet) -> bool) -> Packet {
        for _ in 0..200 {
            if let Some(p) = self.shared.sent.lock().unwrap().iter().find(|p| pred(p)) {
                return p.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("packet never sent; sent so far: {:#?}", self.sent());
    }

    /// Wait until the whole sent history satisfies `pred`.
    pub async fn wait_for(&self, mut pred: impl FnMut(&[Packet]) -> bool) {
        for _ in 0..200 {
            if pred(&self.sent()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never reached; sent so far: {:#?}", self.sent());
    }
}

impl Transport for ScriptedTransport {
    fn configure(&mut self, _id: &SshId, _preferred: &Preferred) {}

    fn feed(
        &mut self,
        _data: &[u8],
        events: &mut Vec<TransportEvent>,
    ) -> Result<(), TransportError> {
        events.extend(self.shared.pending.lock().unwrap().drain(..));
        Ok(())
    }

    fn send(&mut self, packet: Packet) -> Result<(), TransportError> {
        let replies = {
            let mut responder = self.shared.responder.lock().unwrap();
            match responder.as_mut() {
                Some(f) => f(&packet),
                None => Vec::new(),
            }
        };
        self.shared.sent.lock().unwrap().push(packet);
        if !replies.is_empty() {
            self.shared.pending.lock().unwrap().extend(replies);
            let _ = self.shared.kick.send(Signal::Kick);
        }
        Ok(())
    }

    fn flush(&mut self, _out: &mut Vec<u8>) -> Result<(), TransportError> {
        Ok(())
    }

    fn auth_sign_data(
        &self,
        user: &str,
        key: &PublicKey,
        _domain: SignatureDomain<'_>,
    ) -> Result<Vec<u8>, TransportError> {
        Ok(format!("sign over session id for {user} with {}", key.algorithm).into_bytes())
    }

    fn compat_flags(&self) -> CompatFlags {
        *self.shared.compat.lock().unwrap()
    }

    fn remote_version(&self) -> Option<&str> {
        self.shared.version.get().map(String::as_str)
    }

    fn cleanup(&mut self) {
        *self.shared.cleaned_up.lock().unwrap() = true;
    }
}

/// A scripted transport plus the stream to hand to `connect_stream`.
pub fn wire() -> (ScriptedTransport, Script, DuplexStream) {
    let (kick_tx, mut kick_rx) = mpsc::unbounded_channel();
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let (mut server_read, mut server_write) = tokio::io::split(server_end);

    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                signal = kick_rx.recv() => match signal {
                    Some(Signal::Kick) => {
                        if server_write.write_all(&[0]).await.is_err() {
                            break;
                        }
                    }
                    Some(Signal::Close) | None => {
                        let _ = server_write.shutdown().await;
                        break;
                    }
                },
                // The transport under test frames nothing, so whatever
                // the client writes is drained and dropped.
                r = server_read.read(&mut buf) => match r {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                },
            }
        }
    });

    let shared = Arc::new(Shared {
        pending: Mutex::new(VecDeque::new()),
        sent: Mutex::new(Vec::new()),
        responder: Mutex::new(None),
        kick: kick_tx,
        version: OnceLock::new(),
        compat: Mutex::new(CompatFlags::empty()),
        cleaned_up: Mutex::new(false),
    });
    (
        ScriptedTransport {
            shared: shared.clone(),
        },
        Script { shared },
        client_end,
    )
}

/// Frame a raw signature the way an agent replies: `string algorithm,
/// string signature`.
pub fn frame_signature(algorithm: &str, signature: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in [algorithm.as_bytes(), signature] {
        let mut header = [0u8; 4];
        BigEndian::write_u32(&mut header, part.len() as u32);
        out.extend_from_slice(&header);
        out.extend_from_slice(part);
    }
    out
}

pub fn init_logs() {
    let _ = env_logger::try_init();
}
