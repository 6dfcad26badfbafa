//! The framed-transport collaborator seam.
//!
//! Everything below the connection layer (version exchange details,
//! packet framing, key exchange, ciphers, MACs, compression, host key
//! verification) lives behind [`Transport`]. The trait is sans-io: the
//! event loop owns the socket, feeds inbound bytes in and writes pending
//! outbound bytes back out, so any framing implementation (or a scripted
//! stand-in, in tests) can be plugged underneath the same orchestration.

use bitflags::bitflags;
use thiserror::Error;

use crate::auth::{MethodSet, Prompt};
use crate::key::PublicKey;
use crate::negotiation::Preferred;
use crate::{ChannelId, ChannelOpenFailure, Disconnect, ErrorLevel, Sig, SshId};

/// A failure reported by the transport collaborator.
///
/// The variant is the routing level: handshake failures happen before the
/// userauth service starts and abort `connect`; protocol violations are
/// fatal to an established connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn level(&self) -> ErrorLevel {
        match self {
            TransportError::Handshake(_) => ErrorLevel::Handshake,
            TransportError::Protocol(_) => ErrorLevel::Protocol,
        }
    }
}

bitflags! {
    /// Peer quirks detected by the transport from the remote version string.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CompatFlags: u32 {
        /// The peer omits or garbles the assigned port in the reply to a
        /// dynamic (port 0) `tcpip-forward` request.
        const DYN_RPORT_BUG = 1;
    }
}

/// Outbound connection-layer operations, one variant per wire message the
/// client can originate. The transport encodes and frames these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ServiceRequest {
        name: String,
    },
    AuthNone {
        user: String,
    },
    AuthPassword {
        user: String,
        password: String,
        new_password: Option<String>,
    },
    /// A probe when `signature` is `None`, the real request otherwise. The
    /// signature is the raw blob; the transport adds the algorithm frame.
    AuthPublicKey {
        user: String,
        key: PublicKey,
        signature: Option<Vec<u8>>,
    },
    AuthHostBased {
        user: String,
        key: PublicKey,
        local_hostname: String,
        local_username: String,
        signature: Vec<u8>,
    },
    AuthKeyboardInteractive {
        user: String,
        submethods: String,
    },
    AuthInfoResponse {
        responses: Vec<String>,
    },
    /// Liveness probe (`keepalive@openssh.com` global request, want_reply).
    Ping,
    Disconnect {
        reason: Disconnect,
        description: String,
    },
    TcpIpForward {
        address: String,
        port: u32,
        want_reply: bool,
    },
    CancelTcpIpForward {
        address: String,
        port: u32,
        want_reply: bool,
    },
    StreamLocalForward {
        socket_path: String,
        want_reply: bool,
    },
    CancelStreamLocalForward {
        socket_path: String,
        want_reply: bool,
    },
    NoMoreSessions {
        want_reply: bool,
    },
    RequestSuccess,
    RequestFailure,
    ChannelOpenSession {
        sender: ChannelId,
        window_size: u32,
        maximum_packet_size: u32,
    },
    ChannelOpenDirectTcpIp {
        sender: ChannelId,
        window_size: u32,
        maximum_packet_size: u32,
        host_to_connect: String,
        port_to_connect: u32,
        originator_address: String,
        originator_port: u32,
    },
    ChannelOpenDirectStreamLocal {
        sender: ChannelId,
        window_size: u32,
        maximum_packet_size: u32,
        socket_path: String,
    },
    ChannelOpenConfirmation {
        recipient: u32,
        sender: ChannelId,
        window_size: u32,
        maximum_packet_size: u32,
    },
    ChannelOpenFailure {
        recipient: u32,
        reason: ChannelOpenFailure,
        description: String,
    },
    RequestPty {
        recipient: u32,
        want_reply: bool,
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: Vec<(u8, u32)>,
    },
    RequestX11 {
        recipient: u32,
        want_reply: bool,
        single_connection: bool,
        x11_authentication_protocol: String,
        x11_authentication_cookie: String,
        x11_screen_number: u32,
    },
    SetEnv {
        recipient: u32,
        want_reply: bool,
        variable_name: String,
        variable_value: String,
    },
    RequestShell {
        recipient: u32,
        want_reply: bool,
    },
    Exec {
        recipient: u32,
        want_reply: bool,
        command: Vec<u8>,
    },
    RequestSubsystem {
        recipient: u32,
        want_reply: bool,
        name: String,
    },
    AgentForward {
        recipient: u32,
        want_reply: bool,
    },
    Signal {
        recipient: u32,
        signal: Sig,
    },
    WindowChange {
        recipient: u32,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    ChannelData {
        recipient: u32,
        data: Vec<u8>,
    },
    ChannelExtendedData {
        recipient: u32,
        ext: u32,
        data: Vec<u8>,
    },
    ChannelWindowAdjust {
        recipient: u32,
        amount: u32,
    },
    ChannelEof {
        recipient: u32,
    },
    ChannelClose {
        recipient: u32,
    },
    ChannelSuccess {
        recipient: u32,
    },
    ChannelFailure {
        recipient: u32,
    },
}

/// Algorithm names negotiated during the handshake, surfaced to the user
/// through [`crate::client::Handler::handshake`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandshakeSummary {
    pub kex: String,
    pub host_key: String,
    pub cipher: String,
    pub mac: String,
    pub compression: String,
}

/// A server-initiated `CHANNEL_OPEN`, already parsed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenRequest {
    pub kind: ChannelOpenKind,
    /// The peer's channel number.
    pub sender_channel: u32,
    pub initial_window_size: u32,
    pub maximum_packet_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpenKind {
    ForwardedTcpIp {
        connected_address: String,
        connected_port: u32,
        originator_address: String,
        originator_port: u32,
    },
    ForwardedStreamLocal {
        socket_path: String,
    },
    AgentForward,
    X11 {
        originator_address: String,
        originator_port: u32,
    },
    Unknown {
        typ: String,
    },
}

/// A `CHANNEL_REQUEST` from the server, parsed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    ExitStatus {
        exit_status: u32,
    },
    ExitSignal {
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    Keepalive {
        want_reply: bool,
    },
    Unknown {
        typ: String,
        want_reply: bool,
    },
}

/// Parsed inbound connection-layer events, one variant per protocol event
/// the transport can surface above the framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The server's identification string was received.
    Version { ident: String },
    /// Free text the server sent before its identification string.
    Greeting { text: String },
    /// Key exchange finished; the connection is ready for services.
    HandshakeComplete { summary: HandshakeSummary },
    ServiceAccept { name: String },
    AuthSuccess,
    AuthFailure {
        methods_left: MethodSet,
        partial_success: bool,
    },
    AuthBanner { message: String },
    AuthPkOk { algorithm: String, blob: Vec<u8> },
    AuthInfoRequest {
        name: String,
        instructions: String,
        prompts: Vec<Prompt>,
    },
    AuthPasswordChangeRequired { prompt: String },
    GlobalRequest {
        name: String,
        want_reply: bool,
        data: Vec<u8>,
    },
    RequestSuccess { data: Vec<u8> },
    RequestFailure,
    ChannelOpen(ChannelOpenRequest),
    ChannelOpenConfirmation {
        recipient: ChannelId,
        sender: u32,
        window_size: u32,
        maximum_packet_size: u32,
    },
    ChannelOpenFailure {
        recipient: ChannelId,
        reason: ChannelOpenFailure,
        description: String,
    },
    ChannelWindowAdjust { recipient: ChannelId, amount: u32 },
    ChannelData { recipient: ChannelId, data: Vec<u8> },
    ChannelExtendedData {
        recipient: ChannelId,
        ext: u32,
        data: Vec<u8>,
    },
    ChannelEof { recipient: ChannelId },
    ChannelClose { recipient: ChannelId },
    ChannelRequest {
        recipient: ChannelId,
        request: ChannelRequest,
    },
    ChannelSuccess { recipient: ChannelId },
    ChannelFailure { recipient: ChannelId },
    Debug {
        always_display: bool,
        message: String,
    },
    Disconnect { reason: u32, description: String },
}

/// What a public-key signature covers, for [`Transport::auth_sign_data`].
#[derive(Debug, Clone, Copy)]
pub enum SignatureDomain<'a> {
    PublicKey,
    HostBased {
        local_hostname: &'a str,
        local_username: &'a str,
    },
}

/// The framed SSH transport.
///
/// Implementations turn inbound bytes into [`TransportEvent`]s and
/// [`Packet`]s into outbound bytes. All methods are synchronous; slow work
/// (signing) happens in the connection layer between `auth_sign_data` and
/// the `Packet` carrying the finished signature.
pub trait Transport: Send {
    /// Install the client identification and algorithm offer. Called once
    /// before any other method.
    fn configure(&mut self, id: &SshId, preferred: &Preferred);

    /// Feed raw bytes read from the peer. Parsed events are appended to
    /// `events` in wire order.
    fn feed(&mut self, data: &[u8], events: &mut Vec<TransportEvent>)
        -> Result<(), TransportError>;

    /// Enqueue an outbound packet for framing.
    fn send(&mut self, packet: Packet) -> Result<(), TransportError>;

    /// Move bytes ready for the socket into `out`.
    fn flush(&mut self, out: &mut Vec<u8>) -> Result<(), TransportError>;

    /// The exact bytes a public-key or hostbased signature must cover for
    /// the current session (session identifier plus the userauth request
    /// fields). Only valid once the handshake completed.
    fn auth_sign_data(
        &self,
        user: &str,
        key: &PublicKey,
        domain: SignatureDomain<'_>,
    ) -> Result<Vec<u8>, TransportError>;

    /// Quirks of the connected peer.
    fn compat_flags(&self) -> CompatFlags {
        CompatFlags::empty()
    }

    /// The peer's identification string, once seen.
    fn remote_version(&self) -> Option<&str>;

    /// Drop per-connection state. Called exactly once during teardown.
    fn cleanup(&mut self);
}

/// Whether the remote identification belongs to an OpenSSH release that
/// understands the `@openssh.com` connection extensions (major version 5
/// or later).
pub(crate) fn supports_openssh_extensions(version: &str) -> bool {
    let Some(rest) = version
        .find("OpenSSH_")
        .and_then(|i| version.get(i + "OpenSSH_".len()..))
    else {
        return false;
    };
    let major: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    match major.len() {
        0 => false,
        1 => major.as_bytes().first().map_or(false, |d| *d >= b'5'),
        // Any multi-digit major is well past 5.
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::supports_openssh_extensions;

    #[test]
    fn vendor_detection() {
        assert!(supports_openssh_extensions("SSH-2.0-OpenSSH_5.3"));
        assert!(supports_openssh_extensions("SSH-2.0-OpenSSH_9.6p1 Ubuntu"));
        assert!(supports_openssh_extensions("SSH-2.0-OpenSSH_10.0"));
        assert!(!supports_openssh_extensions("SSH-2.0-OpenSSH_4.4"));
        assert!(!supports_openssh_extensions("SSH-2.0-OpenSSH_"));
        assert!(!supports_openssh_extensions("SSH-2.0-dropbear_2022.83"));
        assert!(!supports_openssh_extensions("SSH-2.0-libssh-0.11.0"));
    }
}
