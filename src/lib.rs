#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
#![allow(clippy::single_match, clippy::upper_case_acronyms)]
// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Client side of the SSH connection protocol, asynchronous, based on
//! tokio/futures.
//!
//! This crate drives everything that happens *above* a framed SSH
//! transport: user authentication (RFC 4252) and the multiplexing of
//! flow-controlled channels (RFC 4254): interactive sessions, command
//! execution, subsystems such as SFTP, TCP and Unix-domain stream
//! forwarding, agent and X11 forwarding. The transport itself (packet
//! framing, key exchange, ciphers, MACs, host key verification) is a
//! collaborator behind the [`transport::Transport`] trait; key signing and
//! the SSH agent are likewise reached through the [`key::Signer`] and
//! [`agent::Agent`] seams.
//!
//! The normal way to use the crate is to implement [`client::Handler`]
//! for the unsolicited server events you care about, build a
//! [`client::Config`] with the credentials to try, and call
//! [`client::connect`]. Authentication is sequenced internally from the
//! configured credentials; the returned [`client::Handle`] hands out
//! [`Channel`]s:
//!
//! ```no_run
//! # async fn run(transport: impl sshmux::transport::Transport + 'static) -> anyhow::Result<()> {
//! struct Client;
//! impl sshmux::client::Handler for Client {
//!     type Error = sshmux::Error;
//! }
//!
//! let mut config = sshmux::client::Config::new("server.example.com", "user");
//! config.password = Some("hunter2".into());
//! let handle = sshmux::client::connect(config, transport, Client).await?;
//! let mut channel = handle.exec("uptime", Default::default()).await?;
//! while let Some(msg) = channel.wait().await {
//!     println!("{msg:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Internal details of the event loop
//!
//! Each connection is a single tokio task owning the byte stream, the
//! transport and all per-channel state. All protocol events, timers and
//! outbound operations are serialized through that task, so the window
//! arithmetic of flow control never races: a channel's remaining window
//! is only ever touched while the loop handles one event. Handles and
//! channels talk to the loop over message channels and never borrow it.

use std::fmt::{Display, Formatter};
use std::future::{Future, Pending};

use futures::future::Either as EitherFuture;
use thiserror::Error;

pub mod agent;
pub mod auth;
mod channels;
pub mod client;
pub mod key;
/// Message numbers of the userauth and connection protocols, for
/// transport implementations.
pub mod msg;
mod negotiation;
mod session;
pub mod transport;

pub use channels::{
    Channel, ChannelMsg, ChannelReadHalf, ChannelRef, ChannelStream, ChannelWriteHalf, STDERR,
};
pub use negotiation::Preferred;

/// Initial per-channel flow-control window offered to the peer.
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;
/// Largest data packet accepted on a channel, matching the transport default.
pub const DEFAULT_PACKET_SIZE: u32 = 32768;

/// How an [`Error`] should be routed: which layer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLevel {
    /// The transport failed before the userauth service started.
    Handshake,
    /// Malformed or unexpected wire events; fatal to the connection.
    Protocol,
    /// The underlying byte stream failed.
    ClientSocket,
    /// Ready timeout or keepalive exhaustion.
    ClientTimeout,
    /// Name resolution failed while an address family was forced.
    ClientDns,
    /// Authentication methods exhausted, or local signing failed.
    ClientAuthentication,
    /// SSH agent failure; non-fatal, the orchestrator advances.
    Agent,
}

#[derive(Debug, Error)]
pub enum Error {
    /// The framed transport collaborator reported a failure.
    #[error(transparent)]
    Transport(#[from] transport::TransportError),

    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// Message received on a channel this side never opened.
    #[error("Channel not open")]
    WrongChannel,

    /// The peer sent more channel data than the window allowed.
    #[error("Peer overran the flow-control window")]
    WindowExceeded,

    /// Server refused to open a channel.
    #[error("Failed to open channel ({0:?})")]
    ChannelOpenFailure(ChannelOpenFailure),

    /// The server disconnected with a reason other than `BY_APPLICATION`.
    #[error("Disconnected: {message}")]
    Disconnected { reason: u32, message: String },

    /// The stream died before the server identification was seen.
    #[error("Connection lost before handshake")]
    ConnectionLost,

    /// The ready timeout elapsed before authentication completed.
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// Keepalive timeout.
    #[error("Keepalive timeout")]
    KeepaliveTimeout,

    /// Resolution produced no address of the forced family.
    #[error("No addresses of the requested family for {0}")]
    Dns(String),

    /// Every configured authentication method was tried and rejected.
    #[error("All configured authentication methods failed")]
    AllAuthMethodsFailed,

    /// Signing with the configured private key failed.
    #[error(transparent)]
    Signature(#[from] key::SignatureError),

    /// SSH agent failure.
    #[error(transparent)]
    Agent(#[from] agent::AgentError),

    /// Operation attempted while the connection is down.
    #[error("Not connected")]
    NotConnected,

    /// The connection closed while a reply was still pending.
    #[error("No response from server")]
    NoResponse,

    /// The peer answered a request with a failure message.
    #[error("The request was rejected by the other party")]
    RequestDenied,

    /// An `openssh_*` extension was invoked against a non-OpenSSH peer.
    #[error("Remote peer is not OpenSSH >= 5.x; refusing vendor extension")]
    VendorMismatch,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Channel send error")]
    SendError,

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// The routing level of this error. Agent-level errors are recoverable
    /// (the authentication orchestrator skips to the next key); most
    /// others end the connection.
    pub fn level(&self) -> ErrorLevel {
        match self {
            Error::Transport(e) => e.level(),
            Error::Inconsistent
            | Error::WrongChannel
            | Error::WindowExceeded
            | Error::Disconnected { .. } => ErrorLevel::Protocol,
            Error::ConnectionTimeout | Error::KeepaliveTimeout => ErrorLevel::ClientTimeout,
            Error::Dns(_) => ErrorLevel::ClientDns,
            Error::AllAuthMethodsFailed | Error::Signature(_) => ErrorLevel::ClientAuthentication,
            Error::Agent(_) => ErrorLevel::Agent,
            _ => ErrorLevel::ClientSocket,
        }
    }
}

/// The identification string announced to the server before key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshId {
    /// Pass the string to the transport, which appends `\r\n`.
    Standard(String),
    /// Pass the exact bytes; the caller is responsible for the framing.
    Raw(String),
}

impl SshId {
    pub fn as_str(&self) -> &str {
        match self {
            SshId::Standard(s) | SshId::Raw(s) => s,
        }
    }
}

/// A reason for disconnection.
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

/// The type of signals that can be sent to a remote process. If you
/// plan to use custom signals, read [the
/// RFC](https://tools.ietf.org/html/rfc4254#section-6.10) to
/// understand the encoding.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sig {
    ABRT,
    ALRM,
    FPE,
    HUP,
    ILL,
    INT,
    KILL,
    PIPE,
    QUIT,
    SEGV,
    TERM,
    USR1,
    Custom(String),
}

impl Sig {
    pub fn name(&self) -> &str {
        match *self {
            Sig::ABRT => "ABRT",
            Sig::ALRM => "ALRM",
            Sig::FPE => "FPE",
            Sig::HUP => "HUP",
            Sig::ILL => "ILL",
            Sig::INT => "INT",
            Sig::KILL => "KILL",
            Sig::PIPE => "PIPE",
            Sig::QUIT => "QUIT",
            Sig::SEGV => "SEGV",
            Sig::TERM => "TERM",
            Sig::USR1 => "USR1",
            Sig::Custom(ref c) => c,
        }
    }

    pub fn from_name(name: &str) -> Sig {
        match name {
            "ABRT" => Sig::ABRT,
            "ALRM" => Sig::ALRM,
            "FPE" => Sig::FPE,
            "HUP" => Sig::HUP,
            "ILL" => Sig::ILL,
            "INT" => Sig::INT,
            "KILL" => Sig::KILL,
            "PIPE" => Sig::PIPE,
            "QUIT" => Sig::QUIT,
            "SEGV" => Sig::SEGV,
            "TERM" => Sig::TERM,
            "USR1" => Sig::USR1,
            x => Sig::Custom(x.to_string()),
        }
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
    Unknown = 0,
}

impl ChannelOpenFailure {
    pub fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// The identifier of a channel.
pub struct ChannelId(pub(crate) u32);

impl From<ChannelId> for u32 {
    fn from(c: ChannelId) -> u32 {
        c.0
    }
}

impl From<u32> for ChannelId {
    fn from(c: u32) -> ChannelId {
        ChannelId(c)
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns `f(val)` if `val` it is [Some], or a forever pending [Future] if it is [None].
pub(crate) fn future_or_pending<R, F: Future<Output = R>, T>(
    val: Option<T>,
    f: impl FnOnce(T) -> F,
) -> EitherFuture<Pending<R>, F> {
    match val {
        None => EitherFuture::Left(core::future::pending()),
        Some(x) => EitherFuture::Right(f(x)),
    }
}
