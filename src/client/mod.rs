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
//

//! The client: configuration, the connection event loop, and the
//! [`Handle`] through which users drive it.
//!
//! [`connect`] dials, spawns one event-loop task per connection and
//! sequences authentication from the configured credentials; it resolves
//! once the server accepts a method (the connection is "ready") or fails
//! with the reason it never became ready. The [`Handle`] then opens
//! channels, binds forwardings and eventually ends the connection. The
//! server talks back through two surfaces: per-channel messages on the
//! [`Channel`] objects, and connection-wide events on the [`Handler`]
//! implementation.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::task::{Context, Poll};
use futures::Future;
use log::{debug, error, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::pin;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;

use crate::agent::Agent;
use crate::auth::{AuthFlow, AuthHandler, ConfiguredMethods, Method, Prompt};
use crate::channels::{Channel, ChannelMsg, ChannelRef, ChannelStream, WindowSizeRef};
use crate::key::Signer;
use crate::negotiation::Preferred;
use crate::session::{ChannelSlot, ChannelTable, Forwardings, GlobalReply};
use crate::transport::{supports_openssh_extensions, HandshakeSummary, Transport, TransportEvent};
use crate::{future_or_pending, ChannelId, Disconnect, Error, SshId};

mod incoming;
mod session;

/// Size of the chunk handed to the transport per socket read.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A pseudo-terminal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyOptions {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    /// Encoded terminal modes, `(opcode, argument)` pairs.
    pub terminal_modes: Vec<(u8, u32)>,
}

impl Default for PtyOptions {
    fn default() -> Self {
        PtyOptions {
            term: "vt100".to_string(),
            col_width: 80,
            row_height: 24,
            pix_width: 640,
            pix_height: 480,
            terminal_modes: Vec::new(),
        }
    }
}

/// An X11 forwarding request for a session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Options {
    pub single_connection: bool,
    pub x11_authentication_protocol: String,
    pub x11_authentication_cookie: String,
    pub x11_screen_number: u32,
}

impl Default for X11Options {
    fn default() -> Self {
        X11Options {
            single_connection: false,
            x11_authentication_protocol: "MIT-MAGIC-COOKIE-1".to_string(),
            x11_authentication_cookie: String::new(),
            x11_screen_number: 0,
        }
    }
}

/// Per-call options for [`Handle::exec`]. No pty by default.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub pty: Option<PtyOptions>,
    /// Environment variables, set fire-and-forget before the command runs.
    pub env: Vec<(String, String)>,
    pub x11: Option<X11Options>,
    /// Request agent forwarding on this channel, in addition to the
    /// connection-wide [`Config::agent_forward`] default.
    pub agent_forward: bool,
}

/// Per-call options for [`Handle::shell`]. A shell gets a default pty
/// unless the caller explicitly clears it.
#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub pty: Option<PtyOptions>,
    pub env: Vec<(String, String)>,
    pub x11: Option<X11Options>,
    pub agent_forward: bool,
}

impl Default for ShellOptions {
    fn default() -> Self {
        ShellOptions {
            pty: Some(PtyOptions::default()),
            env: Vec::new(),
            x11: None,
            agent_forward: false,
        }
    }
}

/// The configuration of a client connection, immutable once passed to
/// [`connect`].
pub struct Config {
    /// Server hostname or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Optional local address to bind before dialing.
    pub bind: Option<(String, u16)>,
    /// Only dial IPv4 addresses. Forcing both families is the same as
    /// forcing neither.
    pub force_ipv4: bool,
    /// Only dial IPv6 addresses.
    pub force_ipv6: bool,
    /// The client ID string sent at the beginning of the protocol.
    pub client_id: SshId,
    /// User to authenticate as. Required.
    pub username: String,
    /// Enables the `password` method.
    pub password: Option<String>,
    /// Enables the `publickey` method, and `hostbased` together with
    /// `local_hostname`/`local_username`.
    pub key: Option<Arc<dyn Signer>>,
    /// Enables the `agent` method.
    pub agent: Option<Box<dyn Agent>>,
    /// Request agent forwarding on every session channel. Requires
    /// `agent`.
    pub agent_forward: bool,
    /// Enables the `keyboard-interactive` method.
    pub try_keyboard: bool,
    pub local_hostname: Option<String>,
    pub local_username: Option<String>,
    /// Custom strategy replacing the default fixed method order.
    pub auth_handler: Option<Box<dyn AuthHandler>>,
    /// Refuse `@openssh.com` extensions unless the peer looks like
    /// OpenSSH 5 or newer.
    pub strict_vendor: bool,
    /// How long the connection may take to become ready (authenticated).
    /// `None` disables the timeout.
    pub ready_timeout: Option<Duration>,
    /// If nothing proves the server alive for this long, send a probe.
    /// `None` disables keepalives.
    pub keepalive_interval: Option<Duration>,
    /// If this many probes have been sent without reply, close the connection.
    pub keepalive_count_max: usize,
    /// The initial size of a channel (used for flow control).
    pub window_size: u32,
    /// The maximal size of a single packet.
    pub maximum_packet_size: u32,
    /// How many messages a channel buffers towards its consumer before
    /// the loop stops reading more data for it.
    pub channel_buffer_size: usize,
    /// Lists of preferred algorithms, handed to the transport.
    pub preferred: Preferred,
}

impl Config {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Config {
            host: host.into(),
            port: 22,
            bind: None,
            force_ipv4: false,
            force_ipv6: false,
            client_id: SshId::Standard(format!(
                "SSH-2.0-{}_{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )),
            username: username.into(),
            password: None,
            key: None,
            agent: None,
            agent_forward: false,
            try_keyboard: false,
            local_hostname: None,
            local_username: None,
            auth_handler: None,
            strict_vendor: true,
            ready_timeout: Some(Duration::from_secs(20)),
            keepalive_interval: None,
            keepalive_count_max: 3,
            window_size: crate::DEFAULT_WINDOW_SIZE,
            maximum_packet_size: crate::DEFAULT_PACKET_SIZE,
            channel_buffer_size: 100,
            preferred: Preferred::default(),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.username.is_empty() {
            return Err(Error::InvalidConfig("username is required".into()));
        }
        if self.agent_forward && self.agent.is_none() {
            return Err(Error::InvalidConfig(
                "agent_forward requires an agent".into(),
            ));
        }
        if self.maximum_packet_size == 0 || self.window_size == 0 {
            return Err(Error::InvalidConfig(
                "window and packet sizes must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// The methods derivable from this configuration, in the order the
    /// default strategy tries them.
    fn eligible_methods(&self) -> VecDeque<Method> {
        let mut queue = VecDeque::new();
        queue.push_back(Method::None);
        if let Some(password) = &self.password {
            queue.push_back(Method::Password {
                password: password.clone(),
            });
        }
        if let Some(key) = &self.key {
            queue.push_back(Method::PublicKey { key: key.clone() });
        }
        if self.agent.is_some() {
            queue.push_back(Method::Agent);
        }
        if self.try_keyboard {
            queue.push_back(Method::KeyboardInteractive {
                submethods: String::new(),
            });
        }
        if let (Some(key), Some(local_hostname), Some(local_username)) =
            (&self.key, &self.local_hostname, &self.local_username)
        {
            queue.push_back(Method::HostBased {
                key: key.clone(),
                local_hostname: local_hostname.clone(),
                local_username: local_username.clone(),
            });
        }
        queue
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("strict_vendor", &self.strict_vendor)
            .field("ready_timeout", &self.ready_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_count_max", &self.keepalive_count_max)
            .field("window_size", &self.window_size)
            .field("maximum_packet_size", &self.maximum_packet_size)
            .finish_non_exhaustive()
    }
}

/// Messages sent from handles and channels into the event loop.
#[derive(Debug)]
pub enum Msg {
    ChannelOpenSession {
        channel_ref: ChannelRef,
    },
    ChannelOpenDirectTcpIp {
        host_to_connect: String,
        port_to_connect: u32,
        originator_address: String,
        originator_port: u32,
        channel_ref: ChannelRef,
    },
    ChannelOpenDirectStreamLocal {
        socket_path: String,
        channel_ref: ChannelRef,
    },
    TcpIpForward {
        address: String,
        port: u32,
        reply_channel: oneshot::Sender<Option<u32>>,
    },
    CancelTcpIpForward {
        address: String,
        port: u32,
        reply_channel: oneshot::Sender<bool>,
    },
    StreamLocalForward {
        socket_path: String,
        reply_channel: oneshot::Sender<bool>,
    },
    CancelStreamLocalForward {
        socket_path: String,
        reply_channel: oneshot::Sender<bool>,
    },
    NoMoreSessions {
        reply_channel: oneshot::Sender<bool>,
    },
    Disconnect {
        reason: Disconnect,
        description: String,
    },
    Destroy,
    Channel(ChannelId, ChannelMsg),
}

impl From<(ChannelId, ChannelMsg)> for Msg {
    fn from((id, msg): (ChannelId, ChannelMsg)) -> Self {
        Msg::Channel(id, msg)
    }
}

/// Carried by the ready signal once `USERAUTH_SUCCESS` arrives.
pub(crate) struct Ready {
    pub remote_version: Option<String>,
}

/// Handle to a connection, used to open channels and send requests
/// outside of the event loop.
#[derive(Debug)]
pub struct Handle<H: Handler> {
    sender: Sender<Msg>,
    join: tokio::task::JoinHandle<Result<(), H::Error>>,
    remote_version: Option<String>,
    strict_vendor: bool,
    channel_buffer_size: usize,
    agent_present: bool,
    agent_forward: bool,
}

impl<H: Handler> Drop for Handle<H> {
    fn drop(&mut self) {
        debug!("drop handle")
    }
}

impl<H: Handler> Handle<H> {
    /// Whether the event loop is gone; every operation except
    /// [`end`](Handle::end)/[`destroy`](Handle::destroy) will fail once
    /// this is true.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// The server's identification string.
    pub fn remote_version(&self) -> Option<&str> {
        self.remote_version.as_deref()
    }

    /// `Err(VendorMismatch)` unless vendor extensions may be sent to this
    /// peer. Nothing goes on the wire for refused calls.
    fn check_vendor(&self) -> Result<(), Error> {
        if !self.strict_vendor {
            return Ok(());
        }
        match &self.remote_version {
            Some(version) if supports_openssh_extensions(version) => Ok(()),
            _ => Err(Error::VendorMismatch),
        }
    }

    async fn send_msg(&self, msg: Msg) -> Result<(), Error> {
        self.sender.send(msg).await.map_err(|_| Error::NotConnected)
    }

    /// Wait for confirmation that a channel is open
    async fn wait_channel_confirmation(
        &self,
        mut receiver: Receiver<ChannelMsg>,
        window_size: WindowSizeRef,
    ) -> Result<Channel<Msg>, Error> {
        loop {
            match receiver.recv().await {
                Some(ChannelMsg::Open {
                    id,
                    max_packet_size,
                    window_size: window,
                }) => {
                    window_size.update(window).await;
                    return Ok(Channel::from_parts(
                        id,
                        self.sender.clone(),
                        receiver,
                        max_packet_size,
                        window_size,
                    ));
                }
                Some(ChannelMsg::OpenFailure(reason)) => {
                    return Err(Error::ChannelOpenFailure(reason));
                }
                None => {
                    return Err(Error::NoResponse);
                }
                msg => {
                    debug!("msg = {:?}", msg);
                }
            }
        }
    }

    async fn open_channel(
        &self,
        make_msg: impl FnOnce(ChannelRef) -> Msg,
    ) -> Result<Channel<Msg>, Error> {
        let (sender, receiver) = channel(self.channel_buffer_size);
        let window_size = WindowSizeRef::new(0);
        self.send_msg(make_msg(ChannelRef::new(sender, window_size.clone())))
            .await?;
        self.wait_channel_confirmation(receiver, window_size).await
    }

    /// Request a session channel (the most basic type of channel). The
    /// returned channel is confirmed but bare: no requests have been sent
    /// on it yet.
    pub async fn channel_open_session(&self) -> Result<Channel<Msg>, Error> {
        self.open_channel(|channel_ref| Msg::ChannelOpenSession { channel_ref })
            .await
    }

    /// Open a TCP/IP forwarding channel towards `host_to_connect`. This
    /// is usually done when a connection comes in on a locally forwarded
    /// port. See [RFC4254](https://tools.ietf.org/html/rfc4254#section-7).
    pub async fn channel_open_direct_tcpip<A: Into<String>, B: Into<String>>(
        &self,
        host_to_connect: A,
        port_to_connect: u32,
        originator_address: B,
        originator_port: u32,
    ) -> Result<Channel<Msg>, Error> {
        let host_to_connect = host_to_connect.into();
        let originator_address = originator_address.into();
        self.open_channel(|channel_ref| Msg::ChannelOpenDirectTcpIp {
            host_to_connect,
            port_to_connect,
            originator_address,
            originator_port,
            channel_ref,
        })
        .await
    }

    /// Open a channel to a Unix-domain socket on the server
    /// (`direct-streamlocal@openssh.com`, hence vendor-gated).
    pub async fn channel_open_direct_streamlocal<S: Into<String>>(
        &self,
        socket_path: S,
    ) -> Result<Channel<Msg>, Error> {
        self.check_vendor()?;
        let socket_path = socket_path.into();
        self.open_channel(|channel_ref| Msg::ChannelOpenDirectStreamLocal {
            socket_path,
            channel_ref,
        })
        .await
    }

    /// Wait for the next reply to a channel request. Anything else
    /// arriving first is dropped; nothing but a reply may legally precede
    /// it on a channel that has no request outstanding besides ours.
    async fn expect_reply(&self, channel: &mut Channel<Msg>, what: &str) -> Result<(), Error> {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => return Err(Error::RequestDenied),
                None => return Err(Error::NoResponse),
                Some(msg) => debug!("{}: ignoring {:?} while waiting for reply", what, msg),
            }
        }
    }

    /// The chain of prerequisite requests every session runs before its
    /// terminal request: agent forwarding, env (no reply expected), pty,
    /// X11. Each step blocks on its reply; a refused step closes the
    /// channel.
    #[allow(clippy::too_many_arguments)]
    async fn prepare_session(
        &self,
        channel: &mut Channel<Msg>,
        agent_forward: bool,
        env: &[(String, String)],
        pty: Option<&PtyOptions>,
        x11: Option<&X11Options>,
    ) -> Result<(), Error> {
        if (agent_forward || self.agent_forward) && self.agent_present {
            channel.agent_forward(true).await?;
            self.expect_reply(channel, "auth-agent-req").await?;
        }
        for (name, value) in env {
            channel.set_env(name.clone(), value.clone()).await?;
        }
        if let Some(pty) = pty {
            channel
                .request_pty(
                    true,
                    &pty.term,
                    pty.col_width,
                    pty.row_height,
                    pty.pix_width,
                    pty.pix_height,
                    &pty.terminal_modes,
                )
                .await?;
            self.expect_reply(channel, "pty-req").await?;
        }
        if let Some(x11) = x11 {
            channel
                .request_x11(
                    true,
                    x11.single_connection,
                    x11.x11_authentication_protocol.clone(),
                    x11.x11_authentication_cookie.clone(),
                    x11.x11_screen_number,
                )
                .await?;
            self.expect_reply(channel, "x11-req").await?;
        }
        Ok(())
    }

    /// Execute a remote command. The channel carries its output (stderr
    /// on the extended stream) and eventually an exit message.
    pub async fn exec(
        &self,
        command: impl Into<Vec<u8>>,
        options: ExecOptions,
    ) -> Result<Channel<Msg>, Error> {
        let mut channel = self.channel_open_session().await?;
        let result = async {
            self.prepare_session(
                &mut channel,
                options.agent_forward,
                &options.env,
                options.pty.as_ref(),
                options.x11.as_ref(),
            )
            .await?;
            channel.exec(true, command).await?;
            self.expect_reply(&mut channel, "exec").await
        }
        .await;
        match result {
            Ok(()) => Ok(channel),
            Err(e) => {
                let _ = channel.close().await;
                Err(e)
            }
        }
    }

    /// Start a remote shell.
    pub async fn shell(&self, options: ShellOptions) -> Result<Channel<Msg>, Error> {
        let mut channel = self.channel_open_session().await?;
        let result = async {
            self.prepare_session(
                &mut channel,
                options.agent_forward,
                &options.env,
                options.pty.as_ref(),
                options.x11.as_ref(),
            )
            .await?;
            channel.request_shell(true).await?;
            self.expect_reply(&mut channel, "shell").await
        }
        .await;
        match result {
            Ok(()) => Ok(channel),
            Err(e) => {
                let _ = channel.close().await;
                Err(e)
            }
        }
    }

    /// Start a named subsystem on a fresh session channel.
    pub async fn subsystem(
        &self,
        name: impl Into<String>,
        options: ExecOptions,
    ) -> Result<Channel<Msg>, Error> {
        let mut channel = self.channel_open_session().await?;
        let result = async {
            self.prepare_session(
                &mut channel,
                options.agent_forward,
                &options.env,
                options.pty.as_ref(),
                options.x11.as_ref(),
            )
            .await?;
            channel.request_subsystem(true, name).await?;
            self.expect_reply(&mut channel, "subsystem").await
        }
        .await;
        match result {
            Ok(()) => Ok(channel),
            Err(e) => {
                let _ = channel.close().await;
                Err(e)
            }
        }
    }

    /// Start the SFTP subsystem and return the byte stream an SFTP
    /// protocol client runs on.
    pub async fn sftp(&self) -> Result<ChannelStream<Msg>, Error> {
        let channel = self.subsystem("sftp", ExecOptions::default()).await?;
        Ok(channel.into_stream())
    }

    /// Bind a remote forwarding address. With `port` 0 the server picks,
    /// and the returned port is the one it assigned. Incoming connections
    /// surface through
    /// [`Handler::server_channel_open_forwarded_tcpip`].
    pub async fn tcpip_forward(&self, address: impl Into<String>, port: u32) -> Result<u32, Error> {
        let (reply_send, reply_recv) = oneshot::channel();
        self.send_msg(Msg::TcpIpForward {
            address: address.into(),
            port,
            reply_channel: reply_send,
        })
        .await?;
        match reply_recv.await {
            Ok(Some(port)) => Ok(port),
            Ok(None) => Err(Error::RequestDenied),
            Err(_) => Err(Error::NoResponse),
        }
    }

    /// Unbind a remote forwarding address bound with
    /// [`tcpip_forward`](Handle::tcpip_forward).
    pub async fn cancel_tcpip_forward(
        &self,
        address: impl Into<String>,
        port: u32,
    ) -> Result<(), Error> {
        let (reply_send, reply_recv) = oneshot::channel();
        self.send_msg(Msg::CancelTcpIpForward {
            address: address.into(),
            port,
            reply_channel: reply_send,
        })
        .await?;
        match reply_recv.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::RequestDenied),
            Err(_) => Err(Error::NoResponse),
        }
    }

    /// Bind a Unix-domain socket path on the server
    /// (`streamlocal-forward@openssh.com`, vendor-gated). Incoming
    /// connections surface through
    /// [`Handler::server_channel_open_forwarded_streamlocal`].
    pub async fn streamlocal_forward(&self, socket_path: impl Into<String>) -> Result<(), Error> {
        self.check_vendor()?;
        let (reply_send, reply_recv) = oneshot::channel();
        self.send_msg(Msg::StreamLocalForward {
            socket_path: socket_path.into(),
            reply_channel: reply_send,
        })
        .await?;
        match reply_recv.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::RequestDenied),
            Err(_) => Err(Error::NoResponse),
        }
    }

    /// Unbind a Unix-domain socket path (vendor-gated).
    pub async fn cancel_streamlocal_forward(
        &self,
        socket_path: impl Into<String>,
    ) -> Result<(), Error> {
        self.check_vendor()?;
        let (reply_send, reply_recv) = oneshot::channel();
        self.send_msg(Msg::CancelStreamLocalForward {
            socket_path: socket_path.into(),
            reply_channel: reply_send,
        })
        .await?;
        match reply_recv.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::RequestDenied),
            Err(_) => Err(Error::NoResponse),
        }
    }

    /// Tell the server to refuse further session channels
    /// (`no-more-sessions@openssh.com`, vendor-gated).
    pub async fn no_more_sessions(&self) -> Result<(), Error> {
        self.check_vendor()?;
        let (reply_send, reply_recv) = oneshot::channel();
        self.send_msg(Msg::NoMoreSessions {
            reply_channel: reply_send,
        })
        .await?;
        match reply_recv.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::RequestDenied),
            Err(_) => Err(Error::NoResponse),
        }
    }

    /// Send data to the channel referenced by id.
    ///
    /// This is useful for server-initiated channels; for channels created
    /// by this side, prefer the [`Channel`] returned from the `open_*`
    /// methods.
    pub async fn data(&self, id: ChannelId, data: Vec<u8>) -> Result<(), Error> {
        self.send_msg(Msg::Channel(id, ChannelMsg::Data { data }))
            .await
    }

    /// Sends a disconnect message.
    pub async fn disconnect(
        &self,
        reason: Disconnect,
        description: impl Into<String>,
    ) -> Result<(), Error> {
        self.send_msg(Msg::Disconnect {
            reason,
            description: description.into(),
        })
        .await
    }

    /// Graceful close: send a `BY_APPLICATION` disconnect, then half-close
    /// the stream. Idempotent; calling it on a dead connection is fine.
    pub async fn end(&self) {
        let _ = self
            .sender
            .send(Msg::Disconnect {
                reason: Disconnect::ByApplication,
                description: String::new(),
            })
            .await;
    }

    /// Hard close: tear the connection down without telling the server.
    /// Pending callers get "No response from server".
    pub async fn destroy(&self) {
        let _ = self.sender.send(Msg::Destroy).await;
    }
}

impl<H: Handler> Future for Handle<H> {
    type Output = Result<(), H::Error>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match Future::poll(Pin::new(&mut self.join), cx) {
            Poll::Ready(r) => Poll::Ready(match r {
                Ok(Ok(x)) => Ok(x),
                Err(e) => Err(crate::Error::from(e).into()),
                Ok(Err(e)) => Err(e),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

async fn dial(config: &Config) -> Result<TcpStream, Error> {
    let authority = format!("{}:{}", config.host, config.port);
    let force_v4 = config.force_ipv4 && !config.force_ipv6;
    let force_v6 = config.force_ipv6 && !config.force_ipv4;

    let target: Option<SocketAddr> = if force_v4 || force_v6 {
        let addr = lookup_host(authority.as_str())
            .await?
            .find(|a| if force_v4 { a.is_ipv4() } else { a.is_ipv6() });
        match addr {
            Some(addr) => Some(addr),
            None => return Err(Error::Dns(config.host.clone())),
        }
    } else {
        None
    };

    let stream = match (&config.bind, target) {
        (None, None) => TcpStream::connect(authority.as_str()).await?,
        (None, Some(addr)) => TcpStream::connect(addr).await?,
        (Some((bind_addr, bind_port)), target) => {
            let addr = match target {
                Some(addr) => addr,
                None => lookup_host(authority.as_str())
                    .await?
                    .next()
                    .ok_or_else(|| Error::Dns(config.host.clone()))?,
            };
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            let local: SocketAddr = format!("{}:{}", bind_addr, bind_port)
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("invalid bind address {bind_addr}")))?;
            socket.bind(local)?;
            socket.connect(addr).await?
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Dial the configured server, run the connection and authenticate.
/// Resolves to a [`Handle`] once the server accepts one of the configured
/// methods; the ready timeout, a handshake failure or exhausted methods
/// resolve to the corresponding error instead.
pub async fn connect<H, T>(config: Config, transport: T, handler: H) -> Result<Handle<H>, H::Error>
where
    H: Handler + Send + 'static,
    T: Transport + 'static,
{
    config.validate().map_err(H::Error::from)?;
    let stream = dial(&config).await.map_err(H::Error::from)?;
    connect_stream(config, stream, transport, handler).await
}

/// Like [`connect`], but on a pre-established stream (a proxied
/// connection, a Unix socket, a test harness). No dialing happens;
/// `bind`/family forcing in the config are ignored.
pub async fn connect_stream<H, T, R>(
    config: Config,
    stream: R,
    mut transport: T,
    handler: H,
) -> Result<Handle<H>, H::Error>
where
    H: Handler + Send + 'static,
    T: Transport + 'static,
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    config.validate().map_err(H::Error::from)?;
    transport.configure(&config.client_id, &config.preferred);
    if config.maximum_packet_size > 65535 {
        error!(
            "Maximum packet size ({:?}) should not be larger than a TCP packet (65535)",
            config.maximum_packet_size
        );
    }

    let strict_vendor = config.strict_vendor;
    let channel_buffer_size = config.channel_buffer_size;
    let agent_present = config.agent.is_some();
    let agent_forward = config.agent_forward;
    let ready_timeout = config.ready_timeout;

    let (handle_sender, session_receiver) = channel(10);
    let (ready_signal, ready_recv) = oneshot::channel();
    let session = Session::new(config, transport, session_receiver, ready_signal);
    let join = tokio::spawn(session.run(stream, handler));

    let ready = match ready_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, ready_recv).await {
            Ok(r) => r,
            Err(_) => {
                // The ready timeout destroys the connection.
                join.abort();
                return Err(H::Error::from(Error::ConnectionTimeout));
            }
        },
        None => ready_recv.await,
    };

    match ready {
        Ok(ready) => Ok(Handle {
            sender: handle_sender,
            join,
            remote_version: ready.remote_version,
            strict_vendor,
            channel_buffer_size,
            agent_present,
            agent_forward,
        }),
        Err(_) => {
            // The loop ended before authentication completed; surface why.
            match join.await {
                Ok(Ok(())) => Err(H::Error::from(Error::ConnectionLost)),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(H::Error::from(Error::from(e))),
            }
        }
    }
}

/// Actual client connection state.
///
/// It is in charge of multiplexing and keeping track of various channels
/// that may get opened and closed during the lifetime of a connection,
/// and of sequencing authentication before any of that.
pub(crate) struct Session<T: Transport> {
    pub(crate) config: Config,
    pub(crate) transport: T,
    pub(crate) agent: Option<Box<dyn Agent>>,
    pub(crate) auth: AuthFlow,
    pub(crate) channels: ChannelTable,
    pub(crate) forwardings: Forwardings,
    pub(crate) open_global_requests: VecDeque<GlobalReply>,
    receiver: Receiver<Msg>,
    pub(crate) inbound_channel_sender: Sender<Msg>,
    inbound_channel_receiver: Receiver<Msg>,
    pub(crate) ready_signal: Option<oneshot::Sender<Ready>>,
    pub(crate) remote_version: Option<String>,
    alive_timeouts: usize,
    pub(crate) reply_seen: bool,
    pub(crate) disconnected: bool,
    destroyed: bool,
    out_buf: Vec<u8>,
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        debug!("drop session")
    }
}

impl<T: Transport> Session<T> {
    fn new(
        mut config: Config,
        transport: T,
        receiver: Receiver<Msg>,
        ready_signal: oneshot::Sender<Ready>,
    ) -> Self {
        let auth_handler: Box<dyn AuthHandler> = match config.auth_handler.take() {
            Some(handler) => handler,
            None => Box::new(ConfiguredMethods::new(config.eligible_methods())),
        };
        let auth = AuthFlow::new(config.username.clone(), auth_handler);
        let agent = config.agent.take();
        let (inbound_channel_sender, inbound_channel_receiver) = channel(10);
        Session {
            config,
            transport,
            agent,
            auth,
            channels: ChannelTable::default(),
            forwardings: Forwardings::default(),
            open_global_requests: VecDeque::new(),
            receiver,
            inbound_channel_sender,
            inbound_channel_receiver,
            ready_signal: Some(ready_signal),
            remote_version: None,
            alive_timeouts: 0,
            reply_seen: false,
            disconnected: false,
            destroyed: false,
            out_buf: Vec::new(),
        }
    }

    async fn run<H, R>(mut self, stream: R, mut handler: H) -> Result<(), H::Error>
    where
        H: Handler + Send,
        R: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (stream_read, mut stream_write) = tokio::io::split(stream);
        let result = self
            .run_loop(stream_read, &mut stream_write, &mut handler)
            .await;
        // Best effort: put any final disconnect on the wire, then tell
        // every pending continuation that no reply is coming.
        if !self.destroyed {
            let _ = self.flush_writes(&mut stream_write).await;
            let _ = stream_write.shutdown().await;
        }
        self.teardown();
        debug!("disconnected");
        result
    }

    async fn run_loop<H, R, W>(
        &mut self,
        mut stream_read: R,
        stream_write: &mut W,
        handler: &mut H,
    ) -> Result<(), H::Error>
    where
        H: Handler + Send,
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut read_buf = vec![0u8; READ_BUFFER_SIZE];
        let mut events: Vec<TransportEvent> = Vec::new();

        let keepalive_timer =
            future_or_pending(self.config.keepalive_interval, tokio::time::sleep);
        pin!(keepalive_timer);

        while !self.disconnected {
            self.reply_seen = false;
            let mut sent_keepalive = false;
            tokio::select! {
                r = stream_read.read(&mut read_buf) => {
                    match r {
                        Ok(0) => break,
                        Ok(n) => {
                            self.transport
                                .feed(read_buf.get(..n).unwrap_or_default(), &mut events)
                                .map_err(Error::from)?;
                            for event in events.drain(..) {
                                self.handle_event(handler, event).await?;
                                if self.disconnected {
                                    break;
                                }
                            }
                        }
                        Err(e) => return Err(Error::from(e).into()),
                    }
                }
                msg = self.receiver.recv() => {
                    match msg {
                        Some(msg) => self.handle_msg(msg)?,
                        None => {
                            self.disconnected = true;
                        }
                    }
                    // eagerly take all outgoing messages so writes are batched
                    while !self.disconnected {
                        match self.receiver.try_recv() {
                            Ok(next) => self.handle_msg(next)?,
                            Err(_) => break,
                        }
                    }
                }
                msg = self.inbound_channel_receiver.recv() => {
                    if let Some(msg) = msg {
                        self.handle_msg(msg)?;
                    }
                    while !self.disconnected {
                        match self.inbound_channel_receiver.try_recv() {
                            Ok(next) => self.handle_msg(next)?,
                            Err(_) => break,
                        }
                    }
                }
                () = &mut keepalive_timer => {
                    self.alive_timeouts = self.alive_timeouts.saturating_add(1);
                    if self.alive_timeouts > self.config.keepalive_count_max {
                        debug!("Timeout, server not responding to keepalives");
                        return Err(Error::KeepaliveTimeout.into());
                    }
                    sent_keepalive = true;
                    self.send_keepalive()?;
                }
            }
            if !self.destroyed {
                self.flush_writes(stream_write).await?;
            }
            if self.reply_seen {
                self.alive_timeouts = 0;
            }
            if self.reply_seen || sent_keepalive {
                if let (futures::future::Either::Right(ref mut sleep), Some(d)) = (
                    keepalive_timer.as_mut().as_pin_mut(),
                    self.config.keepalive_interval,
                ) {
                    sleep.as_mut().reset(tokio::time::Instant::now() + d);
                }
            }
        }
        Ok(())
    }

    async fn flush_writes<W: AsyncWrite + Unpin>(&mut self, w: &mut W) -> Result<(), Error> {
        self.out_buf.clear();
        self.transport.flush(&mut self.out_buf)?;
        if !self.out_buf.is_empty() {
            trace!("writing to stream: {:?} bytes", self.out_buf.len());
            w.write_all(&self.out_buf).await?;
            w.flush().await?;
        }
        Ok(())
    }

    fn handle_msg(&mut self, msg: Msg) -> Result<(), Error> {
        match msg {
            Msg::ChannelOpenSession { channel_ref } => self.channel_open_session(channel_ref),
            Msg::ChannelOpenDirectTcpIp {
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
                channel_ref,
            } => self.channel_open_direct_tcpip(
                &host_to_connect,
                port_to_connect,
                &originator_address,
                originator_port,
                channel_ref,
            ),
            Msg::ChannelOpenDirectStreamLocal {
                socket_path,
                channel_ref,
            } => self.channel_open_direct_streamlocal(&socket_path, channel_ref),
            Msg::TcpIpForward {
                address,
                port,
                reply_channel,
            } => self.tcpip_forward(&address, port, reply_channel),
            Msg::CancelTcpIpForward {
                address,
                port,
                reply_channel,
            } => self.cancel_tcpip_forward(&address, port, reply_channel),
            Msg::StreamLocalForward {
                socket_path,
                reply_channel,
            } => self.streamlocal_forward(&socket_path, reply_channel),
            Msg::CancelStreamLocalForward {
                socket_path,
                reply_channel,
            } => self.cancel_streamlocal_forward(&socket_path, reply_channel),
            Msg::NoMoreSessions { reply_channel } => self.no_more_sessions(reply_channel),
            Msg::Disconnect {
                reason,
                description,
            } => self.disconnect(reason, &description),
            Msg::Destroy => {
                self.disconnected = true;
                self.destroyed = true;
                Ok(())
            }
            Msg::Channel(id, ChannelMsg::Data { data }) => self.data(id, data),
            Msg::Channel(id, ChannelMsg::ExtendedData { data, ext }) => {
                self.extended_data(id, ext, data)
            }
            Msg::Channel(id, ChannelMsg::Eof) => self.eof(id),
            Msg::Channel(id, ChannelMsg::Close) => self.close(id),
            Msg::Channel(
                id,
                ChannelMsg::RequestPty {
                    want_reply,
                    term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    terminal_modes,
                },
            ) => self.request_pty(
                id,
                want_reply,
                &term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                &terminal_modes,
            ),
            Msg::Channel(
                id,
                ChannelMsg::RequestX11 {
                    want_reply,
                    single_connection,
                    x11_authentication_protocol,
                    x11_authentication_cookie,
                    x11_screen_number,
                },
            ) => self.request_x11(
                id,
                want_reply,
                single_connection,
                &x11_authentication_protocol,
                &x11_authentication_cookie,
                x11_screen_number,
            ),
            Msg::Channel(
                id,
                ChannelMsg::SetEnv {
                    variable_name,
                    variable_value,
                },
            ) => self.set_env(id, &variable_name, &variable_value),
            Msg::Channel(id, ChannelMsg::RequestShell { want_reply }) => {
                self.request_shell(id, want_reply)
            }
            Msg::Channel(
                id,
                ChannelMsg::Exec {
                    want_reply,
                    command,
                },
            ) => self.exec(id, want_reply, command),
            Msg::Channel(id, ChannelMsg::Signal { signal }) => self.signal(id, signal),
            Msg::Channel(id, ChannelMsg::RequestSubsystem { want_reply, name }) => {
                self.request_subsystem(id, want_reply, &name)
            }
            Msg::Channel(id, ChannelMsg::AgentForward { want_reply }) => {
                self.agent_forward(id, want_reply)
            }
            Msg::Channel(
                id,
                ChannelMsg::WindowChange {
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                },
            ) => self.window_change(id, col_width, row_height, pix_width, pix_height),
            msg => {
                // should be unreachable, since the receiver only gets
                // messages from methods implemented within this crate
                warn!("unexpected loop message: {:?}", msg);
                Ok(())
            }
        }
    }

    /// Tell every pending continuation that the connection is gone.
    /// Dropping a reply sender resolves its waiter with "No response from
    /// server"; dropping a channel ref ends the channel's message stream.
    fn teardown(&mut self) {
        self.transport.cleanup();
        for request in self.open_global_requests.drain(..) {
            match request {
                GlobalReply::Keepalive => {}
                GlobalReply::TcpIpForward { reply, .. } => drop(reply),
                GlobalReply::CancelTcpIpForward { reply, .. } => drop(reply),
                GlobalReply::StreamLocalForward { reply, .. } => drop(reply),
                GlobalReply::CancelStreamLocalForward { reply, .. } => drop(reply),
                GlobalReply::NoMoreSessions { reply } => drop(reply),
            }
        }
        for slot in self.channels.drain() {
            match slot {
                ChannelSlot::PendingOpen(channel_ref) => drop(channel_ref),
                ChannelSlot::Live { channel_ref, .. } => {
                    let _ = channel_ref.sender.try_send(ChannelMsg::Close);
                }
            }
        }
        self.ready_signal.take();
    }
}

/// A client handler. Note that messages can be received from the
/// server at any time during a session.
///
/// Note: this is an `async_trait`. Click `[source]` on the right to see
/// actual async function definitions.
#[async_trait]
pub trait Handler: Sized + Send {
    type Error: From<crate::Error> + Send + 'static;

    /// Free text the server sent before its identification string.
    #[allow(unused_variables)]
    async fn greeting(&mut self, text: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the transport finished key exchange, with the
    /// negotiated algorithm names.
    #[allow(unused_variables)]
    async fn handshake(&mut self, summary: &HandshakeSummary) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server sends us an authentication banner. This
    /// is usually meant to be shown to the user, see
    /// [RFC4252](https://tools.ietf.org/html/rfc4252#section-5.4) for
    /// more details.
    #[allow(unused_variables)]
    async fn auth_banner(&mut self, banner: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    /// The server demands a new password mid-authentication. Returning
    /// `None` abandons the password method and moves on.
    #[allow(unused_variables)]
    async fn change_password(&mut self, prompt: &str) -> Result<Option<String>, Self::Error> {
        Ok(None)
    }

    /// Answer one round of keyboard-interactive prompts. The reply must
    /// have one answer per prompt; the default answers nothing, which
    /// servers treat as a failed attempt.
    #[allow(unused_variables)]
    async fn keyboard_interactive(
        &mut self,
        name: &str,
        instructions: &str,
        prompts: &[Prompt],
    ) -> Result<Vec<String>, Self::Error> {
        Ok(Vec::new())
    }

    /// A non-fatal agent problem during authentication; the orchestrator
    /// has already moved on to the next key or method.
    #[allow(unused_variables)]
    async fn auth_agent_failure(
        &mut self,
        error: &crate::agent::AgentError,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server opens a channel for a remote port
    /// forwarding bound earlier with [`Handle::tcpip_forward`]. Dropping
    /// the channel closes it.
    #[allow(unused_variables)]
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server opens a channel for a Unix-domain socket
    /// bound earlier with [`Handle::streamlocal_forward`].
    #[allow(unused_variables)]
    async fn server_channel_open_forwarded_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server opens an X11 channel towards a display a
    /// session channel asked to forward.
    #[allow(unused_variables)]
    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called when the server opens an agent forwarding channel. The
    /// channel itself is already being served by [`crate::agent::Agent::bridge`];
    /// this is a notification.
    #[allow(unused_variables)]
    async fn server_channel_open_agent_forward(
        &mut self,
        id: ChannelId,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// A `DEBUG` message from the peer.
    #[allow(unused_variables)]
    async fn debug(&mut self, always_display: bool, message: &str) -> Result<(), Self::Error> {
        Ok(())
    }
}
