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

//! Inbound event dispatch: authentication orchestration, channel events,
//! global replies, and the policy router deciding which server-initiated
//! channels to accept.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, info, trace, warn};

use crate::auth::{AuthState, Method};
use crate::channels::{Channel, ChannelMsg, ChannelRef, WindowSizeRef};
use crate::key::{is_supported_algorithm, strip_signature_frame};
use crate::msg;
use crate::session::{ChannelParams, ChannelSlot, GlobalReply, PendingRequest, StreamState};
use crate::transport::{
    ChannelOpenKind, ChannelOpenRequest, ChannelRequest, CompatFlags, Packet, SignatureDomain,
    Transport, TransportEvent,
};
use crate::{ChannelId, ChannelOpenFailure, Disconnect, Error, STDERR};

use super::{Handler, Msg, Ready, Session};

impl<T: Transport> Session<T> {
    pub(super) async fn handle_event<H: Handler>(
        &mut self,
        handler: &mut H,
        event: TransportEvent,
    ) -> Result<(), H::Error> {
        trace!("event: {:?}", event);
        match event {
            TransportEvent::Version { ident } => {
                debug!("remote version: {}", ident);
                self.remote_version = Some(ident);
                Ok(())
            }
            TransportEvent::Greeting { text } => handler.greeting(&text).await,
            TransportEvent::HandshakeComplete { summary } => {
                handler.handshake(&summary).await?;
                self.transport
                    .send(Packet::ServiceRequest {
                        name: "ssh-userauth".to_string(),
                    })
                    .map_err(Error::from)?;
                Ok(())
            }
            TransportEvent::ServiceAccept { name } => {
                if name == "ssh-userauth" {
                    self.try_next_auth(handler).await
                } else {
                    debug!("service accept for {:?}", name);
                    Ok(())
                }
            }
            TransportEvent::AuthSuccess => {
                debug!("userauth_success");
                self.reply_seen = true;
                self.auth.state = AuthState::Authenticated;
                // Resolving the ready signal cancels the ready timeout.
                if let Some(ready) = self.ready_signal.take() {
                    let _ = ready.send(Ready {
                        remote_version: self
                            .remote_version
                            .clone()
                            .or_else(|| self.transport.remote_version().map(str::to_string)),
                    });
                }
                Ok(())
            }
            TransportEvent::AuthFailure {
                methods_left,
                partial_success,
            } => {
                debug!(
                    "userauth_failure after {}; remaining methods {:?}",
                    self.auth.state.method_name(),
                    methods_left
                );
                self.reply_seen = true;
                if let AuthState::AgentTrying { keys, index } = &mut self.auth.state {
                    *index += 1;
                    if *index < keys.len() {
                        return self.probe_agent_key(None).map_err(Error::into);
                    }
                }
                self.auth.record_failure(methods_left, partial_success);
                self.try_next_auth(handler).await
            }
            TransportEvent::AuthBanner { message } => handler.auth_banner(&message).await,
            TransportEvent::AuthPkOk { algorithm, blob } => {
                self.on_auth_pk_ok(handler, algorithm, blob).await
            }
            TransportEvent::AuthInfoRequest {
                name,
                instructions,
                prompts,
            } => {
                // Empty prompt lists are answered without involving the user.
                let responses = if prompts.is_empty() {
                    Vec::new()
                } else {
                    handler
                        .keyboard_interactive(&name, &instructions, &prompts)
                        .await?
                };
                self.transport
                    .send(Packet::AuthInfoResponse { responses })
                    .map_err(Error::from)?;
                Ok(())
            }
            TransportEvent::AuthPasswordChangeRequired { prompt } => {
                self.on_password_change(handler, prompt).await
            }
            TransportEvent::GlobalRequest {
                name, want_reply, ..
            } => {
                if name.starts_with("keepalive") {
                    if want_reply {
                        self.transport
                            .send(Packet::RequestSuccess)
                            .map_err(Error::from)?;
                    } else {
                        warn!("Received keepalive without reply request!");
                    }
                } else if name == "hostkeys-00@openssh.com" {
                    debug!("ignoring host key announcement");
                } else {
                    info!("Unhandled global request: {:?} {:?}", name, want_reply);
                    if want_reply {
                        self.transport
                            .send(Packet::RequestFailure)
                            .map_err(Error::from)?;
                    }
                }
                Ok(())
            }
            TransportEvent::RequestSuccess { data } => {
                self.on_request_success(&data).map_err(Error::into)
            }
            TransportEvent::RequestFailure => self.on_request_failure().map_err(Error::into),
            TransportEvent::ChannelOpen(open) => self.on_channel_open(handler, open).await,
            TransportEvent::ChannelOpenConfirmation {
                recipient,
                sender,
                window_size,
                maximum_packet_size,
            } => self
                .on_channel_open_confirmation(recipient, sender, window_size, maximum_packet_size)
                .await
                .map_err(Error::into),
            TransportEvent::ChannelOpenFailure {
                recipient,
                reason,
                description,
            } => {
                debug!("channel_open_failure: {:?} {:?}", reason, description);
                if let Some(ChannelSlot::PendingOpen(channel_ref)) = self.channels.remove(recipient)
                {
                    let _ = channel_ref
                        .sender
                        .send(ChannelMsg::OpenFailure(reason))
                        .await;
                }
                Ok(())
            }
            TransportEvent::ChannelWindowAdjust { recipient, amount } => self
                .on_window_adjust(recipient, amount)
                .await
                .map_err(Error::into),
            TransportEvent::ChannelData { recipient, data } => self
                .on_channel_data(recipient, None, data)
                .await
                .map_err(Error::into),
            TransportEvent::ChannelExtendedData {
                recipient,
                ext,
                data,
            } => self
                .on_channel_data(recipient, Some(ext), data)
                .await
                .map_err(Error::into),
            TransportEvent::ChannelEof { recipient } => {
                self.on_channel_eof(recipient).await.map_err(Error::into)
            }
            TransportEvent::ChannelClose { recipient } => {
                self.on_channel_close(recipient).await.map_err(Error::into)
            }
            TransportEvent::ChannelRequest { recipient, request } => self
                .on_channel_request(recipient, request)
                .await
                .map_err(Error::into),
            TransportEvent::ChannelSuccess { recipient } => self
                .on_channel_reply(recipient, true)
                .await
                .map_err(Error::into),
            TransportEvent::ChannelFailure { recipient } => self
                .on_channel_reply(recipient, false)
                .await
                .map_err(Error::into),
            TransportEvent::Debug {
                always_display,
                message,
            } => handler.debug(always_display, &message).await,
            TransportEvent::Disconnect {
                reason,
                description,
            } => {
                self.disconnected = true;
                if reason == Disconnect::ByApplication as u32 {
                    debug!("server disconnected by application");
                    Ok(())
                } else {
                    let message = if !description.is_empty() {
                        description
                    } else {
                        msg::disconnect_description(reason)
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("Unexpected disconnection reason: {reason}"))
                    };
                    Err(Error::Disconnected { reason, message }.into())
                }
            }
        }
    }

    /// Ask the strategy for the next method and put its first request on
    /// the wire. Methods that fail locally (no agent keys, signing
    /// errors) are skipped here without a server round-trip.
    pub(super) async fn try_next_auth<H: Handler>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), H::Error> {
        loop {
            let method = self
                .auth
                .handler
                .next_method(self.auth.methods_left.as_ref(), self.auth.partial_success)
                .await;
            let Some(method) = method else {
                error!("no more authentication methods to try");
                return Err(Error::AllAuthMethodsFailed.into());
            };
            debug!("trying auth method {:?}", method);
            let user = self.auth.user.clone();
            match method {
                Method::None => {
                    self.transport
                        .send(Packet::AuthNone { user })
                        .map_err(Error::from)?;
                    self.auth.state = AuthState::Probing(Method::None);
                    return Ok(());
                }
                Method::Password { password } => {
                    self.transport
                        .send(Packet::AuthPassword {
                            user,
                            password: password.clone(),
                            new_password: None,
                        })
                        .map_err(Error::from)?;
                    self.auth.state = AuthState::Probing(Method::Password { password });
                    return Ok(());
                }
                Method::KeyboardInteractive { submethods } => {
                    self.transport
                        .send(Packet::AuthKeyboardInteractive {
                            user,
                            submethods: submethods.clone(),
                        })
                        .map_err(Error::from)?;
                    self.auth.state = AuthState::Probing(Method::KeyboardInteractive { submethods });
                    return Ok(());
                }
                Method::PublicKey { key } => {
                    let public = key.public();
                    self.transport
                        .send(Packet::AuthPublicKey {
                            user,
                            key: public,
                            signature: None,
                        })
                        .map_err(Error::from)?;
                    self.auth.state = AuthState::AwaitingPkOk { key };
                    return Ok(());
                }
                Method::HostBased {
                    key,
                    local_hostname,
                    local_username,
                } => {
                    let public = key.public();
                    let data = self
                        .transport
                        .auth_sign_data(
                            &user,
                            &public,
                            SignatureDomain::HostBased {
                                local_hostname: &local_hostname,
                                local_username: &local_username,
                            },
                        )
                        .map_err(Error::from)?;
                    match key.sign(&data).await {
                        Ok(signature) => {
                            self.transport
                                .send(Packet::AuthHostBased {
                                    user,
                                    key: public,
                                    local_hostname: local_hostname.clone(),
                                    local_username: local_username.clone(),
                                    signature,
                                })
                                .map_err(Error::from)?;
                            self.auth.state = AuthState::Probing(Method::HostBased {
                                key,
                                local_hostname,
                                local_username,
                            });
                            return Ok(());
                        }
                        Err(e) => {
                            error!("hostbased signing failed: {}", e);
                            continue;
                        }
                    }
                }
                Method::Agent => {
                    let Some(agent) = self.agent.as_mut() else {
                        debug!("agent method configured but no agent available");
                        continue;
                    };
                    match agent.request_identities().await {
                        Ok(keys) if !keys.is_empty() => {
                            self.auth.state = AuthState::AgentTrying { keys, index: 0 };
                            self.probe_agent_key(None).map_err(Error::from)?;
                            return Ok(());
                        }
                        Ok(_) => {
                            debug!("agent holds no keys");
                            continue;
                        }
                        Err(e) => {
                            warn!("agent identity listing failed: {}", e);
                            handler.auth_agent_failure(&e).await?;
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Send the public-key probe for the agent key at the current
    /// position (or at `skip_to` after an advance).
    fn probe_agent_key(&mut self, skip_to: Option<usize>) -> Result<(), Error> {
        let user = self.auth.user.clone();
        let AuthState::AgentTrying { keys, index } = &mut self.auth.state else {
            return Ok(());
        };
        if let Some(skip_to) = skip_to {
            *index = skip_to;
        }
        let Some(key) = keys.get(*index) else {
            return Ok(());
        };
        debug!("offering agent key {} ({})", index, key.algorithm);
        let key = key.clone();
        self.transport
            .send(Packet::AuthPublicKey {
                user,
                key,
                signature: None,
            })
            .map_err(Error::from)
    }

    /// The agent key at the current position is unusable; move to the
    /// next one, or fall back to the next method when exhausted.
    async fn advance_agent_key<H: Handler>(&mut self, handler: &mut H) -> Result<(), H::Error> {
        let next = match &mut self.auth.state {
            AuthState::AgentTrying { keys, index } => {
                *index += 1;
                if *index < keys.len() {
                    Some(*index)
                } else {
                    None
                }
            }
            _ => return Ok(()),
        };
        match next {
            Some(index) => self.probe_agent_key(Some(index)).map_err(Error::into),
            None => self.try_next_auth(handler).await,
        }
    }

    /// `USERAUTH_PK_OK`: the server would accept this key; produce the
    /// signature and send the real request.
    async fn on_auth_pk_ok<H: Handler>(
        &mut self,
        handler: &mut H,
        algorithm: String,
        _blob: Vec<u8>,
    ) -> Result<(), H::Error> {
        debug!("userauth_pk_ok ({})", algorithm);
        let user = self.auth.user.clone();
        match &self.auth.state {
            AuthState::AwaitingPkOk { key } => {
                let key = key.clone();
                let public = key.public();
                let data = self
                    .transport
                    .auth_sign_data(&user, &public, SignatureDomain::PublicKey)
                    .map_err(Error::from)?;
                match key.sign(&data).await {
                    Ok(signature) => {
                        self.transport
                            .send(Packet::AuthPublicKey {
                                user,
                                key: public,
                                signature: Some(signature),
                            })
                            .map_err(Error::from)?;
                        self.auth.state = AuthState::Probing(Method::PublicKey { key });
                        Ok(())
                    }
                    Err(e) => {
                        // Local signing failure: not fatal, try the next method.
                        error!("signing with the configured key failed: {}", e);
                        self.try_next_auth(handler).await
                    }
                }
            }
            AuthState::AgentTrying { keys, index } => {
                let Some(key) = keys.get(*index).cloned() else {
                    return self.try_next_auth(handler).await;
                };
                if !is_supported_algorithm(&key.algorithm) {
                    let e = crate::agent::AgentError::UnsupportedKeyType(key.algorithm.clone());
                    warn!("{}", e);
                    handler.auth_agent_failure(&e).await?;
                    return self.advance_agent_key(handler).await;
                }
                let data = self
                    .transport
                    .auth_sign_data(&user, &key, SignatureDomain::PublicKey)
                    .map_err(Error::from)?;
                let Some(agent) = self.agent.as_mut() else {
                    return self.try_next_auth(handler).await;
                };
                match agent.sign_request(&key, &data).await {
                    Ok(blob) => match strip_signature_frame(&key.algorithm, &blob) {
                        Ok(signature) => {
                            self.transport
                                .send(Packet::AuthPublicKey {
                                    user,
                                    key,
                                    signature: Some(signature),
                                })
                                .map_err(Error::from)?;
                            Ok(())
                        }
                        Err(e) => {
                            warn!("{}", e);
                            handler.auth_agent_failure(&e).await?;
                            self.advance_agent_key(handler).await
                        }
                    },
                    Err(e) => {
                        warn!("agent signing failed: {}", e);
                        handler.auth_agent_failure(&e).await?;
                        self.advance_agent_key(handler).await
                    }
                }
            }
            _ => {
                debug!("ignoring PK_OK outside a public-key attempt");
                Ok(())
            }
        }
    }

    /// `USERAUTH_PASSWD_CHANGEREQ`: only meaningful while a password
    /// attempt is outstanding.
    async fn on_password_change<H: Handler>(
        &mut self,
        handler: &mut H,
        prompt: String,
    ) -> Result<(), H::Error> {
        let AuthState::Probing(Method::Password { password }) = &self.auth.state else {
            debug!("ignoring password change request outside a password attempt");
            return Ok(());
        };
        let old = password.clone();
        match handler.change_password(&prompt).await? {
            Some(new_password) => {
                let user = self.auth.user.clone();
                self.transport
                    .send(Packet::AuthPassword {
                        user,
                        password: old,
                        new_password: Some(new_password.clone()),
                    })
                    .map_err(Error::from)?;
                self.auth.state = AuthState::Probing(Method::Password {
                    password: new_password,
                });
                Ok(())
            }
            None => self.try_next_auth(handler).await,
        }
    }

    fn on_request_success(&mut self, data: &[u8]) -> Result<(), Error> {
        trace!("global request success");
        self.reply_seen = true;
        match self.open_global_requests.pop_front() {
            Some(GlobalReply::Keepalive) => {
                // ignore keepalives
            }
            Some(GlobalReply::TcpIpForward {
                address,
                port,
                reply,
            }) => {
                // A dynamic bind answers with the assigned port, unless
                // this peer's replies cannot be trusted.
                let dyn_bug = self
                    .transport
                    .compat_flags()
                    .contains(CompatFlags::DYN_RPORT_BUG);
                let bound_port = match data.get(..4) {
                    Some(bytes) if port == 0 && !dyn_bug => BigEndian::read_u32(bytes),
                    _ => port,
                };
                self.forwardings
                    .tcp
                    .insert((address, bound_port), bound_port);
                let _ = reply.send(Some(bound_port));
            }
            Some(GlobalReply::CancelTcpIpForward {
                address,
                port,
                reply,
            }) => {
                self.forwardings
                    .tcp
                    .retain(|(a, p), real| !(*a == address && (*p == port || *real == port)));
                let _ = reply.send(true);
            }
            Some(GlobalReply::StreamLocalForward { socket_path, reply }) => {
                self.forwardings.unix.insert(socket_path);
                let _ = reply.send(true);
            }
            Some(GlobalReply::CancelStreamLocalForward { socket_path, reply }) => {
                self.forwardings.unix.remove(&socket_path);
                let _ = reply.send(true);
            }
            Some(GlobalReply::NoMoreSessions { reply }) => {
                let _ = reply.send(true);
            }
            None => {
                error!("Received global request success for unknown request!")
            }
        }
        Ok(())
    }

    fn on_request_failure(&mut self) -> Result<(), Error> {
        trace!("global request failure");
        self.reply_seen = true;
        match self.open_global_requests.pop_front() {
            Some(GlobalReply::Keepalive) => {
                // ignore keepalives
            }
            Some(GlobalReply::TcpIpForward { reply, .. }) => {
                let _ = reply.send(None);
            }
            Some(GlobalReply::CancelTcpIpForward { reply, .. }) => {
                let _ = reply.send(false);
            }
            Some(GlobalReply::StreamLocalForward { reply, .. }) => {
                let _ = reply.send(false);
            }
            Some(GlobalReply::CancelStreamLocalForward { reply, .. }) => {
                let _ = reply.send(false);
            }
            Some(GlobalReply::NoMoreSessions { reply }) => {
                let _ = reply.send(false);
            }
            None => {
                error!("Received global request failure for unknown request!")
            }
        }
        Ok(())
    }

    async fn on_channel_open_confirmation(
        &mut self,
        local_id: ChannelId,
        remote_id: u32,
        window_size: u32,
        maximum_packet_size: u32,
    ) -> Result<(), Error> {
        debug!("channel_open_confirmation: {}", local_id);
        match self.channels.get(local_id) {
            Some(ChannelSlot::PendingOpen(_)) => {}
            // We've not requested this channel, close the connection.
            _ => return Err(Error::Inconsistent),
        }
        let params = ChannelParams::new(
            local_id,
            remote_id,
            window_size,
            maximum_packet_size,
            self.config.window_size,
            self.config.maximum_packet_size,
        );
        if let Some(channel_ref) = self.channels.update(local_id, params) {
            channel_ref.window_size.update(window_size).await;
            let _ = channel_ref
                .sender
                .send(ChannelMsg::Open {
                    id: local_id,
                    max_packet_size: maximum_packet_size,
                    window_size,
                })
                .await;
        }
        Ok(())
    }

    async fn on_window_adjust(&mut self, id: ChannelId, amount: u32) -> Result<(), Error> {
        debug!("channel_window_adjust: {} +{}", id, amount);
        {
            let Some((params, _)) = self.channels.params_mut(id) else {
                return Err(Error::WrongChannel);
            };
            params.recipient_window_size = params.recipient_window_size.saturating_add(amount);
        }
        // Queued writes drink from the fresh window first.
        self.flush_pending(id)?;
        if let Some((params, channel_ref)) = self.channels.params_mut(id) {
            let new_size = params.recipient_window_size;
            channel_ref.window_size.update(new_size).await;
            let _ = channel_ref
                .sender
                .send(ChannelMsg::WindowAdjusted { new_size })
                .await;
        }
        Ok(())
    }

    /// Inbound channel data, primary or extended stream. Accounting
    /// first: data beyond an exhausted window is dropped, data that
    /// overruns a non-empty window is a protocol violation. The window is
    /// replenished once half of it is consumed.
    async fn on_channel_data(
        &mut self,
        id: ChannelId,
        ext: Option<u32>,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        let target = self.config.window_size;
        let Some((params, channel_ref)) = self.channels.params_mut(id) else {
            debug!("data for unknown channel {}", id);
            return Ok(());
        };
        let len = data.len() as u32;
        if params.sender_window_size == 0 {
            trace!("dropping {} bytes, incoming window exhausted", len);
            return Ok(());
        }
        if len > params.sender_window_size {
            return Err(Error::WindowExceeded);
        }
        params.sender_window_size -= len;
        if params.sender_window_size < target / 2 {
            let amount = target - params.sender_window_size;
            self.transport.send(Packet::ChannelWindowAdjust {
                recipient: params.recipient_channel,
                amount,
            })?;
            params.sender_window_size = target;
        }
        match ext {
            None => {
                let _ = channel_ref.sender.send(ChannelMsg::Data { data }).await;
            }
            Some(STDERR) => {
                let _ = channel_ref
                    .sender
                    .send(ChannelMsg::ExtendedData { data, ext: STDERR })
                    .await;
            }
            Some(other) => {
                // Only stderr is meaningful on the client side.
                trace!("ignoring extended data of type {}", other);
            }
        }
        Ok(())
    }

    async fn on_channel_eof(&mut self, id: ChannelId) -> Result<(), Error> {
        debug!("channel_eof: {}", id);
        let Some((params, channel_ref)) = self.channels.params_mut(id) else {
            return Ok(());
        };
        if params.incoming_state != StreamState::Open {
            return Ok(());
        }
        params.incoming_state = StreamState::Eof;
        let _ = channel_ref.sender.send(ChannelMsg::Eof).await;
        Ok(())
    }

    /// Coordinate closure: make sure our CLOSE went out, release the id,
    /// and end the channel's message stream.
    async fn on_channel_close(&mut self, id: ChannelId) -> Result<(), Error> {
        debug!("channel_close: {}", id);
        if let Some((params, _)) = self.channels.params_mut(id) {
            if params.outgoing_state != StreamState::Closed {
                params.outgoing_state = StreamState::Closed;
                let recipient = params.recipient_channel;
                self.transport.send(Packet::ChannelClose { recipient })?;
            }
        }
        match self.channels.remove(id) {
            Some(ChannelSlot::Live { channel_ref, .. }) => {
                let _ = channel_ref.sender.send(ChannelMsg::Close).await;
            }
            Some(ChannelSlot::PendingOpen(_)) | None => {
                debug!("close for unknown channel {}", id);
            }
        }
        Ok(())
    }

    async fn on_channel_request(
        &mut self,
        id: ChannelId,
        request: ChannelRequest,
    ) -> Result<(), Error> {
        let Some((params, channel_ref)) = self.channels.params_mut(id) else {
            debug!("request for unknown channel {}", id);
            return Ok(());
        };
        match request {
            ChannelRequest::ExitStatus { exit_status } => {
                // The exit record is set at most once.
                if !params.exit_seen {
                    params.exit_seen = true;
                    let _ = channel_ref
                        .sender
                        .send(ChannelMsg::ExitStatus { exit_status })
                        .await;
                }
            }
            ChannelRequest::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => {
                if !params.exit_seen {
                    params.exit_seen = true;
                    let _ = channel_ref
                        .sender
                        .send(ChannelMsg::ExitSignal {
                            signal_name,
                            core_dumped,
                            error_message,
                            lang_tag,
                        })
                        .await;
                }
            }
            ChannelRequest::Keepalive { want_reply } => {
                if want_reply {
                    let recipient = params.recipient_channel;
                    self.transport.send(Packet::ChannelSuccess { recipient })?;
                } else {
                    warn!("Received keepalive without reply request!");
                }
            }
            ChannelRequest::Unknown { typ, want_reply } => {
                info!("Unknown channel request {:?} {:?}", typ, want_reply);
                if want_reply {
                    let recipient = params.recipient_channel;
                    self.transport.send(Packet::ChannelFailure { recipient })?;
                }
            }
        }
        Ok(())
    }

    /// A reply to the oldest outstanding request on this channel. Grants
    /// of agent forwarding and X11 update the permission tables consulted
    /// by the incoming-channel router.
    async fn on_channel_reply(&mut self, id: ChannelId, success: bool) -> Result<(), Error> {
        self.reply_seen = true;
        let granted = {
            let Some((params, _)) = self.channels.params_mut(id) else {
                debug!("reply for unknown channel {}", id);
                return Ok(());
            };
            match params.pending_requests.pop_front() {
                Some(kind) => {
                    if success {
                        Some(kind)
                    } else {
                        None
                    }
                }
                None => {
                    warn!("channel reply with no outstanding request on {}", id);
                    None
                }
            }
        };
        match granted {
            Some(PendingRequest::AgentForward) => self.forwardings.agent_forward_enabled = true,
            Some(PendingRequest::X11) => self.forwardings.accept_x11 += 1,
            _ => {}
        }
        if let Some((_, channel_ref)) = self.channels.params_mut(id) {
            let msg = if success {
                ChannelMsg::Success
            } else {
                ChannelMsg::Failure
            };
            let _ = channel_ref.sender.send(msg).await;
        }
        Ok(())
    }

    /// The incoming-channel policy router: a server-initiated open is
    /// accepted only when the user previously established the matching
    /// permission; everything else is refused without involving the user.
    async fn on_channel_open<H: Handler>(
        &mut self,
        handler: &mut H,
        open: ChannelOpenRequest,
    ) -> Result<(), H::Error> {
        match open.kind.clone() {
            ChannelOpenKind::ForwardedTcpIp {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                let known = self
                    .forwardings
                    .tcp
                    .get(&(connected_address.clone(), connected_port))
                    .copied();
                match known {
                    Some(bound_port) => {
                        if let Some(channel) = self.accept_channel_open(&open).map_err(Error::from)?
                        {
                            handler
                                .server_channel_open_forwarded_tcpip(
                                    channel,
                                    &connected_address,
                                    bound_port,
                                    &originator_address,
                                    originator_port,
                                )
                                .await?;
                        }
                    }
                    None => {
                        debug!(
                            "refusing forwarded-tcpip for unbound {}:{}",
                            connected_address, connected_port
                        );
                        self.reject_channel_open(
                            &open,
                            ChannelOpenFailure::AdministrativelyProhibited,
                            "Connection refused",
                        )
                        .map_err(Error::from)?;
                    }
                }
            }
            ChannelOpenKind::ForwardedStreamLocal { socket_path } => {
                if self.forwardings.unix.contains(&socket_path) {
                    if let Some(channel) = self.accept_channel_open(&open).map_err(Error::from)? {
                        handler
                            .server_channel_open_forwarded_streamlocal(channel, &socket_path)
                            .await?;
                    }
                } else {
                    debug!("refusing forwarded-streamlocal for unbound {}", socket_path);
                    self.reject_channel_open(
                        &open,
                        ChannelOpenFailure::AdministrativelyProhibited,
                        "Connection refused",
                    )
                    .map_err(Error::from)?;
                }
            }
            ChannelOpenKind::AgentForward => {
                if self.forwardings.agent_forward_enabled && self.agent.is_some() {
                    if let Some(channel) = self.accept_channel_open(&open).map_err(Error::from)? {
                        let id = channel.id();
                        if let Some(agent) = self.agent.as_mut() {
                            agent.bridge(channel);
                        }
                        handler.server_channel_open_agent_forward(id).await?;
                    }
                } else {
                    self.reject_channel_open(
                        &open,
                        ChannelOpenFailure::AdministrativelyProhibited,
                        "Agent forwarding not enabled",
                    )
                    .map_err(Error::from)?;
                }
            }
            ChannelOpenKind::X11 {
                originator_address,
                originator_port,
            } => {
                if self.forwardings.accept_x11 > 0 {
                    if let Some(channel) = self.accept_channel_open(&open).map_err(Error::from)? {
                        handler
                            .server_channel_open_x11(channel, &originator_address, originator_port)
                            .await?;
                    }
                } else {
                    self.reject_channel_open(
                        &open,
                        ChannelOpenFailure::AdministrativelyProhibited,
                        "X11 forwarding not requested",
                    )
                    .map_err(Error::from)?;
                }
            }
            ChannelOpenKind::Unknown { typ } => {
                debug!("unknown channel type: {}", typ);
                self.reject_channel_open(
                    &open,
                    ChannelOpenFailure::UnknownChannelType,
                    "Unknown channel type",
                )
                .map_err(Error::from)?;
            }
        }
        Ok(())
    }

    /// Allocate a local id, confirm the open and build the user-facing
    /// channel. `None` means the id space is exhausted and the open was
    /// refused with `RESOURCE_SHORTAGE`.
    fn accept_channel_open(
        &mut self,
        open: &ChannelOpenRequest,
    ) -> Result<Option<Channel<Msg>>, Error> {
        let (sender, receiver) = tokio::sync::mpsc::channel(self.config.channel_buffer_size);
        let window_size = WindowSizeRef::new(open.initial_window_size);
        let channel_ref = ChannelRef::new(sender, window_size.clone());
        let id = match self.channels.add(ChannelSlot::PendingOpen(channel_ref)) {
            Ok(id) => id,
            Err(_) => {
                self.reject_channel_open(
                    open,
                    ChannelOpenFailure::ResourceShortage,
                    "No channel ids left",
                )?;
                return Ok(None);
            }
        };
        let params = ChannelParams::new(
            id,
            open.sender_channel,
            open.initial_window_size,
            open.maximum_packet_size,
            self.config.window_size,
            self.config.maximum_packet_size,
        );
        let our_window_size = params.sender_window_size;
        let our_maximum_packet_size = params.sender_maximum_packet_size;
        self.channels.update(id, params);
        self.transport.send(Packet::ChannelOpenConfirmation {
            recipient: open.sender_channel,
            sender: id,
            window_size: our_window_size,
            maximum_packet_size: our_maximum_packet_size,
        })?;
        Ok(Some(Channel::from_parts(
            id,
            self.inbound_channel_sender.clone(),
            receiver,
            open.maximum_packet_size,
            window_size,
        )))
    }

    fn reject_channel_open(
        &mut self,
        open: &ChannelOpenRequest,
        reason: ChannelOpenFailure,
        description: &str,
    ) -> Result<(), Error> {
        self.transport
            .send(Packet::ChannelOpenFailure {
                recipient: open.sender_channel,
                reason,
                description: description.to_string(),
            })
            .map_err(Error::from)
    }
}
