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

//! Outbound operations of the event loop: channel opens, channel
//! requests, flow-controlled data, global requests, keepalive and
//! disconnect. Everything here runs on the loop task, so window
//! arithmetic is race-free by construction.

use log::{debug, warn};
use tokio::sync::oneshot;

use crate::channels::{ChannelMsg, ChannelRef};
use crate::session::{ChannelParams, ChannelSlot, GlobalReply, PendingRequest, StreamState};
use crate::transport::{Packet, Transport};
use crate::{ChannelId, ChannelOpenFailure, Disconnect, Error, Sig};

use super::Session;

impl<T: Transport> Session<T> {
    fn channel_open_generic(
        &mut self,
        channel_ref: ChannelRef,
        make_packet: impl FnOnce(ChannelId, u32, u32) -> Packet,
    ) -> Result<(), Error> {
        let window_size = self.config.window_size;
        let maximum_packet_size = self.config.maximum_packet_size;
        match self.channels.add(ChannelSlot::PendingOpen(channel_ref)) {
            Ok(id) => self
                .transport
                .send(make_packet(id, window_size, maximum_packet_size))
                .map_err(Error::from),
            Err(slot) => {
                // Local ids exhausted; fail the open without touching the wire.
                if let ChannelSlot::PendingOpen(channel_ref) = slot {
                    let _ = channel_ref.sender.try_send(ChannelMsg::OpenFailure(
                        ChannelOpenFailure::ResourceShortage,
                    ));
                }
                Ok(())
            }
        }
    }

    pub fn channel_open_session(&mut self, channel_ref: ChannelRef) -> Result<(), Error> {
        self.channel_open_generic(channel_ref, |sender, window_size, maximum_packet_size| {
            Packet::ChannelOpenSession {
                sender,
                window_size,
                maximum_packet_size,
            }
        })
    }

    pub fn channel_open_direct_tcpip(
        &mut self,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        channel_ref: ChannelRef,
    ) -> Result<(), Error> {
        let host_to_connect = host_to_connect.to_string();
        let originator_address = originator_address.to_string();
        self.channel_open_generic(channel_ref, |sender, window_size, maximum_packet_size| {
            Packet::ChannelOpenDirectTcpIp {
                sender,
                window_size,
                maximum_packet_size,
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            }
        })
    }

    pub fn channel_open_direct_streamlocal(
        &mut self,
        socket_path: &str,
        channel_ref: ChannelRef,
    ) -> Result<(), Error> {
        let socket_path = socket_path.to_string();
        self.channel_open_generic(channel_ref, |sender, window_size, maximum_packet_size| {
            Packet::ChannelOpenDirectStreamLocal {
                sender,
                window_size,
                maximum_packet_size,
                socket_path,
            }
        })
    }

    /// Look up a live, writable channel for an outgoing request; channels
    /// whose outgoing side is no longer open must not originate requests.
    fn writable_channel(&mut self, id: ChannelId) -> Option<&mut ChannelParams> {
        match self.channels.params_mut(id) {
            Some((params, _)) if params.outgoing_state == StreamState::Open => Some(params),
            Some(_) => {
                debug!("channel {} no longer open, dropping request", id);
                None
            }
            None => {
                warn!("request on unknown channel {}", id);
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn request_pty(
        &mut self,
        id: ChannelId,
        want_reply: bool,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: &[(u8, u32)],
    ) -> Result<(), Error> {
        let Some(params) = self.writable_channel(id) else {
            return Ok(());
        };
        if want_reply {
            params.pending_requests.push_back(PendingRequest::Pty);
        }
        let recipient = params.recipient_channel;
        self.transport
            .send(Packet::RequestPty {
                recipient,
                want_reply,
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                terminal_modes: terminal_modes.to_vec(),
            })
            .map_err(Error::from)
    }

    pub fn request_x11(
        &mut self,
        id: ChannelId,
        want_reply: bool,
        single_connection: bool,
        x11_authentication_protocol: &str,
        x11_authentication_cookie: &str,
        x11_screen_number: u32,
    ) -> Result<(), Error> {
        let Some(params) = self.writable_channel(id) else {
            return Ok(());
        };
        if want_reply {
            params.pending_requests.push_back(PendingRequest::X11);
        }
        let recipient = params.recipient_channel;
        self.transport
            .send(Packet::RequestX11 {
                recipient,
                want_reply,
                single_connection,
                x11_authentication_protocol: x11_authentication_protocol.to_string(),
                x11_authentication_cookie: x11_authentication_cookie.to_string(),
                x11_screen_number,
            })
            .map_err(Error::from)
    }

    /// `env` requests never ask for a reply, and therefore stay outside
    /// the per-channel reply queue.
    pub fn set_env(
        &mut self,
        id: ChannelId,
        variable_name: &str,
        variable_value: &str,
    ) -> Result<(), Error> {
        let Some(params) = self.writable_channel(id) else {
            return Ok(());
        };
        let recipient = params.recipient_channel;
        self.transport
            .send(Packet::SetEnv {
                recipient,
                want_reply: false,
                variable_name: variable_name.to_string(),
                variable_value: variable_value.to_string(),
            })
            .map_err(Error::from)
    }

    pub fn request_shell(&mut self, id: ChannelId, want_reply: bool) -> Result<(), Error> {
        let Some(params) = self.writable_channel(id) else {
            return Ok(());
        };
        if want_reply {
            params.pending_requests.push_back(PendingRequest::Shell);
        }
        let recipient = params.recipient_channel;
        self.transport
            .send(Packet::RequestShell {
                recipient,
                want_reply,
            })
            .map_err(Error::from)
    }

    pub fn exec(&mut self, id: ChannelId, want_reply: bool, command: Vec<u8>) -> Result<(), Error> {
        let Some(params) = self.writable_channel(id) else {
            return Ok(());
        };
        if want_reply {
            params.pending_requests.push_back(PendingRequest::Exec);
        }
        let recipient = params.recipient_channel;
        self.transport
            .send(Packet::Exec {
                recipient,
                want_reply,
                command,
            })
            .map_err(Error::from)
    }

    pub fn request_subsystem(
        &mut self,
        id: ChannelId,
        want_reply: bool,
        name: &str,
    ) -> Result<(), Error> {
        let Some(params) = self.writable_channel(id) else {
            return Ok(());
        };
        if want_reply {
            params.pending_requests.push_back(PendingRequest::Subsystem);
        }
        let recipient = params.recipient_channel;
        self.transport
            .send(Packet::RequestSubsystem {
                recipient,
                want_reply,
                name: name.to_string(),
            })
            .map_err(Error::from)
    }

    pub fn agent_forward(&mut self, id: ChannelId, want_reply: bool) -> Result<(), Error> {
        let Some(params) = self.writable_channel(id) else {
            return Ok(());
        };
        if want_reply {
            params
                .pending_requests
                .push_back(PendingRequest::AgentForward);
        }
        let recipient = params.recipient_channel;
        self.transport
            .send(Packet::AgentForward {
                recipient,
                want_reply,
            })
            .map_err(Error::from)
    }

    pub fn signal(&mut self, id: ChannelId, signal: Sig) -> Result<(), Error> {
        let Some(params) = self.writable_channel(id) else {
            return Ok(());
        };
        let recipient = params.recipient_channel;
        self.transport
            .send(Packet::Signal { recipient, signal })
            .map_err(Error::from)
    }

    pub fn window_change(
        &mut self,
        id: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        let Some(params) = self.writable_channel(id) else {
            return Ok(());
        };
        let recipient = params.recipient_channel;
        self.transport
            .send(Packet::WindowChange {
                recipient,
                col_width,
                row_height,
                pix_width,
                pix_height,
            })
            .map_err(Error::from)
    }

    pub fn data(&mut self, id: ChannelId, data: Vec<u8>) -> Result<(), Error> {
        self.send_channel_data(id, None, data)
    }

    pub fn extended_data(&mut self, id: ChannelId, ext: u32, data: Vec<u8>) -> Result<(), Error> {
        self.send_channel_data(id, Some(ext), data)
    }

    /// Emit what the window allows immediately; anything beyond the
    /// window waits on the channel's pending queue until the peer
    /// adjusts.
    fn send_channel_data(
        &mut self,
        id: ChannelId,
        ext: Option<u32>,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        let Some((params, _)) = self.channels.params_mut(id) else {
            debug!("data for unknown channel {}", id);
            return Ok(());
        };
        if params.outgoing_state != StreamState::Open {
            debug!("data on non-open channel {}, dropped", id);
            return Ok(());
        }
        if params.has_pending_data() {
            params.pending_data.push_back((data, ext, 0));
            return Ok(());
        }
        let wrote = Self::data_noqueue(&mut self.transport, params, &data, ext, 0)?;
        if wrote < data.len() {
            params.pending_data.push_back((data, ext, wrote));
        }
        Ok(())
    }

    /// Send as much of `data[from..]` as the window permits, splitting at
    /// the peer's maximum packet size. Returns how many bytes went out.
    fn data_noqueue(
        transport: &mut T,
        params: &mut ChannelParams,
        data: &[u8],
        ext: Option<u32>,
        from: usize,
    ) -> Result<usize, Error> {
        let mut pos = from;
        while pos < data.len() && params.recipient_window_size > 0 {
            let len = (data.len() - pos)
                .min(params.recipient_window_size as usize)
                .min(params.recipient_maximum_packet_size as usize);
            log::trace!("channel {}: sending {} bytes", params.sender_channel, len);
            let chunk = data.get(pos..pos + len).unwrap_or_default().to_vec();
            let packet = match ext {
                None => Packet::ChannelData {
                    recipient: params.recipient_channel,
                    data: chunk,
                },
                Some(ext) => Packet::ChannelExtendedData {
                    recipient: params.recipient_channel,
                    ext,
                    data: chunk,
                },
            };
            transport.send(packet)?;
            params.recipient_window_size -= len as u32;
            pos += len;
        }
        Ok(pos - from)
    }

    /// Resume queued writes after a window adjust; deferred EOF/close go
    /// out once the queue drains.
    pub(crate) fn flush_pending(&mut self, id: ChannelId) -> Result<(), Error> {
        let Some((params, _)) = self.channels.params_mut(id) else {
            return Ok(());
        };
        while let Some((data, ext, from)) = params.pending_data.pop_front() {
            let wrote = Self::data_noqueue(&mut self.transport, params, &data, ext, from)?;
            if from + wrote < data.len() {
                params.pending_data.push_front((data, ext, from + wrote));
                break;
            }
        }
        if !params.has_pending_data() {
            let recipient = params.recipient_channel;
            if params.pending_eof {
                params.pending_eof = false;
                self.transport.send(Packet::ChannelEof { recipient })?;
            }
            if params.pending_close {
                params.pending_close = false;
                self.transport.send(Packet::ChannelClose { recipient })?;
            }
        }
        Ok(())
    }

    pub fn eof(&mut self, id: ChannelId) -> Result<(), Error> {
        let Some((params, _)) = self.channels.params_mut(id) else {
            return Ok(());
        };
        if params.outgoing_state != StreamState::Open {
            return Ok(());
        }
        params.outgoing_state = StreamState::Eof;
        if params.has_pending_data() {
            params.pending_eof = true;
            Ok(())
        } else {
            let recipient = params.recipient_channel;
            self.transport
                .send(Packet::ChannelEof { recipient })
                .map_err(Error::from)
        }
    }

    /// Close our half. The id stays allocated until the peer's CLOSE
    /// arrives, which is what releases it.
    pub fn close(&mut self, id: ChannelId) -> Result<(), Error> {
        let Some((params, _)) = self.channels.params_mut(id) else {
            return Ok(());
        };
        if params.outgoing_state == StreamState::Closed {
            return Ok(());
        }
        params.outgoing_state = StreamState::Closed;
        if params.has_pending_data() {
            params.pending_close = true;
            Ok(())
        } else {
            let recipient = params.recipient_channel;
            self.transport
                .send(Packet::ChannelClose { recipient })
                .map_err(Error::from)
        }
    }

    pub fn tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        reply_channel: oneshot::Sender<Option<u32>>,
    ) -> Result<(), Error> {
        self.open_global_requests.push_back(GlobalReply::TcpIpForward {
            address: address.to_string(),
            port,
            reply: reply_channel,
        });
        self.transport
            .send(Packet::TcpIpForward {
                address: address.to_string(),
                port,
                want_reply: true,
            })
            .map_err(Error::from)
    }

    pub fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        reply_channel: oneshot::Sender<bool>,
    ) -> Result<(), Error> {
        self.open_global_requests
            .push_back(GlobalReply::CancelTcpIpForward {
                address: address.to_string(),
                port,
                reply: reply_channel,
            });
        self.transport
            .send(Packet::CancelTcpIpForward {
                address: address.to_string(),
                port,
                want_reply: true,
            })
            .map_err(Error::from)
    }

    pub fn streamlocal_forward(
        &mut self,
        socket_path: &str,
        reply_channel: oneshot::Sender<bool>,
    ) -> Result<(), Error> {
        self.open_global_requests
            .push_back(GlobalReply::StreamLocalForward {
                socket_path: socket_path.to_string(),
                reply: reply_channel,
            });
        self.transport
            .send(Packet::StreamLocalForward {
                socket_path: socket_path.to_string(),
                want_reply: true,
            })
            .map_err(Error::from)
    }

    pub fn cancel_streamlocal_forward(
        &mut self,
        socket_path: &str,
        reply_channel: oneshot::Sender<bool>,
    ) -> Result<(), Error> {
        self.open_global_requests
            .push_back(GlobalReply::CancelStreamLocalForward {
                socket_path: socket_path.to_string(),
                reply: reply_channel,
            });
        self.transport
            .send(Packet::CancelStreamLocalForward {
                socket_path: socket_path.to_string(),
                want_reply: true,
            })
            .map_err(Error::from)
    }

    pub fn no_more_sessions(&mut self, reply_channel: oneshot::Sender<bool>) -> Result<(), Error> {
        self.open_global_requests
            .push_back(GlobalReply::NoMoreSessions {
                reply: reply_channel,
            });
        self.transport
            .send(Packet::NoMoreSessions { want_reply: true })
            .map_err(Error::from)
    }

    /// A liveness probe. The no-op queue entry keeps the global reply
    /// FIFO aligned with whatever the server answers.
    pub fn send_keepalive(&mut self) -> Result<(), Error> {
        self.open_global_requests.push_back(GlobalReply::Keepalive);
        self.transport.send(Packet::Ping).map_err(Error::from)
    }

    pub fn disconnect(&mut self, reason: Disconnect, description: &str) -> Result<(), Error> {
        if self.disconnected {
            return Ok(());
        }
        self.disconnected = true;
        self.transport
            .send(Packet::Disconnect {
                reason,
                description: description.to_string(),
            })
            .map_err(Error::from)
    }
}
