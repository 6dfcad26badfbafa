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

//! Connection-wide bookkeeping shared by the event loop: the channel
//! table, per-channel flow-control state, the FIFO of outstanding global
//! requests and the forwarding permission tables.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tokio::sync::oneshot;

use crate::channels::ChannelRef;
use crate::ChannelId;

/// Direction state of one half of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Open,
    Eof,
    Closed,
}

/// The kind of channel request whose reply is pending, in send order.
/// Replies arrive FIFO per channel, so popping the front on every
/// `CHANNEL_SUCCESS`/`CHANNEL_FAILURE` re-associates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingRequest {
    AgentForward,
    Pty,
    X11,
    Shell,
    Exec,
    Subsystem,
}

/// The parameters of a confirmed channel.
#[derive(Debug)]
pub(crate) struct ChannelParams {
    pub recipient_channel: u32,
    pub sender_channel: ChannelId,
    /// Bytes we may still send before the peer must adjust.
    pub recipient_window_size: u32,
    /// Bytes the peer may still send before we adjust.
    pub sender_window_size: u32,
    pub recipient_maximum_packet_size: u32,
    pub sender_maximum_packet_size: u32,
    pub incoming_state: StreamState,
    pub outgoing_state: StreamState,
    /// (buffer, extended stream #, data offset in buffer)
    pub pending_data: VecDeque<(Vec<u8>, Option<u32>, usize)>,
    pub pending_eof: bool,
    pub pending_close: bool,
    pub pending_requests: VecDeque<PendingRequest>,
    /// An exit status or signal may be recorded at most once.
    pub exit_seen: bool,
}

impl ChannelParams {
    pub fn new(
        sender_channel: ChannelId,
        recipient_channel: u32,
        recipient_window_size: u32,
        recipient_maximum_packet_size: u32,
        sender_window_size: u32,
        sender_maximum_packet_size: u32,
    ) -> Self {
        ChannelParams {
            recipient_channel,
            sender_channel,
            recipient_window_size,
            sender_window_size,
            recipient_maximum_packet_size,
            sender_maximum_packet_size,
            incoming_state: StreamState::Open,
            outgoing_state: StreamState::Open,
            pending_data: VecDeque::new(),
            pending_eof: false,
            pending_close: false,
            pending_requests: VecDeque::new(),
            exit_seen: false,
        }
    }

    pub fn has_pending_data(&self) -> bool {
        !self.pending_data.is_empty()
    }
}

/// One slot of the channel table.
#[derive(Debug)]
pub(crate) enum ChannelSlot {
    /// A locally-initiated open waiting for the peer's confirmation.
    PendingOpen(ChannelRef),
    /// A confirmed channel.
    Live {
        params: ChannelParams,
        channel_ref: ChannelRef,
    },
}

/// Local channel ids: dense, reusable small integers. The smallest free
/// id is always taken first, and ids are recycled once both directions
/// have closed.
#[derive(Debug, Default)]
pub(crate) struct ChannelTable {
    slots: HashMap<u32, ChannelSlot>,
    free: BTreeSet<u32>,
    next: u32,
}

impl ChannelTable {
    /// Reserve the smallest free id for `slot`. When the id space is
    /// exhausted the slot is handed back so the caller can fail the open.
    pub fn add(&mut self, slot: ChannelSlot) -> Result<ChannelId, ChannelSlot> {
        let id = match self.free.pop_first() {
            Some(id) => id,
            None => match self.next.checked_add(1) {
                Some(next) => {
                    let id = self.next;
                    self.next = next;
                    id
                }
                None => return Err(slot),
            },
        };
        self.slots.insert(id, slot);
        Ok(ChannelId(id))
    }

    pub fn get(&self, id: ChannelId) -> Option<&ChannelSlot> {
        self.slots.get(&id.0)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut ChannelSlot> {
        self.slots.get_mut(&id.0)
    }

    pub fn params_mut(&mut self, id: ChannelId) -> Option<(&mut ChannelParams, &ChannelRef)> {
        match self.slots.get_mut(&id.0) {
            Some(ChannelSlot::Live {
                params,
                channel_ref,
            }) => Some((params, channel_ref)),
            _ => None,
        }
    }

    /// Replace a pending open with a live channel.
    pub fn update(&mut self, id: ChannelId, params: ChannelParams) -> Option<&ChannelRef> {
        match self.slots.remove(&id.0) {
            Some(ChannelSlot::PendingOpen(channel_ref)) => {
                self.slots.insert(
                    id.0,
                    ChannelSlot::Live {
                        params,
                        channel_ref,
                    },
                );
                match self.slots.get(&id.0) {
                    Some(ChannelSlot::Live { channel_ref, .. }) => Some(channel_ref),
                    _ => None,
                }
            }
            Some(other) => {
                self.slots.insert(id.0, other);
                None
            }
            None => None,
        }
    }

    /// Release an id for reuse.
    pub fn remove(&mut self, id: ChannelId) -> Option<ChannelSlot> {
        let slot = self.slots.remove(&id.0)?;
        self.free.insert(id.0);
        Some(slot)
    }

    /// Drain every slot for teardown. Dropping the returned refs closes
    /// the user-facing receivers, which is how pending continuations
    /// learn that no reply is coming.
    pub fn drain(&mut self) -> Vec<ChannelSlot> {
        self.free.clear();
        self.next = 0;
        self.slots.drain().map(|(_, slot)| slot).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Remaining reply to a global request, in submission order. The peer
/// guarantees FIFO replies, so the front entry always matches the next
/// `REQUEST_SUCCESS`/`REQUEST_FAILURE`.
pub(crate) enum GlobalReply {
    /// A keepalive probe; the reply only proves liveness.
    Keepalive,
    /// `tcpip-forward`; answers `Some(bound_port)` or `None` on failure.
    TcpIpForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<Option<u32>>,
    },
    CancelTcpIpForward {
        address: String,
        port: u32,
        reply: oneshot::Sender<bool>,
    },
    StreamLocalForward {
        socket_path: String,
        reply: oneshot::Sender<bool>,
    },
    CancelStreamLocalForward {
        socket_path: String,
        reply: oneshot::Sender<bool>,
    },
    NoMoreSessions { reply: oneshot::Sender<bool> },
}

/// What the user has bound or granted; consulted when the server opens a
/// channel towards us.
#[derive(Debug, Default)]
pub(crate) struct Forwardings {
    /// `(address, bound port)` → bound port. The port stored is the real
    /// one: for a dynamic (0) request it is the server-assigned port from
    /// the reply, unless the peer's reply cannot be trusted.
    pub tcp: HashMap<(String, u32), u32>,
    /// Unix socket paths currently bound on the server.
    pub unix: HashSet<String>,
    /// Channels that successfully requested X11 forwarding.
    pub accept_x11: u32,
    /// Latched once an agent-forward request succeeded.
    pub agent_forward_enabled: bool,
}
