use tokio::sync::mpsc::Sender;

use super::WindowSizeRef;
use crate::ChannelMsg;

/// The event loop's end of a [`super::Channel`]: delivers messages to the
/// user half and keeps its view of the outgoing window current.
#[derive(Debug)]
pub struct ChannelRef {
    pub(crate) sender: Sender<ChannelMsg>,
    pub(crate) window_size: WindowSizeRef,
}

impl ChannelRef {
    pub(crate) fn new(sender: Sender<ChannelMsg>, window_size: WindowSizeRef) -> Self {
        Self {
            sender,
            window_size,
        }
    }
}

impl std::ops::Deref for ChannelRef {
    type Target = Sender<ChannelMsg>;

    fn deref(&self) -> &Self::Target {
        &self.sender
    }
}
