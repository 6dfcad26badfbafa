//! The SSH agent seam.
//!
//! The agent speaks its own IPC protocol over a Unix socket or named pipe;
//! that client lives outside this crate. Here it is only a key lister, a
//! remote signer, and the sink for forwarded `auth-agent@openssh.com`
//! channels.

use async_trait::async_trait;
use thiserror::Error;

use crate::channels::Channel;
use crate::client::Msg;
use crate::key::PublicKey;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent failure: {0}")]
    Failure(String),

    #[error("agent offered an unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// The agent signed with a different algorithm than the one the
    /// server was offered.
    #[error("agent signature algorithm mismatch: requested {requested}, got {returned}")]
    SignatureTypeMismatch { requested: String, returned: String },

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// An SSH authentication agent.
#[async_trait]
pub trait Agent: Send {
    /// List the identities the agent holds, in the agent's order.
    async fn request_identities(&mut self) -> Result<Vec<PublicKey>, AgentError>;

    /// Ask the agent to sign `data` with `key`. The reply is the complete
    /// signature blob as framed by the agent, `string algorithm, string
    /// signature`; the caller validates the algorithm tag.
    async fn sign_request(&mut self, key: &PublicKey, data: &[u8]) -> Result<Vec<u8>, AgentError>;

    /// Serve a server-initiated agent-forwarding channel by proxying it to
    /// the local agent. Ownership of the channel moves to the agent; the
    /// usual implementation spawns a copy task per direction.
    fn bridge(&mut self, channel: Channel<Msg>);
}
