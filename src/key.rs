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

//! The key-material seam. Parsing key files and producing signatures is
//! the business of an external collaborator; the connection layer only
//! handles opaque wire-encoded key blobs and raw signatures.

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::agent::AgentError;

/// An SSH public key as it appears on the wire: the algorithm name and the
/// algorithm-specific blob (which itself embeds the name again).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub algorithm: String,
    pub blob: Vec<u8>,
}

impl PublicKey {
    pub fn new(algorithm: impl Into<String>, blob: impl Into<Vec<u8>>) -> Self {
        PublicKey {
            algorithm: algorithm.into(),
            blob: blob.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("signing failed: {0}")]
pub struct SignatureError(pub String);

/// Something that can sign userauth challenges with a private key. The
/// crate ships no implementation; key-file collaborators provide one.
#[async_trait]
pub trait Signer: Send + Sync {
    /// The public half, advertised in the userauth probe.
    fn public(&self) -> PublicKey;

    /// Sign `data`, returning the raw signature without the SSH
    /// `(algorithm, signature)` frame.
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SignatureError>;
}

/// Key algorithms this client is willing to offer for public-key
/// authentication.
pub const SUPPORTED_KEY_ALGORITHMS: &[&str] = &[
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "rsa-sha2-512",
    "rsa-sha2-256",
    "ssh-rsa",
    "ssh-dss",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

pub fn is_supported_algorithm(name: &str) -> bool {
    SUPPORTED_KEY_ALGORITHMS.contains(&name)
}

fn read_ssh_string(buf: &[u8], offset: &mut usize) -> Option<Vec<u8>> {
    let header = buf.get(*offset..*offset + 4)?;
    let len = BigEndian::read_u32(header) as usize;
    let body = buf.get(*offset + 4..*offset + 4 + len)?;
    *offset += 4 + len;
    Some(body.to_vec())
}

/// Agents answer sign requests with `string algorithm, string signature`.
/// Validate the embedded algorithm tag against the key type that was
/// offered and return the bare signature.
pub(crate) fn strip_signature_frame(expected: &str, blob: &[u8]) -> Result<Vec<u8>, AgentError> {
    let mut offset = 0;
    let algorithm = read_ssh_string(blob, &mut offset)
        .ok_or_else(|| AgentError::Failure("truncated signature blob".into()))?;
    let signature = read_ssh_string(blob, &mut offset)
        .ok_or_else(|| AgentError::Failure("truncated signature blob".into()))?;
    let returned = String::from_utf8_lossy(&algorithm).into_owned();
    if returned != expected {
        return Err(AgentError::SignatureTypeMismatch {
            requested: expected.to_string(),
            returned,
        });
    }
    Ok(signature)
}

#[cfg(test)]
pub(crate) fn frame_signature(algorithm: &str, signature: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in [algorithm.as_bytes(), signature] {
        let mut header = [0u8; 4];
        BigEndian::write_u32(&mut header, part.len() as u32);
        out.extend_from_slice(&header);
        out.extend_from_slice(part);
    }
    out
}
