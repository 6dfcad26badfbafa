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

use std::borrow::Cow;

/// The algorithm offer handed to the transport at construction time: one
/// preference-ordered name list per negotiated slot. The transport performs
/// the actual negotiation; an empty list means "take the transport's
/// defaults" for that slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preferred {
    /// Key exchange algorithms.
    pub kex: Cow<'static, [&'static str]>,
    /// Server host key algorithms.
    pub key: Cow<'static, [&'static str]>,
    /// Symmetric ciphers.
    pub cipher: Cow<'static, [&'static str]>,
    /// Message authentication codes.
    pub mac: Cow<'static, [&'static str]>,
    /// Compression algorithms.
    pub compression: Cow<'static, [&'static str]>,
}

impl Default for Preferred {
    fn default() -> Preferred {
        Preferred {
            kex: Cow::Borrowed(&[
                "curve25519-sha256",
                "curve25519-sha256@libssh.org",
                "ecdh-sha2-nistp256",
                "diffie-hellman-group14-sha256",
            ]),
            key: Cow::Borrowed(&[
                "ssh-ed25519",
                "ecdsa-sha2-nistp256",
                "rsa-sha2-512",
                "rsa-sha2-256",
            ]),
            cipher: Cow::Borrowed(&[
                "chacha20-poly1305@openssh.com",
                "aes256-gcm@openssh.com",
                "aes256-ctr",
                "aes192-ctr",
                "aes128-ctr",
            ]),
            mac: Cow::Borrowed(&["hmac-sha2-256-etm@openssh.com", "hmac-sha2-256", "hmac-sha1"]),
            compression: Cow::Borrowed(&["none", "zlib@openssh.com"]),
        }
    }
}
