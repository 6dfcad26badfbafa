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

//! User authentication: method descriptions and the strategy deciding
//! what to try next. The orchestration itself (reacting to the server's
//! failures, `PK_OK` probes, prompts and partial successes) runs inside
//! the connection event loop.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;

use crate::key::{PublicKey, Signer};

bitflags! {
    /// Set of authentication methods, represented by bit flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodSet: u32 {
        /// The SSH `none` method (no authentication).
        const NONE = 1;
        /// The SSH `password` method (plaintext passwords).
        const PASSWORD = 2;
        /// The SSH `publickey` method (sign a challenge sent by the
        /// server).
        const PUBLICKEY = 4;
        /// The SSH `hostbased` method (certain hostnames are allowed
        /// by the server).
        const HOSTBASED = 8;
        /// The SSH `keyboard-interactive` method (answer to a
        /// challenge, where the "challenge" can be a password prompt,
        /// a bytestring to sign with a smartcard, or something else).
        const KEYBOARD_INTERACTIVE = 16;
    }
}

impl MethodSet {
    fn from_method_name(name: &str) -> Option<MethodSet> {
        match name {
            "none" => Some(MethodSet::NONE),
            "password" => Some(MethodSet::PASSWORD),
            "publickey" => Some(MethodSet::PUBLICKEY),
            "hostbased" => Some(MethodSet::HOSTBASED),
            "keyboard-interactive" => Some(MethodSet::KEYBOARD_INTERACTIVE),
            _ => None,
        }
    }

    /// Parse the comma-separated name-list of a `USERAUTH_FAILURE`;
    /// unknown names are ignored.
    pub fn from_namelist(list: &str) -> MethodSet {
        let mut set = MethodSet::empty();
        for name in list.split(',') {
            if let Some(m) = MethodSet::from_method_name(name) {
                set |= m;
            }
        }
        set
    }
}

/// One prompt of a keyboard-interactive round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub prompt: String,
    pub echo: bool,
}

/// One concrete authentication attempt.
#[derive(Clone)]
pub enum Method {
    None,
    Password {
        password: String,
    },
    PublicKey {
        key: Arc<dyn Signer>,
    },
    /// Public-key authentication with every identity the agent holds, in
    /// agent order, signing through the agent.
    Agent,
    KeyboardInteractive {
        submethods: String,
    },
    HostBased {
        key: Arc<dyn Signer>,
        local_hostname: String,
        local_username: String,
    },
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::None => "none",
            Method::Password { .. } => "password",
            Method::PublicKey { .. } => "publickey",
            Method::Agent => "agent",
            Method::KeyboardInteractive { .. } => "keyboard-interactive",
            Method::HostBased { .. } => "hostbased",
        }
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decides which method to try next. Invoked after the service is
/// accepted and again after every `USERAUTH_FAILURE`, with the server's
/// advertised continuations; returning `None` means giving up, which
/// surfaces as [`crate::Error::AllAuthMethodsFailed`].
#[async_trait]
pub trait AuthHandler: Send {
    async fn next_method(
        &mut self,
        methods_left: Option<&MethodSet>,
        partial_success: bool,
    ) -> Option<Method>;
}

/// The default strategy: the methods derivable from the configuration, in
/// fixed order, each tried at most once regardless of what the server
/// advertises.
pub(crate) struct ConfiguredMethods {
    queue: VecDeque<Method>,
}

impl ConfiguredMethods {
    pub fn new(queue: VecDeque<Method>) -> Self {
        ConfiguredMethods { queue }
    }
}

#[async_trait]
impl AuthHandler for ConfiguredMethods {
    async fn next_method(
        &mut self,
        _methods_left: Option<&MethodSet>,
        _partial_success: bool,
    ) -> Option<Method> {
        self.queue.pop_front()
    }
}

/// Progress of the authentication exchange, driven by the event loop.
pub(crate) enum AuthState {
    /// Nothing sent yet; waiting for `SERVICE_ACCEPT`.
    Idle,
    /// A request for this method is on the wire.
    Probing(Method),
    /// A public-key probe is on the wire; `PK_OK` or failure decides.
    AwaitingPkOk { key: Arc<dyn Signer> },
    /// Probing the agent's identities, currently at `index`.
    AgentTrying { keys: Vec<PublicKey>, index: usize },
    Authenticated,
}

impl AuthState {
    pub fn method_name(&self) -> &'static str {
        match self {
            AuthState::Idle => "(none yet)",
            AuthState::Probing(m) => m.name(),
            AuthState::AwaitingPkOk { .. } => "publickey",
            AuthState::AgentTrying { .. } => "agent",
            AuthState::Authenticated => "(authenticated)",
        }
    }
}

/// Orchestrator state shared between the event-loop handlers.
pub(crate) struct AuthFlow {
    pub user: String,
    pub state: AuthState,
    pub handler: Box<dyn AuthHandler>,
    pub methods_left: Option<MethodSet>,
    pub partial_success: bool,
}

impl AuthFlow {
    pub fn new(user: String, handler: Box<dyn AuthHandler>) -> Self {
        AuthFlow {
            user,
            state: AuthState::Idle,
            handler,
            methods_left: None,
            partial_success: false,
        }
    }

    pub fn record_failure(&mut self, methods_left: MethodSet, partial_success: bool) {
        self.methods_left = Some(methods_left);
        self.partial_success = partial_success;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namelist_parsing() {
        let set = MethodSet::from_namelist("publickey,password,bogus");
        assert_eq!(set, MethodSet::PUBLICKEY | MethodSet::PASSWORD);
        assert_eq!(MethodSet::from_namelist(""), MethodSet::empty());
    }

    #[tokio::test]
    async fn configured_methods_run_in_order_then_give_up() {
        let mut handler = ConfiguredMethods::new(VecDeque::from([
            Method::None,
            Method::Password {
                password: "p".into(),
            },
        ]));
        let first = handler.next_method(None, false).await.unwrap();
        assert_eq!(first.name(), "none");
        let second = handler
            .next_method(Some(&MethodSet::PASSWORD), false)
            .await
            .unwrap();
        assert_eq!(second.name(), "password");
        assert!(handler.next_method(None, false).await.is_none());
    }
}
