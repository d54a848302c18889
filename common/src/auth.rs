//! Credential-exchange mechanisms and the per-connection attribute set.
//!
//! Exchanges are driven by the negotiator one step at a time. The server
//! side checks responses against a [`UserDatabase`]; the client side
//! answers from the username and secret in its [`Attributes`].

use std::{collections::HashMap, fmt, fs, path::Path};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::{error::PmError, platform_socket::ClientCredentials};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 16;

/// Supported exchange mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// Username and secret in the clear, only sensible over an encrypted channel
    Plain,
    /// Challenge-response keyed by the shared secret
    HmacSha256,
}

impl Mechanism {
    /// Every mechanism in server preference order.
    pub const ALL: [Mechanism; 2] = [Mechanism::HmacSha256, Mechanism::Plain];

    pub fn name(self) -> &'static str {
        match self {
            Mechanism::Plain => "PLAIN",
            Mechanism::HmacSha256 => "HMAC-SHA256",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mechanism list as carried in the server's first exchange PDU.
pub fn encode_mechanisms(mechanisms: &[Mechanism]) -> Vec<u8> {
    mechanisms
        .iter()
        .map(|m| m.name())
        .collect::<Vec<_>>()
        .join(" ")
        .into_bytes()
}

/// Parse a mechanism list, skipping names this side does not know.
pub fn decode_mechanisms(payload: &[u8]) -> Vec<Mechanism> {
    String::from_utf8_lossy(payload)
        .split_whitespace()
        .filter_map(Mechanism::from_name)
        .collect()
}

/// Usernames and their shared secrets.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct UserDatabase {
    users: HashMap<String, String>,
}

impl UserDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON object mapping usernames to secrets.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read user database {:?}", path))?;
        Self::from_json(&raw).with_context(|| format!("Invalid user database {:?}", path))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn with_user(mut self, name: impl Into<String>, secret: impl Into<String>) -> Self {
        self.users.insert(name.into(), secret.into());
        self
    }

    pub fn secret(&self, name: &str) -> Option<&str> {
        self.users.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl fmt::Debug for UserDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDatabase")
            .field("users", &self.users.len())
            .finish()
    }
}

/// Side-channel attributes of one connection: the identity it
/// authenticated as, the identity it should present, and any identity the
/// kernel vouched for.
#[derive(Clone, Default)]
pub struct Attributes {
    /// Preferred mechanism name
    pub method:    Option<String>,
    pub username:  Option<String>,
    pub secret:    Option<String>,
    pub user_id:   Option<u32>,
    pub group_id:  Option<u32>,
    pub pid:       Option<u32>,
    pub container: Option<String>,
}

impl Attributes {
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.secret = Some(secret.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Record a kernel-reported peer identity.
    pub fn set_peer(&mut self, creds: &ClientCredentials) {
        self.user_id = Some(creds.uid);
        self.group_id = Some(creds.gid);
        self.pid = Some(creds.pid);
    }

    pub fn has_peer_identity(&self) -> bool {
        self.user_id.is_some()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes")
            .field("method", &self.method)
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("user_id", &self.user_id)
            .field("group_id", &self.group_id)
            .field("pid", &self.pid)
            .field("container", &self.container)
            .finish()
    }
}

/// A completed exchange, kept on the transport it authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    mechanism: Mechanism,
    username:  String,
}

impl AuthSession {
    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

/// Outcome of feeding one message into an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send this payload to the peer and wait for its answer
    Continue(Vec<u8>),
    /// The exchange is complete
    Done,
}

enum ServerState {
    AwaitingProof {
        user:  String,
        nonce: [u8; NONCE_LEN],
    },
    Verified {
        user: String,
    },
}

/// Server half of an exchange.
pub struct ServerExchange<'a> {
    users:     &'a UserDatabase,
    mechanism: Mechanism,
    state:     ServerState,
}

impl<'a> ServerExchange<'a> {
    /// Begin from the client's start payload, `mechanism\0initial`.
    pub fn start(
        users: &'a UserDatabase,
        offered: &[Mechanism],
        payload: &[u8],
    ) -> Result<(Self, Step), PmError> {
        let (name, initial) = split_nul(payload)
            .ok_or_else(|| PmError::AuthExchange("start payload names no mechanism".into()))?;
        let name = std::str::from_utf8(name)
            .map_err(|_| PmError::AuthExchange("mechanism name is not UTF-8".into()))?;
        let mechanism = Mechanism::from_name(name)
            .filter(|m| offered.contains(m))
            .ok_or_else(|| PmError::AuthExchange(format!("mechanism {name} was not offered")))?;

        match mechanism {
            Mechanism::Plain => {
                let (user, secret) = split_nul(initial)
                    .ok_or_else(|| PmError::AuthExchange("malformed PLAIN response".into()))?;
                let user = utf8(user)?;
                let expected = users
                    .secret(&user)
                    .ok_or_else(|| PmError::AuthExchange(format!("unknown user {user}")))?;
                if !secrets_match(expected, secret)? {
                    return Err(PmError::AuthExchange(format!("bad credentials for {user}")));
                }
                let exchange = Self {
                    users,
                    mechanism,
                    state: ServerState::Verified { user },
                };
                Ok((exchange, Step::Done))
            }
            Mechanism::HmacSha256 => {
                let user = utf8(initial)?;
                if users.secret(&user).is_none() {
                    return Err(PmError::AuthExchange(format!("unknown user {user}")));
                }
                let nonce = *uuid::Uuid::new_v4().as_bytes();
                let exchange = Self {
                    users,
                    mechanism,
                    state: ServerState::AwaitingProof { user, nonce },
                };
                Ok((exchange, Step::Continue(nonce.to_vec())))
            }
        }
    }

    /// Feed the client's next response.
    pub fn step(&mut self, response: &[u8]) -> Result<Step, PmError> {
        let ServerState::AwaitingProof { user, nonce } = &self.state else {
            return Err(PmError::AuthExchange("exchange already complete".into()));
        };
        let secret = self
            .users
            .secret(user)
            .ok_or_else(|| PmError::AuthExchange(format!("unknown user {user}")))?;
        let proof = hex::decode(response)
            .map_err(|_| PmError::AuthExchange("proof is not hex".into()))?;
        let mut mac = keyed(secret)?;
        mac.update(nonce);
        mac.verify_slice(&proof)
            .map_err(|_| PmError::AuthExchange(format!("bad credentials for {user}")))?;
        self.state = ServerState::Verified { user: user.clone() };
        Ok(Step::Done)
    }

    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    /// The authenticated session, once verification succeeded.
    pub fn finish(self) -> Option<AuthSession> {
        match self.state {
            ServerState::Verified { user } => Some(AuthSession {
                mechanism: self.mechanism,
                username:  user,
            }),
            ServerState::AwaitingProof { .. } => None,
        }
    }
}

/// Client half of an exchange.
pub struct ClientExchange {
    mechanism: Mechanism,
    username:  String,
    secret:    String,
}

impl ClientExchange {
    /// Pick a mechanism from the server's offer. The attribute set's
    /// preferred method wins when offered.
    pub fn choose(offer: &[u8], attrs: &Attributes) -> Result<Self, PmError> {
        let offered = decode_mechanisms(offer);
        let preferred = attrs
            .method
            .as_deref()
            .and_then(Mechanism::from_name)
            .filter(|m| offered.contains(m));
        let mechanism = preferred
            .or_else(|| offered.first().copied())
            .ok_or_else(|| {
                PmError::AuthExchange(format!(
                    "no supported mechanism in offer {:?}",
                    String::from_utf8_lossy(offer)
                ))
            })?;
        let username = attrs
            .username
            .clone()
            .ok_or_else(|| PmError::AuthExchange("no username to authenticate as".into()))?;
        let secret = attrs.secret.clone().unwrap_or_default();
        Ok(Self {
            mechanism,
            username,
            secret,
        })
    }

    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    /// Start payload: `mechanism\0initial-response`.
    pub fn initial(&self) -> Vec<u8> {
        let mut out = self.mechanism.name().as_bytes().to_vec();
        out.push(0);
        out.extend_from_slice(self.username.as_bytes());
        if self.mechanism == Mechanism::Plain {
            out.push(0);
            out.extend_from_slice(self.secret.as_bytes());
        }
        out
    }

    /// Answer a server challenge.
    pub fn respond(&self, challenge: &[u8]) -> Result<Vec<u8>, PmError> {
        match self.mechanism {
            Mechanism::HmacSha256 => {
                let mut mac = keyed(&self.secret)?;
                mac.update(challenge);
                Ok(hex::encode(mac.finalize().into_bytes()).into_bytes())
            }
            Mechanism::Plain => Err(PmError::AuthExchange(
                "unexpected challenge for PLAIN".into(),
            )),
        }
    }

    pub fn session(&self) -> AuthSession {
        AuthSession {
            mechanism: self.mechanism,
            username:  self.username.clone(),
        }
    }
}

fn keyed(secret: &str) -> Result<HmacSha256, PmError> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PmError::AuthExchange(e.to_string()))
}

/// Constant-time secret comparison. Both sides are reduced to digests
/// under a throwaway key so the lengths match too.
fn secrets_match(expected: &str, offered: &[u8]) -> Result<bool, PmError> {
    let key = uuid::Uuid::new_v4();
    let digest = |secret: &[u8]| -> Result<HmacSha256, PmError> {
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| PmError::AuthExchange(e.to_string()))?;
        mac.update(secret);
        Ok(mac)
    };
    let expected = digest(expected.as_bytes())?.finalize().into_bytes();
    Ok(digest(offered)?.verify_slice(&expected).is_ok())
}

fn split_nul(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let at = buf.iter().position(|b| *b == 0)?;
    Some((&buf[..at], &buf[at + 1..]))
}

fn utf8(buf: &[u8]) -> Result<String, PmError> {
    String::from_utf8(buf.to_vec())
        .map_err(|_| PmError::AuthExchange("username is not UTF-8".into()))
}
