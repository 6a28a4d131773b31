//! Per-connection session state.
//!
//! The [`Session`] is the single shared record every protocol module reads.
//! Modules never write it directly: they emit [`SessionPatch`] values and the
//! connection driver applies them, so exclusive write access stays in one
//! place.

use ahash::AHashMap;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::Rng as _;

use crate::framer::Address;

/// Negotiated TLS parameters, recorded after a successful upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsDetails {
    pub protocol: String,
    pub cipher: String,
}

/// The sender plus accumulated recipients of one mail transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub mail_from: Option<Address>,
    pub rcpt_to: RecipientList,
}

/// Insertion-ordered recipient set keyed by (already lowercased) address.
/// Re-adding an address overwrites in place rather than erroring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientList(Vec<Address>);

impl RecipientList {
    /// Insert a recipient, replacing any previous entry for the same
    /// address. Returns the replaced entry, if any.
    pub fn insert(&mut self, rcpt: Address) -> Option<Address> {
        if let Some(existing) = self.0.iter_mut().find(|r| r.address == rcpt.address) {
            return Some(std::mem::replace(existing, rcpt));
        }

        self.0.push(rcpt);
        None
    }

    pub fn remove(&mut self, address: &str) -> Option<Address> {
        let index = self.0.iter().position(|r| r.address == address)?;
        Some(self.0.remove(index))
    }

    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.0.iter().any(|r| r.address == address)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.0.iter()
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    /// Random identifier carried through every log line for this connection.
    pub id: String,
    pub local_address: String,
    pub local_port: u16,
    pub remote_address: String,
    pub remote_port: u16,
    pub secure: bool,
    pub tls: Option<TlsDetails>,
    /// Hostname from the PTR lookup, or the bracketed address literal.
    pub resolved_hostname: String,
    /// Hostname the client announced in its greeting.
    pub advertised_hostname: Option<String>,
    /// The greeting verb the client used (HELO/EHLO/LHLO).
    pub client_greeting: Option<String>,
    pub user: Option<String>,
    pub xclient: AHashMap<String, String>,
    pub xforward: AHashMap<String, String>,
    pub envelope: Envelope,
    /// Monotonic transaction counter, bumped on every reset.
    pub transaction: u64,
    /// Text of the most recent reply with code >= 400.
    pub last_error: Option<String>,
}

impl Session {
    #[must_use]
    pub fn new(
        local_address: String,
        local_port: u16,
        remote_address: String,
        remote_port: u16,
    ) -> Self {
        let resolved_hostname = format!("[{remote_address}]");

        Self {
            id: sid(),
            local_address,
            local_port,
            remote_address,
            remote_port,
            secure: false,
            tls: None,
            resolved_hostname,
            advertised_hostname: None,
            client_greeting: None,
            user: None,
            xclient: AHashMap::new(),
            xforward: AHashMap::new(),
            envelope: Envelope::default(),
            transaction: 0,
            last_error: None,
        }
    }

    /// Start a fresh transaction: new envelope, bumped counter.
    /// Authentication, TLS state, and extension parameters survive.
    pub fn reset(&mut self) {
        self.envelope = Envelope::default();
        self.transaction += 1;
    }

    pub fn apply(&mut self, patch: SessionPatch) {
        if let Some(address) = patch.remote_address {
            self.remote_address = address;
        }
        if let Some(port) = patch.remote_port {
            self.remote_port = port;
        }
        if let Some(hostname) = patch.resolved_hostname {
            self.resolved_hostname = hostname;
        }
        if let Some(hostname) = patch.advertised_hostname {
            self.advertised_hostname = hostname;
        }
        if let Some(greeting) = patch.client_greeting {
            self.client_greeting = Some(greeting);
        }
        if let Some(user) = patch.user {
            self.user = Some(user);
        }
        if let Some(mail_from) = patch.mail_from {
            self.envelope.mail_from = Some(mail_from);
        }
        if let Some(rcpt) = patch.add_recipient {
            self.envelope.rcpt_to.insert(rcpt);
        }
        for (key, value) in patch.xclient {
            self.xclient.insert(key, value);
        }
        for (key, value) in patch.xforward {
            self.xforward.insert(key, value);
        }
    }
}

/// A batch of session updates emitted by a protocol module.
///
/// Scalar fields overwrite when set; the extension-parameter maps merge
/// key-by-key so values accumulate across repeated XCLIENT/XFORWARD
/// commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub remote_address: Option<String>,
    pub remote_port: Option<u16>,
    pub resolved_hostname: Option<String>,
    /// `Some(None)` clears a previously advertised hostname.
    pub advertised_hostname: Option<Option<String>>,
    pub client_greeting: Option<String>,
    pub user: Option<String>,
    pub mail_from: Option<Address>,
    pub add_recipient: Option<Address>,
    pub xclient: Vec<(String, String)>,
    pub xforward: Vec<(String, String)>,
}

/// Random session identifier: ten bytes, base64.
fn sid() -> String {
    let bytes: [u8; 10] = rand::rng().random();
    STANDARD.encode(bytes)
}
