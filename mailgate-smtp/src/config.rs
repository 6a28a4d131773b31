//! Server configuration.

use std::{path::PathBuf, time::Duration};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Certificate and key paths for one TLS identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// Timeouts applied to a running session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Idle time allowed between reads before the session is told 421.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::idle_secs")]
    pub idle_secs: u64,

    /// Time allowed for a STARTTLS handshake to complete.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::tls_upgrade_secs")]
    pub tls_upgrade_secs: u64,

    /// Grace period between stopping the accept loop and force-closing
    /// remaining sessions.
    ///
    /// Default: 10 seconds
    #[serde(default = "defaults::close_grace_secs")]
    pub close_grace_secs: u64,

    /// Budget for the reverse DNS lookup performed at connection time.
    ///
    /// Default: 1500 milliseconds
    #[serde(default = "defaults::reverse_dns_millis")]
    pub reverse_dns_millis: u64,
}

impl Timeouts {
    #[must_use]
    pub const fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    #[must_use]
    pub const fn tls_upgrade(&self) -> Duration {
        Duration::from_secs(self.tls_upgrade_secs)
    }

    #[must_use]
    pub const fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }

    #[must_use]
    pub const fn reverse_dns(&self) -> Duration {
        Duration::from_millis(self.reverse_dns_millis)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            idle_secs: defaults::idle_secs(),
            tls_upgrade_secs: defaults::tls_upgrade_secs(),
            close_grace_secs: defaults::close_grace_secs(),
            reverse_dns_millis: defaults::reverse_dns_millis(),
        }
    }
}

/// Behavioural settings shared by every session the server spawns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Hostname announced in the greeting, EHLO response, and CRAM-MD5
    /// challenges.
    #[serde(default = "defaults::name")]
    pub name: String,

    /// Extra text appended to the 220 greeting.
    #[serde(default)]
    pub banner: Option<String>,

    /// LMTP mode: LHLO replaces HELO/EHLO and DATA answers per recipient.
    #[serde(default)]
    pub lmtp: bool,

    /// Maximum message size advertised via SIZE and enforced on MAIL
    /// parameters. `None` leaves the size unlimited.
    #[serde(default)]
    pub size: Option<u64>,

    /// Additional AUTH mechanisms to offer; LOGIN and PLAIN are always
    /// included.
    #[serde(default)]
    pub auth_methods: Vec<String>,

    /// Allow MAIL without prior authentication.
    #[serde(default)]
    pub auth_optional: bool,

    /// Allow AUTH over a plaintext channel.
    #[serde(default)]
    pub allow_insecure_auth: bool,

    /// Accept XCLIENT from trusted proxies.
    #[serde(default)]
    pub use_xclient: bool,

    /// Accept XFORWARD from trusted proxies.
    #[serde(default)]
    pub use_xforward: bool,

    /// Expect a PROXY protocol v1 preamble on every socket.
    #[serde(default)]
    pub use_proxy: bool,

    /// Command verbs that dispatch should treat as unknown.
    #[serde(default)]
    pub disabled_commands: Vec<String>,

    /// Skip the PTR lookup and always use the bracketed address literal.
    #[serde(default)]
    pub disable_reverse_lookup: bool,

    /// Implicit TLS: upgrade the socket before the greeting.
    #[serde(default)]
    pub secure: bool,

    /// Default TLS identity, used for STARTTLS and implicit TLS.
    #[serde(default)]
    pub tls: Option<TlsContext>,

    /// Per-servername TLS identities consulted via SNI, falling back to
    /// [`Self::tls`].
    #[serde(default)]
    pub sni: AHashMap<String, TlsContext>,

    #[serde(default)]
    pub timeouts: Timeouts,
}

impl Settings {
    /// The AUTH mechanisms offered to clients, uppercased, in configured
    /// order, with LOGIN and PLAIN always appended.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<String> {
        let mut mechanisms: Vec<String> = Vec::with_capacity(self.auth_methods.len() + 2);

        for method in self
            .auth_methods
            .iter()
            .map(|m| m.trim().to_ascii_uppercase())
            .chain(["LOGIN".to_string(), "PLAIN".to_string()])
            .filter(|m| !m.is_empty())
        {
            if !mechanisms.contains(&method) {
                mechanisms.push(method);
            }
        }

        mechanisms
    }

    #[must_use]
    pub fn is_disabled(&self, verb: &str) -> bool {
        self.disabled_commands
            .iter()
            .any(|command| command.trim().eq_ignore_ascii_case(verb))
    }

    #[must_use]
    pub const fn protocol(&self) -> &'static str {
        if self.lmtp { "LMTP" } else { "ESMTP" }
    }

    /// The greeting verb(s) named in sequencing errors.
    #[must_use]
    pub const fn greeting_verb(&self) -> &'static str {
        if self.lmtp { "LHLO" } else { "HELO/EHLO" }
    }

    /// Whether MAIL requires a prior successful AUTH.
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        !self.auth_optional && !self.is_disabled("AUTH")
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name: defaults::name(),
            banner: None,
            lmtp: false,
            size: None,
            auth_methods: Vec::new(),
            auth_optional: false,
            allow_insecure_auth: false,
            use_xclient: false,
            use_xforward: false,
            use_proxy: false,
            disabled_commands: Vec::new(),
            disable_reverse_lookup: false,
            secure: false,
            tls: None,
            sni: AHashMap::new(),
            timeouts: Timeouts::default(),
        }
    }
}

mod defaults {
    pub fn name() -> String {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
    }

    pub const fn idle_secs() -> u64 {
        30
    }

    pub const fn tls_upgrade_secs() -> u64 {
        30
    }

    pub const fn close_grace_secs() -> u64 {
        10
    }

    pub const fn reverse_dns_millis() -> u64 {
        1500
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_defaults() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.idle(), Duration::from_secs(30));
        assert_eq!(timeouts.tls_upgrade(), Duration::from_secs(30));
        assert_eq!(timeouts.close_grace(), Duration::from_secs(10));
        assert_eq!(timeouts.reverse_dns(), Duration::from_millis(1500));
    }

    #[test]
    fn auth_mechanisms_always_include_login_and_plain() {
        let settings = Settings::default();
        assert_eq!(settings.auth_mechanisms(), vec!["LOGIN", "PLAIN"]);

        let settings = Settings {
            auth_methods: vec!["cram-md5".to_string(), "PLAIN".to_string()],
            ..Settings::default()
        };
        assert_eq!(settings.auth_mechanisms(), vec!["CRAM-MD5", "PLAIN", "LOGIN"]);
    }

    #[test]
    fn disabled_commands_match_case_insensitively() {
        let settings = Settings {
            disabled_commands: vec!["starttls".to_string()],
            ..Settings::default()
        };

        assert!(settings.is_disabled("STARTTLS"));
        assert!(!settings.is_disabled("AUTH"));
    }

    #[test]
    fn auth_requirement_follows_options() {
        assert!(Settings::default().requires_auth());
        assert!(
            !Settings {
                auth_optional: true,
                ..Settings::default()
            }
            .requires_auth()
        );
        assert!(
            !Settings {
                disabled_commands: vec!["AUTH".to_string()],
                ..Settings::default()
            }
            .requires_auth()
        );
    }
}
