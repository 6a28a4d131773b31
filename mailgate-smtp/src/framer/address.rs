//! Address-literal parsing for MAIL FROM / RCPT TO style commands.

use ahash::AHashMap;

/// A parsed mailbox with its ESMTP parameters. Produced only by
/// [`parse_address`] and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Normalized mailbox: lowercased, domain decoded from ACE to Unicode.
    pub address: String,
    /// Uppercased parameter name to value; `None` marks a bare flag.
    pub params: AHashMap<String, Option<String>>,
}

impl Address {
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|value| value.as_deref())
    }
}

/// Validate and split a `VERB:<mailbox> [PARAM=VALUE ...]` line.
///
/// Returns `None` when the verb does not match case-insensitively, the
/// mailbox is absent, or the angle-bracketed address fails RFC 5321 syntax.
/// Domain decoding failure is not an error; the raw domain is kept.
#[must_use]
pub fn parse_address(verb: &str, line: &str) -> Option<Address> {
    let (command, rest) = line.split_once(':')?;

    if !command.trim().eq_ignore_ascii_case(verb.trim()) {
        return None;
    }

    let mut tokens = rest.trim().split_whitespace();
    let mailbox = tokens.next()?;

    let inner = mailbox.strip_prefix('<')?.strip_suffix('>')?;
    if !is_valid_mailbox(inner) {
        return None;
    }

    let lowered = inner.to_lowercase();
    let (local, domain) = lowered.rsplit_once('@')?;
    let address = format!("{local}@{}", decode_domain(domain));

    let mut params = AHashMap::new();
    for token in tokens {
        match token.split_once('=') {
            Some((key, value)) if !value.is_empty() => {
                params.insert(key.to_ascii_uppercase(), Some(decode_xtext(value)));
            }
            Some((key, _)) => {
                params.insert(key.to_ascii_uppercase(), None);
            }
            None => {
                params.insert(token.to_ascii_uppercase(), None);
            }
        }
    }

    Some(Address { address, params })
}

/// Characters permitted in an unquoted local part or a domain label.
fn plain_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '<' | '>' | '(' | ')' | '[' | ']' | '.' | ',' | ';' | ':' | '@' | '"')
}

fn is_valid_mailbox(mailbox: &str) -> bool {
    let Some((local, domain)) = mailbox.rsplit_once('@') else {
        return false;
    };

    is_valid_local(local) && is_valid_domain(domain)
}

fn is_valid_local(local: &str) -> bool {
    if local.len() > 2 && local.starts_with('"') && local.ends_with('"') {
        return true;
    }

    !local.is_empty()
        && local
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(plain_char))
}

fn is_valid_domain(domain: &str) -> bool {
    let labels: Vec<&str> = domain.split('.').collect();

    labels.len() >= 2
        && labels
            .iter()
            .all(|label| !label.is_empty() && label.chars().all(plain_char))
        && labels.last().is_some_and(|tld| tld.chars().count() >= 2)
}

/// Best-effort ACE to Unicode decoding: on failure the raw domain wins.
fn decode_domain(domain: &str) -> String {
    let (unicode, result) = idna::domain_to_unicode(domain);

    if result.is_ok() {
        unicode
    } else {
        domain.to_string()
    }
}

/// Decode xtext `+XX` escapes (hex digits matched case-insensitively).
#[must_use]
pub fn decode_xtext(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'+' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push(u8::try_from(hi * 16 + lo).unwrap_or(0));
                i += 3;
                continue;
            }
        }

        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{decode_xtext, parse_address};

    #[test]
    fn plain_mailbox_without_params() {
        let parsed = parse_address("MAIL FROM", "MAIL FROM:<a@b.com>").unwrap();
        assert_eq!(parsed.address, "a@b.com");
        assert!(parsed.params.is_empty());
    }

    #[test]
    fn mailbox_with_size_param() {
        let parsed = parse_address("MAIL FROM", "MAIL FROM:<a@b.com> SIZE=10").unwrap();
        assert_eq!(parsed.address, "a@b.com");
        assert_eq!(parsed.param("SIZE"), Some("10"));
    }

    #[test]
    fn bare_param_becomes_a_flag() {
        let parsed = parse_address("MAIL FROM", "MAIL FROM:<a@b.com> BODY=8BITMIME SMTPUTF8")
            .unwrap();
        assert_eq!(parsed.param("BODY"), Some("8BITMIME"));
        assert_eq!(parsed.params.get("SMTPUTF8"), Some(&None));
    }

    #[test]
    fn verb_must_match_case_insensitively() {
        assert!(parse_address("RCPT TO", "rcpt to:<a@b.com>").is_some());
        assert!(parse_address("MAIL FROM", "RCPT TO:<a@b.com>").is_none());
    }

    #[test]
    fn address_is_lowercased() {
        let parsed = parse_address("RCPT TO", "RCPT TO:<Mixed.Case@Example.COM>").unwrap();
        assert_eq!(parsed.address, "mixed.case@example.com");
    }

    #[test]
    fn ace_domain_decodes_to_unicode() {
        let parsed = parse_address("RCPT TO", "RCPT TO:<user@xn--bcher-kva.example>").unwrap();
        assert_eq!(parsed.address, "user@bücher.example");
    }

    #[test]
    fn malformed_mailboxes_are_rejected() {
        for line in [
            "MAIL FROM:",
            "MAIL FROM:<>",
            "MAIL FROM:<no-at-sign>",
            "MAIL FROM:<a@nodot>",
            "MAIL FROM:<a@b.c>",
            "MAIL FROM:a@b.com",
            "MAIL FROM:<a b@c.com>",
        ] {
            assert!(parse_address("MAIL FROM", line).is_none(), "{line}");
        }
    }

    #[test]
    fn quoted_local_part_is_accepted() {
        let parsed = parse_address("RCPT TO", "RCPT TO:<\"odd one\"@example.com>").unwrap();
        assert_eq!(parsed.address, "\"odd one\"@example.com");
    }

    #[test]
    fn param_values_are_xtext_decoded() {
        let parsed =
            parse_address("MAIL FROM", "MAIL FROM:<a@b.com> NOTE=hi+20there+2Bok").unwrap();
        assert_eq!(parsed.param("NOTE"), Some("hi there+ok"));
    }

    #[test]
    fn xtext_decoding_accepts_lowercase_hex() {
        assert_eq!(decode_xtext("a+2bb"), "a+b");
        assert_eq!(decode_xtext("a+2Bb"), "a+b");
        assert_eq!(decode_xtext("trailing+"), "trailing+");
        assert_eq!(decode_xtext("+zz"), "+zz");
    }
}
