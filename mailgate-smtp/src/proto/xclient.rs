//! XCLIENT: a trusted proxy replacing the connection's observed identity
//! with that of the original client.

use std::net::IpAddr;

use mailgate_common::status::Status;
use phf::phf_set;

use super::{Effect, handshake};
use crate::{
    config::Settings,
    framer::decode_xtext,
    hooks::{Credentials, Hooks, Rejection},
    middleware::{CommandContext, DispatchResult},
    reply::Reply,
    session::SessionPatch,
};

static PARAMS: phf::Set<&'static str> = phf_set! {
    "NAME", "ADDR", "PORT", "PROTO", "HELO", "LOGIN",
};

/// Values a proxy sends when it has nothing better.
fn is_sentinel(value: &str) -> bool {
    value.eq_ignore_ascii_case("[UNAVAILABLE]") || value.eq_ignore_ascii_case("[TEMPUNAVAIL]")
}

pub async fn command(
    ctx: &CommandContext<'_>,
    settings: &Settings,
    hooks: &dyn Hooks,
) -> DispatchResult {
    // One identity swap per connection.
    if ctx.session.xclient.contains_key("ADDR") {
        return Ok(refuse(Status::ActionNotTaken, "Error: not allowed"));
    }

    if ctx.session.envelope.mail_from.is_some() {
        return Ok(refuse(
            Status::InvalidCommandSequence,
            "Error: MAIL transaction in progress",
        ));
    }

    let args: Vec<&str> = ctx.line.split_whitespace().skip(1).collect();
    if args.is_empty() {
        return Ok(refuse(Status::SyntaxError, "Error: bad parameter syntax"));
    }

    let mut patch = SessionPatch::default();
    let mut seen: Vec<String> = Vec::with_capacity(args.len());
    let mut name: Option<String> = None;
    let mut addr: Option<String> = None;
    let mut login: Option<String> = None;

    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            return Ok(refuse(Status::SyntaxError, "Error: bad parameter syntax"));
        };

        let key = key.to_ascii_uppercase();
        if !PARAMS.contains(key.as_str()) || value.is_empty() {
            return Ok(refuse(Status::SyntaxError, "Error: bad parameter syntax"));
        }

        if seen.contains(&key) {
            return Ok(refuse(Status::SyntaxError, "Error: duplicate parameter"));
        }
        seen.push(key.clone());

        if is_sentinel(value) {
            patch
                .xclient
                .push((key, value.to_ascii_uppercase()));
            continue;
        }

        // Values arrive xtext-encoded.
        let value = decode_xtext(value);

        match key.as_str() {
            "ADDR" => {
                let literal = strip_ipv6_prefix(&value);
                let Ok(parsed) = literal.parse::<IpAddr>() else {
                    return Ok(refuse(Status::SyntaxError, "Error: invalid address"));
                };

                let canonical = parsed.to_string();
                patch.remote_address = Some(canonical.clone());
                patch.xclient.push((key, canonical.clone()));
                addr = Some(canonical);
            }
            "PORT" => {
                let Ok(port) = value.parse::<u16>() else {
                    return Ok(refuse(Status::SyntaxError, "Error: bad parameter syntax"));
                };

                patch.remote_port = Some(port);
                patch.xclient.push((key, value));
            }
            "NAME" => {
                let hostname = value.to_ascii_lowercase();
                name = Some(hostname.clone());
                patch.xclient.push((key, hostname));
            }
            "LOGIN" => {
                login = Some(value.clone());
                patch.xclient.push((key, value));
            }
            _ => {
                // PROTO and HELO are informational.
                patch.xclient.push((key, value));
            }
        }
    }

    // A new client address invalidates everything derived from the old
    // one; NAME supplies the replacement hostname when the proxy has it.
    match (&addr, &name) {
        (_, Some(name)) => patch.resolved_hostname = Some(name.clone()),
        (Some(addr), None) => patch.resolved_hostname = Some(format!("[{addr}]")),
        (None, None) => {}
    }

    if addr.is_some() {
        patch.advertised_hostname = Some(None);
    }

    if let Some(username) = login {
        let mut staged = ctx.session.clone();
        staged.apply(patch.clone());

        match hooks.on_auth(Credentials::XClient { username }, &staged).await {
            Ok(user) => patch.user = Some(user),
            Err(Rejection { message, .. }) => {
                return Ok(vec![
                    Effect::Reply(Reply::new(Status::ActionNotTaken, message)),
                    Effect::Close,
                ]);
            }
        }
    }

    Ok(vec![
        Effect::Update(patch),
        Effect::Reply(handshake::banner(settings)),
    ])
}

fn strip_ipv6_prefix(value: &str) -> &str {
    if value.len() >= 5 && value[..5].eq_ignore_ascii_case("IPV6:") {
        &value[5..]
    } else {
        value
    }
}

fn refuse(code: Status, message: &str) -> Vec<Effect> {
    vec![Effect::Reply(Reply::new(code, message))]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::command;
    use crate::{
        config::Settings,
        hooks::AcceptAll,
        middleware::CommandContext,
        proto::Effect,
        session::Session,
    };

    fn settings() -> Settings {
        Settings {
            name: "mail.example.com".to_string(),
            use_xclient: true,
            ..Settings::default()
        }
    }

    fn session() -> Session {
        Session::new("127.0.0.1".into(), 25, "192.0.2.7".into(), 54321)
    }

    fn context<'s>(line: &str, session: &'s Session) -> CommandContext<'s> {
        CommandContext {
            verb: "XCLIENT".to_string(),
            line: line.to_string(),
            session,
        }
    }

    fn replies(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Reply(reply) => Some(reply.to_string()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn addr_swaps_the_remote_identity() {
        let session = session();
        let effects = command(
            &context("XCLIENT ADDR=198.51.100.1 PORT=2525", &session),
            &settings(),
            &AcceptAll,
        )
        .await
        .unwrap();

        assert_eq!(replies(&effects), vec!["220 mail.example.com ESMTP"]);

        let Effect::Update(patch) = &effects[0] else {
            panic!("expected an update first");
        };
        assert_eq!(patch.remote_address.as_deref(), Some("198.51.100.1"));
        assert_eq!(patch.remote_port, Some(2525));
        assert_eq!(patch.resolved_hostname.as_deref(), Some("[198.51.100.1]"));
        assert_eq!(patch.advertised_hostname, Some(None));
        assert!(!effects.contains(&Effect::Reset));
    }

    #[tokio::test]
    async fn values_are_decoded_and_name_is_lowercased() {
        let session = session();
        let effects = command(
            &context("XCLIENT NAME=Client.EXAMPLE HELO=helo+20name", &session),
            &settings(),
            &AcceptAll,
        )
        .await
        .unwrap();

        let Effect::Update(patch) = &effects[0] else {
            panic!("expected an update first");
        };
        assert!(patch.xclient.contains(&("NAME".to_string(), "client.example".to_string())));
        assert!(patch.xclient.contains(&("HELO".to_string(), "helo name".to_string())));
        assert_eq!(patch.resolved_hostname.as_deref(), Some("client.example"));
    }

    #[tokio::test]
    async fn ipv6_prefix_is_stripped_and_canonicalized() {
        let session = session();
        let effects = command(
            &context("XCLIENT ADDR=IPV6:2001:db8:0:0:0:0:0:1", &session),
            &settings(),
            &AcceptAll,
        )
        .await
        .unwrap();

        let Effect::Update(patch) = &effects[0] else {
            panic!("expected an update first");
        };
        assert_eq!(patch.remote_address.as_deref(), Some("2001:db8::1"));
    }

    #[tokio::test]
    async fn name_wins_over_the_synthesized_literal() {
        let session = session();
        let effects = command(
            &context("XCLIENT NAME=client.example ADDR=198.51.100.1", &session),
            &settings(),
            &AcceptAll,
        )
        .await
        .unwrap();

        let Effect::Update(patch) = &effects[0] else {
            panic!("expected an update first");
        };
        assert_eq!(patch.resolved_hostname.as_deref(), Some("client.example"));
    }

    #[tokio::test]
    async fn sentinels_are_stored_verbatim_without_derivation() {
        let session = session();
        let effects = command(
            &context("XCLIENT NAME=[UNAVAILABLE] ADDR=[TEMPUNAVAIL]", &session),
            &settings(),
            &AcceptAll,
        )
        .await
        .unwrap();

        let Effect::Update(patch) = &effects[0] else {
            panic!("expected an update first");
        };
        assert_eq!(patch.remote_address, None);
        assert_eq!(patch.resolved_hostname, None);
        assert!(patch.xclient.contains(&("NAME".to_string(), "[UNAVAILABLE]".to_string())));
    }

    #[tokio::test]
    async fn malformed_parameters_are_refused() {
        let session = session();

        for (line, expected) in [
            ("XCLIENT", "501 Error: bad parameter syntax"),
            ("XCLIENT BOGUS=1", "501 Error: bad parameter syntax"),
            ("XCLIENT ADDR", "501 Error: bad parameter syntax"),
            ("XCLIENT ADDR=1.2.3.4 ADDR=1.2.3.4", "501 Error: duplicate parameter"),
            ("XCLIENT ADDR=not-an-ip", "501 Error: invalid address"),
            ("XCLIENT PORT=99999", "501 Error: bad parameter syntax"),
        ] {
            let effects = command(&context(line, &session), &settings(), &AcceptAll)
                .await
                .unwrap();
            assert_eq!(replies(&effects), vec![expected], "{line}");
        }
    }

    #[tokio::test]
    async fn second_xclient_is_not_allowed() {
        let mut session = session();
        session
            .xclient
            .insert("ADDR".to_string(), "198.51.100.1".to_string());

        let effects = command(
            &context("XCLIENT ADDR=198.51.100.2", &session),
            &settings(),
            &AcceptAll,
        )
        .await
        .unwrap();

        assert_eq!(replies(&effects), vec!["550 Error: not allowed"]);
    }

    #[tokio::test]
    async fn login_failure_closes_the_connection() {
        let session = session();
        let effects = command(
            &context("XCLIENT LOGIN=tim", &session),
            &settings(),
            // AcceptAll's on_auth refuses every credential.
            &AcceptAll,
        )
        .await
        .unwrap();

        assert_eq!(replies(&effects), vec!["550 Not implemented"]);
        assert!(effects.contains(&Effect::Close));
    }
}
