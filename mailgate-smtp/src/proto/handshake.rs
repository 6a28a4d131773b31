//! Session-establishment commands: greetings, STARTTLS, and the small
//! always-available verbs.

use mailgate_common::status::Status;

use super::Effect;
use crate::{
    config::Settings,
    middleware::{CommandContext, DispatchResult},
    reply::Reply,
    session::{Session, SessionPatch},
};

/// The 220 banner sent when the session opens and again after XCLIENT.
#[must_use]
pub fn banner(settings: &Settings) -> Reply {
    let suffix = settings
        .banner
        .as_deref()
        .map(|text| format!(" {text}"))
        .unwrap_or_default();

    Reply::new(
        Status::ServiceReady,
        format!("{} {}{suffix}", settings.name, settings.protocol()),
    )
}

/// HELO, EHLO, and (in LMTP mode) LHLO.
pub fn greeting(ctx: &CommandContext<'_>, settings: &Settings) -> DispatchResult {
    let verb = ctx.verb.clone();
    let mut args = ctx.line.split_whitespace().skip(1);
    let hostname = args.next().map(str::to_ascii_lowercase);

    // The greeting verb is recorded even when the reply is an error, so
    // later sequencing messages can name what the client actually sent.
    let mut effects = vec![Effect::Update(SessionPatch {
        client_greeting: Some(verb.clone()),
        ..SessionPatch::default()
    })];

    if settings.lmtp && verb != "LHLO" {
        effects.push(Effect::Reply(Reply::new(
            Status::CommandUnrecognized,
            format!("Error: {verb} not allowed in LMTP server"),
        )));
        return Ok(effects);
    }

    // Exactly one hostname argument.
    let (Some(hostname), None) = (hostname, args.next()) else {
        effects.push(Effect::Reply(Reply::new(
            Status::SyntaxError,
            format!("Error: Syntax: {verb} hostname"),
        )));
        return Ok(effects);
    };

    effects.push(Effect::Update(SessionPatch {
        advertised_hostname: Some(Some(hostname)),
        ..SessionPatch::default()
    }));
    effects.push(Effect::Reset);

    let welcome = format!(
        "{} Welcome, {}",
        settings.name, ctx.session.resolved_hostname
    );

    if verb == "HELO" {
        effects.push(Effect::Reply(Reply::new(Status::Ok, welcome)));
    } else {
        effects.push(Effect::Reply(Reply::multi(
            Status::Ok,
            extended_greeting(welcome, ctx.session, settings),
        )));
    }

    Ok(effects)
}

/// The EHLO/LHLO feature list, gated on session state.
fn extended_greeting(welcome: String, session: &Session, settings: &Settings) -> Vec<String> {
    let mut lines = vec![
        welcome,
        "PIPELINING".to_string(),
        "8BITMIME".to_string(),
        "SMTPUTF8".to_string(),
    ];

    if session.user.is_none() && !settings.is_disabled("AUTH") {
        let mechanisms = settings.auth_mechanisms();
        if !mechanisms.is_empty() {
            lines.push(format!("AUTH {}", mechanisms.join(" ")));
        }
    }

    if !session.secure && !settings.is_disabled("STARTTLS") && settings.tls.is_some() {
        lines.push("STARTTLS".to_string());
    }

    if let Some(size) = settings.size {
        lines.push(format!("SIZE {size}"));
    }

    // Proxy extensions disappear once an XCLIENT ADDR has been consumed.
    let proxied = session.xclient.contains_key("ADDR");

    if settings.use_xclient && !proxied && !settings.is_disabled("XCLIENT") {
        lines.push("XCLIENT NAME ADDR PORT PROTO HELO LOGIN".to_string());
    }

    if settings.use_xforward && !proxied && !settings.is_disabled("XFORWARD") {
        lines.push("XFORWARD NAME ADDR PORT PROTO HELO IDENT SOURCE".to_string());
    }

    lines
}

#[must_use]
pub fn quit() -> Vec<Effect> {
    vec![
        Effect::Reply(Reply::new(Status::GoodBye, "Goodbye")),
        Effect::Close,
    ]
}

#[must_use]
pub fn noop() -> Vec<Effect> {
    vec![Effect::Reply(Reply::new(Status::Ok, "OK"))]
}

#[must_use]
pub fn rset() -> Vec<Effect> {
    vec![
        Effect::Reset,
        Effect::Reply(Reply::new(Status::Ok, "Reset")),
    ]
}

#[must_use]
pub fn help() -> Vec<Effect> {
    vec![Effect::Reply(Reply::new(
        Status::HelpMessage,
        "See https://tools.ietf.org/html/rfc5321 for details",
    ))]
}

#[must_use]
pub fn vrfy() -> Vec<Effect> {
    vec![Effect::Reply(Reply::new(
        Status::CannotVerify,
        "Try to send something. No promises though",
    ))]
}

pub fn starttls(ctx: &CommandContext<'_>, settings: &Settings) -> DispatchResult {
    if ctx.session.secure {
        return Ok(vec![Effect::Reply(Reply::new(
            Status::InvalidCommandSequence,
            "Error: TLS already active",
        ))]);
    }

    if settings.tls.is_none() {
        return Ok(vec![Effect::Reply(Reply::new(
            Status::AuthTemporaryFailure,
            "Error: TLS not available",
        ))]);
    }

    Ok(vec![
        Effect::Reply(Reply::new(Status::ServiceReady, "Ready to start TLS")),
        Effect::Upgrade,
    ])
}
