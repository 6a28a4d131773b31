//! XFORWARD: upstream-hop attributes recorded for logging and policy,
//! never replacing the connection's own identity.

use mailgate_common::status::Status;
use phf::phf_set;

use super::Effect;
use crate::{
    framer::decode_xtext,
    middleware::{CommandContext, DispatchResult},
    reply::Reply,
    session::SessionPatch,
};

static PARAMS: phf::Set<&'static str> = phf_set! {
    "NAME", "ADDR", "PORT", "PROTO", "HELO", "IDENT", "SOURCE",
};

fn is_sentinel(value: &str) -> bool {
    value.eq_ignore_ascii_case("[UNAVAILABLE]") || value.eq_ignore_ascii_case("[TEMPUNAVAIL]")
}

pub fn command(ctx: &CommandContext<'_>) -> DispatchResult {
    // Once XCLIENT has swapped the identity the proxy stage is over.
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
        return Ok(refuse(Status::SyntaxError, "Error: bad command syntax"));
    }

    let mut patch = SessionPatch::default();
    let mut seen: Vec<String> = Vec::with_capacity(args.len());

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

        // Values arrive xtext-encoded; sentinels are stored verbatim.
        let value = if is_sentinel(value) {
            value.to_ascii_uppercase()
        } else {
            decode_xtext(value)
        };

        patch.xforward.push((key, value));
    }

    Ok(vec![
        Effect::Update(patch),
        Effect::Reply(Reply::new(Status::ServiceReady, "OK")),
    ])
}

fn refuse(code: Status, message: &str) -> Vec<Effect> {
    vec![Effect::Reply(Reply::new(code, message))]
}
