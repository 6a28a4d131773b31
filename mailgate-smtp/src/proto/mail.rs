//! The MAIL/RCPT/DATA transaction.

use mailgate_common::status::Status;

use super::Effect;
use crate::{
    config::Settings,
    framer::parse_address,
    hooks::{Hooks, Rejection},
    middleware::{CommandContext, DispatchResult},
    reply::Reply,
    session::{Session, SessionPatch},
};

/// Sequencing gates shared by MAIL, RCPT, and DATA. A greeting only opens
/// the session once it succeeded and recorded the advertised hostname.
fn gate(ctx: &CommandContext<'_>, settings: &Settings) -> Option<Reply> {
    if ctx.session.advertised_hostname.is_none() {
        return Some(Reply::new(
            Status::InvalidCommandSequence,
            format!("Error: send {} first", settings.greeting_verb()),
        ));
    }

    if settings.requires_auth() && ctx.session.user.is_none() {
        return Some(Reply::new(
            Status::AuthRequired,
            "Error: authentication required",
        ));
    }

    None
}

pub async fn mail(
    ctx: &CommandContext<'_>,
    settings: &Settings,
    hooks: &dyn Hooks,
) -> DispatchResult {
    if let Some(refused) = gate(ctx, settings) {
        return Ok(vec![Effect::Reply(refused)]);
    }

    if ctx.session.envelope.mail_from.is_some() {
        return Ok(vec![Effect::Reply(Reply::new(
            Status::InvalidCommandSequence,
            "Error: MAIL transaction in progress",
        ))]);
    }

    let Some(sender) = parse_address("MAIL FROM", &ctx.line) else {
        return Ok(vec![Effect::Reply(Reply::new(
            Status::SyntaxError,
            "Error: bad sender address syntax",
        ))]);
    };

    if let Some(declared) = sender.param("SIZE") {
        let Ok(declared) = declared.parse::<u64>() else {
            return Ok(vec![Effect::Reply(Reply::new(
                Status::SyntaxError,
                "Error: bad parameter syntax",
            ))]);
        };

        if let Some(max) = settings.size
            && declared > max
        {
            return Ok(vec![Effect::Reply(Reply::new(
                Status::ExceededStorage,
                format!("Error: message exceeds max message size {max}"),
            ))]);
        }
    }

    // The hook sees the session exactly as it will read if it accepts.
    let mut staged = ctx.session.clone();
    staged.envelope.mail_from = Some(sender.clone());

    match hooks.on_mail_from(&staged).await {
        Ok(()) => Ok(vec![
            Effect::Update(SessionPatch {
                mail_from: Some(sender),
                ..SessionPatch::default()
            }),
            Effect::Reply(Reply::new(Status::Ok, "Accepted")),
        ]),
        Err(Rejection { code, message }) => Ok(vec![Effect::Reply(Reply::new(
            code.unwrap_or(Status::ActionNotTaken),
            message,
        ))]),
    }
}

pub async fn rcpt(
    ctx: &CommandContext<'_>,
    settings: &Settings,
    hooks: &dyn Hooks,
) -> DispatchResult {
    if let Some(refused) = gate(ctx, settings) {
        return Ok(vec![Effect::Reply(refused)]);
    }

    if ctx.session.envelope.mail_from.is_none() {
        return Ok(vec![Effect::Reply(Reply::new(
            Status::InvalidCommandSequence,
            "Error: send MAIL command first",
        ))]);
    }

    let Some(recipient) = parse_address("RCPT TO", &ctx.line) else {
        return Ok(vec![Effect::Reply(Reply::new(
            Status::SyntaxError,
            "Error: bad recipient address syntax",
        ))]);
    };

    let mut staged = ctx.session.clone();
    staged.envelope.rcpt_to.insert(recipient.clone());

    match hooks.on_rcpt_to(&staged).await {
        Ok(()) => Ok(vec![
            Effect::Update(SessionPatch {
                add_recipient: Some(recipient),
                ..SessionPatch::default()
            }),
            Effect::Reply(Reply::new(Status::Ok, "Accepted")),
        ]),
        Err(Rejection { code, message }) => Ok(vec![Effect::Reply(Reply::new(
            code.unwrap_or(Status::ActionNotTaken),
            message,
        ))]),
    }
}

pub fn data(ctx: &CommandContext<'_>, settings: &Settings) -> DispatchResult {
    if let Some(refused) = gate(ctx, settings) {
        return Ok(vec![Effect::Reply(refused)]);
    }

    if ctx.session.envelope.mail_from.is_none() {
        return Ok(vec![Effect::Reply(Reply::new(
            Status::InvalidCommandSequence,
            "Error: send MAIL command first",
        ))]);
    }

    if ctx.session.envelope.rcpt_to.is_empty() {
        return Ok(vec![Effect::Reply(Reply::new(
            Status::InvalidCommandSequence,
            "Error: send RCPT command first",
        ))]);
    }

    Ok(vec![
        Effect::Reply(Reply::new(
            Status::StartMailInput,
            "End data with <CR><LF>.<CR><LF>",
        )),
        Effect::StartBody {
            max_bytes: settings.size.unwrap_or(0),
        },
    ])
}

/// Translate the application's verdict on a finished message into replies:
/// one for SMTP, one per recipient (in RCPT order) for LMTP.
#[must_use]
pub fn data_replies(
    outcome: &Result<Option<String>, Rejection>,
    session: &Session,
    lmtp: bool,
) -> Vec<Reply> {
    let (code, text) = match outcome {
        Ok(custom) => (
            Status::Ok,
            custom.clone().unwrap_or_else(|| "Message accepted".to_string()),
        ),
        Err(Rejection { code, message }) => (
            (*code).unwrap_or(Status::MailboxUnavailable),
            message.clone(),
        ),
    };

    if lmtp {
        session
            .envelope
            .rcpt_to
            .iter()
            .map(|rcpt| Reply::new(code, format!("{}: {text}", rcpt.address)))
            .collect()
    } else {
        vec![Reply::new(code, text)]
    }
}
