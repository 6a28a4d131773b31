//! SASL authentication: PLAIN, LOGIN, XOAUTH2, and CRAM-MD5.
//!
//! Challenge/response mechanisms park a [`Continuation`] on the module;
//! the dispatcher hands it the next client line before any verb routing,
//! so a continuation line that happens to start with a verb is never
//! misread as a command.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use mailgate_common::status::Status;
use rand::Rng as _;

use super::Effect;
use crate::{
    config::Settings,
    hooks::{CramMd5Verifier, Credentials, Hooks, Rejection},
    middleware::{CommandContext, DispatchResult},
    reply::Reply,
    session::SessionPatch,
};

const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

/// What the next client line completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    PlainToken,
    LoginUsername,
    LoginPassword { username: String },
    XOAuth2Token,
    CramMd5Response { challenge: String },
}

#[derive(Debug, Default)]
pub struct Auth {
    pending: Option<Continuation>,
}

impl Auth {
    pub fn take_pending(&mut self) -> Option<Continuation> {
        self.pending.take()
    }

    pub async fn command(
        &mut self,
        ctx: &CommandContext<'_>,
        settings: &Settings,
        hooks: &dyn Hooks,
    ) -> DispatchResult {
        if ctx.session.advertised_hostname.is_none() {
            return Ok(reply(
                Status::InvalidCommandSequence,
                format!("Error: send {} first", settings.greeting_verb()),
            ));
        }

        if ctx.session.user.is_some() {
            return Ok(reply(
                Status::InvalidCommandSequence,
                "Error: already authenticated",
            ));
        }

        if !ctx.session.secure
            && !settings.allow_insecure_auth
            && !settings.is_disabled("STARTTLS")
        {
            return Ok(reply(
                Status::EncryptionRequired,
                "Error: send STARTTLS first",
            ));
        }

        let mut words = ctx.line.split_whitespace().skip(1);
        let mechanism = words.next().unwrap_or_default().to_ascii_uppercase();
        let initial = words.next();

        if !settings.auth_mechanisms().contains(&mechanism) {
            return Ok(reply(
                Status::ParameterUnrecognized,
                "Error: unrecognized authentication type",
            ));
        }

        match mechanism.as_str() {
            "PLAIN" => match initial {
                Some(token) => plain(token, ctx, hooks).await,
                None => Ok(self.challenge(Continuation::PlainToken, Reply::bare(334))),
            },
            "LOGIN" => match initial {
                Some(token) => match decode(token) {
                    Some(username) if !username.is_empty() => Ok(self.challenge(
                        Continuation::LoginPassword { username },
                        Reply::new(Status::AuthContinue, PASSWORD_PROMPT),
                    )),
                    Some(_) => Ok(reply(Status::SyntaxError, "Error: username missing")),
                    None => Ok(invalid_encoding()),
                },
                None => Ok(self.challenge(
                    Continuation::LoginUsername,
                    Reply::new(Status::AuthContinue, USERNAME_PROMPT),
                )),
            },
            "XOAUTH2" => match initial {
                Some(token) => xoauth2(token, ctx, hooks).await,
                None => Ok(self.challenge(Continuation::XOAuth2Token, Reply::bare(334))),
            },
            "CRAM-MD5" => {
                if initial.is_some() {
                    return Ok(reply(Status::SyntaxError, "Error: bad command syntax"));
                }

                let challenge = cram_challenge(&settings.name);
                let encoded = STANDARD.encode(&challenge);

                Ok(self.challenge(
                    Continuation::CramMd5Response { challenge },
                    Reply::new(Status::AuthContinue, encoded),
                ))
            }
            _ => Ok(reply(
                Status::ParameterUnrecognized,
                "Error: unrecognized authentication type",
            )),
        }
    }

    /// Complete a parked exchange with the line the client just sent.
    pub async fn resume(
        &mut self,
        pending: Continuation,
        ctx: &CommandContext<'_>,
        hooks: &dyn Hooks,
    ) -> DispatchResult {
        let line = ctx.line.trim();

        // SASL cancellation.
        if line == "*" {
            return Ok(reply(Status::SyntaxError, "Error: authentication aborted"));
        }

        match pending {
            Continuation::PlainToken => plain(line, ctx, hooks).await,
            Continuation::LoginUsername => match decode(line) {
                Some(username) if !username.is_empty() => Ok(self.challenge(
                    Continuation::LoginPassword { username },
                    Reply::new(Status::AuthContinue, PASSWORD_PROMPT),
                )),
                Some(_) => Ok(reply(Status::SyntaxError, "Error: username missing")),
                None => Ok(invalid_encoding()),
            },
            Continuation::LoginPassword { username } => match decode(line) {
                Some(password) if !password.is_empty() => {
                    finish(Credentials::Login { username, password }, ctx, hooks).await
                }
                Some(_) => Ok(reply(Status::SyntaxError, "Error: password missing")),
                None => Ok(invalid_encoding()),
            },
            Continuation::XOAuth2Token => xoauth2(line, ctx, hooks).await,
            Continuation::CramMd5Response { challenge } => {
                let Some(decoded) = decode(line) else {
                    return Ok(invalid_encoding());
                };

                let Some((username, response)) = decoded.rsplit_once(' ') else {
                    return Ok(reply(
                        Status::SyntaxError,
                        "Error: invalid CRAM-MD5 response",
                    ));
                };

                let credentials = Credentials::CramMd5 {
                    username: username.to_string(),
                    verifier: CramMd5Verifier {
                        challenge,
                        response: response.to_string(),
                    },
                };

                finish(credentials, ctx, hooks).await
            }
        }
    }

    fn challenge(&mut self, pending: Continuation, prompt: Reply) -> Vec<Effect> {
        self.pending = Some(pending);
        vec![Effect::Reply(prompt)]
    }
}

async fn plain(token: &str, ctx: &CommandContext<'_>, hooks: &dyn Hooks) -> DispatchResult {
    let Some(decoded) = decode(token) else {
        return Ok(invalid_encoding());
    };

    // authzid NUL authcid NUL passwd
    let parts: Vec<&str> = decoded.split('\u{0}').collect();
    let [_, username, password] = parts.as_slice() else {
        return Ok(invalid_encoding());
    };

    if username.is_empty() {
        return Ok(reply(Status::SyntaxError, "Error: username missing"));
    }

    finish(
        Credentials::Plain {
            username: (*username).to_string(),
            password: (*password).to_string(),
        },
        ctx,
        hooks,
    )
    .await
}

async fn xoauth2(token: &str, ctx: &CommandContext<'_>, hooks: &dyn Hooks) -> DispatchResult {
    let Some(decoded) = decode(token) else {
        return Ok(invalid_encoding());
    };

    // user=<user>^Aauth=Bearer <token>^A^A
    let mut username = None;
    let mut access_token = None;

    for field in decoded.split('\u{1}').filter(|field| !field.is_empty()) {
        if let Some(value) = field.strip_prefix("user=") {
            username = Some(value.to_string());
        } else if let Some(value) = field.strip_prefix("auth=Bearer ") {
            access_token = Some(value.to_string());
        }
    }

    let (Some(username), Some(access_token)) = (username, access_token) else {
        return Ok(reply(Status::SyntaxError, "Error: invalid XOAUTH2 token"));
    };

    finish(
        Credentials::XOAuth2 {
            username,
            access_token,
        },
        ctx,
        hooks,
    )
    .await
}

/// Hand assembled credentials to the application and translate the verdict.
async fn finish(
    credentials: Credentials,
    ctx: &CommandContext<'_>,
    hooks: &dyn Hooks,
) -> DispatchResult {
    match hooks.on_auth(credentials, ctx.session).await {
        Ok(user) => Ok(vec![
            Effect::Update(SessionPatch {
                user: Some(user),
                ..SessionPatch::default()
            }),
            Effect::Reply(Reply::new(
                Status::AuthSuccessful,
                "Authentication successful",
            )),
        ]),
        Err(Rejection { code, message }) => Ok(reply(
            code.unwrap_or(Status::AuthInvalidCredentials),
            message,
        )),
    }
}

/// `<random><unix-timestamp>@<server-name>`, angle-bracketed (RFC 2195).
fn cram_challenge(name: &str) -> String {
    let digits: u32 = rand::rng().random();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs());

    format!("<{digits:010}{timestamp}@{name}>")
}

fn decode(token: &str) -> Option<String> {
    let bytes = STANDARD.decode(token.trim()).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn invalid_encoding() -> Vec<Effect> {
    reply(Status::SyntaxError, "Error: invalid base64 data")
}

fn reply(code: Status, message: impl Into<String>) -> Vec<Effect> {
    vec![Effect::Reply(Reply::new(code, message))]
}
