//! Wire replies.
//!
//! A [`Reply`] carries a status code and one or more text lines. Multi-line
//! replies render with the `NNN-` continuation prefix on all but the last
//! line, per RFC 5321 section 4.2.1.

use core::fmt::{self, Display, Formatter};

use mailgate_common::status::Status;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: Status,
    lines: Vec<String>,
}

impl Reply {
    pub fn new(code: impl Into<Status>, text: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            lines: vec![text.into()],
        }
    }

    /// A reply consisting of the bare status code, e.g. an empty `334`
    /// authentication challenge.
    pub fn bare(code: impl Into<Status>) -> Self {
        Self {
            code: code.into(),
            lines: Vec::new(),
        }
    }

    pub fn multi(code: impl Into<Status>, lines: Vec<String>) -> Self {
        Self {
            code: code.into(),
            lines,
        }
    }

    #[must_use]
    pub const fn code(&self) -> Status {
        self.code
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The text of the final reply line, used for last-error bookkeeping.
    #[must_use]
    pub fn text(&self) -> &str {
        self.lines.last().map_or("", String::as_str)
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.code.is_error()
    }

    /// 421 always tears the connection down once flushed.
    #[must_use]
    pub fn closes_connection(&self) -> bool {
        self.code == Status::Unavailable
    }
}

impl Display for Reply {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self.lines.as_slice() {
            [] => write!(fmt, "{}", self.code),
            [line] => write!(fmt, "{} {line}", self.code),
            [head @ .., last] => {
                for line in head {
                    write!(fmt, "{}-{line}\r\n", self.code)?;
                }
                write!(fmt, "{} {last}", self.code)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mailgate_common::status::Status;
    use pretty_assertions::assert_eq;

    use super::Reply;

    #[test]
    fn single_line() {
        assert_eq!(Reply::new(250, "OK").to_string(), "250 OK");
    }

    #[test]
    fn bare_code() {
        assert_eq!(Reply::bare(334).to_string(), "334");
    }

    #[test]
    fn multi_line_uses_continuation_prefix() {
        let reply = Reply::multi(
            250,
            vec![
                "mail.example.com Welcome, [127.0.0.1]".to_string(),
                "PIPELINING".to_string(),
                "8BITMIME".to_string(),
            ],
        );

        assert_eq!(
            reply.to_string(),
            "250-mail.example.com Welcome, [127.0.0.1]\r\n250-PIPELINING\r\n250 8BITMIME"
        );
    }

    #[test]
    fn error_classification() {
        assert!(Reply::new(550, "Error: not allowed").is_error());
        assert!(!Reply::new(250, "Accepted").is_error());
        assert!(Reply::new(421, "Server shutting down").closes_connection());
        assert_eq!(Reply::new(503, "nope").code(), Status::InvalidCommandSequence);
    }
}
