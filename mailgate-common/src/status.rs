use core::fmt::{self, Display, Formatter};

/// SMTP reply codes used by the server side of the protocol.
#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    HelpMessage = 214,
    ServiceReady = 220,
    GoodBye = 221,
    AuthSuccessful = 235,
    Ok = 250,
    CannotVerify = 252,
    AuthContinue = 334,
    StartMailInput = 354,
    Unavailable = 421,
    MailboxUnavailable = 450,
    ActionAborted = 451,
    InsufficientStorage = 452,
    AuthTemporaryFailure = 454,
    ParametersUnavailable = 455,
    CommandUnrecognized = 500,
    SyntaxError = 501,
    NotImplemented = 502,
    InvalidCommandSequence = 503,
    ParameterUnrecognized = 504,
    AuthRequired = 530,
    AuthMechanismTooWeak = 534,
    AuthInvalidCredentials = 535,
    EncryptionRequired = 538,
    ActionNotTaken = 550,
    ExceededStorage = 552,
    MailboxNameInvalid = 553,
    TransactionFailed = 554,
    DomainNotAccepting = 556,
    Unknown(u16),
}

impl Status {
    /// Checks if the status is a permanent rejection
    #[must_use]
    pub fn is_permanent(self) -> bool {
        u16::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    #[must_use]
    pub fn is_temporary(self) -> bool {
        u16::from(self) >= 400 && u16::from(self) < 500
    }

    /// Checks if the status is any kind of rejection
    #[must_use]
    pub fn is_error(self) -> bool {
        u16::from(self) >= 400
    }
}

impl From<u16> for Status {
    fn from(value: u16) -> Self {
        match value {
            214 => Self::HelpMessage,
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            235 => Self::AuthSuccessful,
            250 => Self::Ok,
            252 => Self::CannotVerify,
            334 => Self::AuthContinue,
            354 => Self::StartMailInput,
            421 => Self::Unavailable,
            450 => Self::MailboxUnavailable,
            451 => Self::ActionAborted,
            452 => Self::InsufficientStorage,
            454 => Self::AuthTemporaryFailure,
            455 => Self::ParametersUnavailable,
            500 => Self::CommandUnrecognized,
            501 => Self::SyntaxError,
            502 => Self::NotImplemented,
            503 => Self::InvalidCommandSequence,
            504 => Self::ParameterUnrecognized,
            530 => Self::AuthRequired,
            534 => Self::AuthMechanismTooWeak,
            535 => Self::AuthInvalidCredentials,
            538 => Self::EncryptionRequired,
            550 => Self::ActionNotTaken,
            552 => Self::ExceededStorage,
            553 => Self::MailboxNameInvalid,
            554 => Self::TransactionFailed,
            556 => Self::DomainNotAccepting,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u16 {
    fn from(value: Status) -> Self {
        match value {
            Status::HelpMessage => 214,
            Status::ServiceReady => 220,
            Status::GoodBye => 221,
            Status::AuthSuccessful => 235,
            Status::Ok => 250,
            Status::CannotVerify => 252,
            Status::AuthContinue => 334,
            Status::StartMailInput => 354,
            Status::Unavailable => 421,
            Status::MailboxUnavailable => 450,
            Status::ActionAborted => 451,
            Status::InsufficientStorage => 452,
            Status::AuthTemporaryFailure => 454,
            Status::ParametersUnavailable => 455,
            Status::CommandUnrecognized => 500,
            Status::SyntaxError => 501,
            Status::NotImplemented => 502,
            Status::InvalidCommandSequence => 503,
            Status::ParameterUnrecognized => 504,
            Status::AuthRequired => 530,
            Status::AuthMechanismTooWeak => 534,
            Status::AuthInvalidCredentials => 535,
            Status::EncryptionRequired => 538,
            Status::ActionNotTaken => 550,
            Status::ExceededStorage => 552,
            Status::MailboxNameInvalid => 553,
            Status::TransactionFailed => 554,
            Status::DomainNotAccepting => 556,
            Status::Unknown(v) => v,
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u16::from(*self))
    }
}
