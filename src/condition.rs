//! Symbolic AMQP error conditions

use std::borrow::Cow;
use std::fmt;

/// A symbolic AMQP error condition, e.g. `amqp:connection:forced`
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Condition(Cow<'static, str>);

impl Condition {
    /// The condition's symbolic name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<String> for Condition {
    fn from(x: String) -> Self {
        Self(Cow::Owned(x))
    }
}

macro_rules! conditions {
    {$($name:ident($val:expr) $desc:expr;)*} => {
        impl Condition {
            $(#[doc = $desc] pub const $name: Self = Self(Cow::Borrowed($val));)*
        }

        impl fmt::Debug for Condition {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match &*self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x => write!(f, "Condition({x:?})"),
                }
            }
        }

        impl fmt::Display for Condition {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    }
}

conditions! {
    INTERNAL_ERROR("amqp:internal-error") "an internal error occurred; the peer may retry";
    NOT_ALLOWED("amqp:not-allowed") "the peer tried to use a frame in a manner that is inconsistent with the semantics defined in the specification";
    DECODE_ERROR("amqp:decode-error") "data could not be decoded";
    RESOURCE_LIMIT_EXCEEDED("amqp:resource-limit-exceeded") "the peer exceeded its resource allocation";
    ILLEGAL_STATE("amqp:illegal-state") "the peer sent a frame that is not permitted in the current state";
    FRAME_SIZE_TOO_SMALL("amqp:frame-size-too-small") "the peer cannot send a frame because the smallest encoding of the performative with the currently valid values would be too large";
    CONNECTION_FORCED("amqp:connection:forced") "an operator intervened to close the connection for some reason";
    FRAMING_ERROR("amqp:connection:framing-error") "a valid frame header cannot be formed from the incoming byte stream";
    WINDOW_VIOLATION("amqp:session:window-violation") "the peer violated the incoming window for the session";
    ERRANT_LINK("amqp:session:errant-link") "input was received for a link that was detached with an error";
    HANDLE_IN_USE("amqp:session:handle-in-use") "an attach was received using a handle that is already in use for an attached link";
    UNATTACHED_HANDLE("amqp:session:unattached-handle") "a frame (other than attach) referenced an unattached handle";
    DETACH_FORCED("amqp:link:detach-forced") "an operator intervened to detach for some reason";
    TRANSFER_LIMIT_EXCEEDED("amqp:link:transfer-limit-exceeded") "the peer sent more message transfers than currently allowed on the link";
    MESSAGE_SIZE_EXCEEDED("amqp:link:message-size-exceeded") "the peer sent a larger message than is supported on the link";
}

/// An error condition and its optional human-readable description, as
/// carried in Close, End, and Detach performatives
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorCondition {
    /// The symbolic condition
    pub condition: Condition,
    /// Free-text detail supplementing the condition
    pub description: Option<String>,
}

impl ErrorCondition {
    /// Construct a condition with a description
    pub fn new(condition: Condition, description: impl Into<String>) -> Self {
        Self {
            condition,
            description: Some(description.into()),
        }
    }
}

impl From<Condition> for ErrorCondition {
    fn from(condition: Condition) -> Self {
        Self {
            condition,
            description: None,
        }
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(desc) => write!(f, "{}: {}", self.condition, desc),
            None => write!(f, "{}", self.condition),
        }
    }
}
