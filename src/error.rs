// Error taxonomy for the LDAP client engine.
// Wire result codes and local failures both end up in LdapError.

use std::time::Duration;
use thiserror::Error;

/// Client-side codes, outside the range servers use for result codes.
pub const ERROR_NETWORK: u32 = 200;
pub const ERROR_FILTER_COMPILE: u32 = 201;
pub const ERROR_EMPTY_PASSWORD: u32 = 202;
pub const ERROR_UNEXPECTED_RESPONSE: u32 = 205;
pub const ERROR_TIMEOUT: u32 = 206;
pub const ERROR_INVALID_REQUEST: u32 = 207;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LdapError {
    /// Malformed or truncated BER, tag/length inconsistency.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport closed, read or write failure. The connection is unusable afterwards.
    #[error("network error: {0}")]
    Network(String),

    /// Server answered with a nonzero result code.
    #[error("LDAP result code {code} \"{}\": {diagnostic}", result_code_text(*.code))]
    Result {
        code: u32,
        matched_dn: String,
        diagnostic: String,
    },

    #[error("unexpected response: expected application tag {expected}, got {actual}")]
    UnexpectedResponse { expected: u32, actual: u32 },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("empty password not allowed for simple bind of {0}")]
    EmptyPassword(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("filter compile error: {0}")]
    FilterCompile(String),
}

impl LdapError {
    /// Numeric code: the wire result code for `Result`, a client-side code otherwise.
    pub fn code(&self) -> u32 {
        match self {
            LdapError::Protocol(_) => RESULT_PROTOCOL_ERROR,
            LdapError::Network(_) => ERROR_NETWORK,
            LdapError::Result { code, .. } => *code,
            LdapError::UnexpectedResponse { .. } => ERROR_UNEXPECTED_RESPONSE,
            LdapError::Timeout(_) => ERROR_TIMEOUT,
            LdapError::EmptyPassword(_) => ERROR_EMPTY_PASSWORD,
            LdapError::InvalidRequest(_) => ERROR_INVALID_REQUEST,
            LdapError::FilterCompile(_) => ERROR_FILTER_COMPILE,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, LdapError::Network(_))
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        LdapError::Protocol(msg.into())
    }

    pub(crate) fn channel_closed() -> Self {
        LdapError::Network("response channel closed".to_string())
    }
}

impl From<std::io::Error> for LdapError {
    fn from(err: std::io::Error) -> Self {
        LdapError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LdapError>;

// LDAP result codes (RFC 4511 Appendix A, plus common extensions)
pub const RESULT_SUCCESS: u32 = 0;
pub const RESULT_OPERATIONS_ERROR: u32 = 1;
pub const RESULT_PROTOCOL_ERROR: u32 = 2;
pub const RESULT_TIME_LIMIT_EXCEEDED: u32 = 3;
pub const RESULT_SIZE_LIMIT_EXCEEDED: u32 = 4;
pub const RESULT_COMPARE_FALSE: u32 = 5;
pub const RESULT_COMPARE_TRUE: u32 = 6;
pub const RESULT_AUTH_METHOD_NOT_SUPPORTED: u32 = 7;
pub const RESULT_STRONGER_AUTH_REQUIRED: u32 = 8;
pub const RESULT_REFERRAL: u32 = 10;
pub const RESULT_ADMIN_LIMIT_EXCEEDED: u32 = 11;
pub const RESULT_UNAVAILABLE_CRITICAL_EXTENSION: u32 = 12;
pub const RESULT_CONFIDENTIALITY_REQUIRED: u32 = 13;
pub const RESULT_SASL_BIND_IN_PROGRESS: u32 = 14;
pub const RESULT_NO_SUCH_ATTRIBUTE: u32 = 16;
pub const RESULT_UNDEFINED_ATTRIBUTE_TYPE: u32 = 17;
pub const RESULT_INAPPROPRIATE_MATCHING: u32 = 18;
pub const RESULT_CONSTRAINT_VIOLATION: u32 = 19;
pub const RESULT_ATTRIBUTE_OR_VALUE_EXISTS: u32 = 20;
pub const RESULT_INVALID_ATTRIBUTE_SYNTAX: u32 = 21;
pub const RESULT_NO_SUCH_OBJECT: u32 = 32;
pub const RESULT_ALIAS_PROBLEM: u32 = 33;
pub const RESULT_INVALID_DN_SYNTAX: u32 = 34;
pub const RESULT_IS_LEAF: u32 = 35;
pub const RESULT_ALIAS_DEREFERENCING_PROBLEM: u32 = 36;
pub const RESULT_INAPPROPRIATE_AUTHENTICATION: u32 = 48;
pub const RESULT_INVALID_CREDENTIALS: u32 = 49;
pub const RESULT_INSUFFICIENT_ACCESS_RIGHTS: u32 = 50;
pub const RESULT_BUSY: u32 = 51;
pub const RESULT_UNAVAILABLE: u32 = 52;
pub const RESULT_UNWILLING_TO_PERFORM: u32 = 53;
pub const RESULT_LOOP_DETECT: u32 = 54;
pub const RESULT_NAMING_VIOLATION: u32 = 64;
pub const RESULT_OBJECT_CLASS_VIOLATION: u32 = 65;
pub const RESULT_NOT_ALLOWED_ON_NON_LEAF: u32 = 66;
pub const RESULT_NOT_ALLOWED_ON_RDN: u32 = 67;
pub const RESULT_ENTRY_ALREADY_EXISTS: u32 = 68;
pub const RESULT_OBJECT_CLASS_MODS_PROHIBITED: u32 = 69;
pub const RESULT_AFFECTS_MULTIPLE_DSAS: u32 = 71;
pub const RESULT_OTHER: u32 = 80;

/// Human readable name of a result code (or of a client-side code).
pub fn result_code_text(code: u32) -> &'static str {
    match code {
        RESULT_SUCCESS => "Success",
        RESULT_OPERATIONS_ERROR => "Operations Error",
        RESULT_PROTOCOL_ERROR => "Protocol Error",
        RESULT_TIME_LIMIT_EXCEEDED => "Time Limit Exceeded",
        RESULT_SIZE_LIMIT_EXCEEDED => "Size Limit Exceeded",
        RESULT_COMPARE_FALSE => "Compare False",
        RESULT_COMPARE_TRUE => "Compare True",
        RESULT_AUTH_METHOD_NOT_SUPPORTED => "Auth Method Not Supported",
        RESULT_STRONGER_AUTH_REQUIRED => "Stronger Auth Required",
        RESULT_REFERRAL => "Referral",
        RESULT_ADMIN_LIMIT_EXCEEDED => "Admin Limit Exceeded",
        RESULT_UNAVAILABLE_CRITICAL_EXTENSION => "Unavailable Critical Extension",
        RESULT_CONFIDENTIALITY_REQUIRED => "Confidentiality Required",
        RESULT_SASL_BIND_IN_PROGRESS => "Sasl Bind In Progress",
        RESULT_NO_SUCH_ATTRIBUTE => "No Such Attribute",
        RESULT_UNDEFINED_ATTRIBUTE_TYPE => "Undefined Attribute Type",
        RESULT_INAPPROPRIATE_MATCHING => "Inappropriate Matching",
        RESULT_CONSTRAINT_VIOLATION => "Constraint Violation",
        RESULT_ATTRIBUTE_OR_VALUE_EXISTS => "Attribute Or Value Exists",
        RESULT_INVALID_ATTRIBUTE_SYNTAX => "Invalid Attribute Syntax",
        RESULT_NO_SUCH_OBJECT => "No Such Object",
        RESULT_ALIAS_PROBLEM => "Alias Problem",
        RESULT_INVALID_DN_SYNTAX => "Invalid DN Syntax",
        RESULT_IS_LEAF => "Is Leaf",
        RESULT_ALIAS_DEREFERENCING_PROBLEM => "Alias Dereferencing Problem",
        RESULT_INAPPROPRIATE_AUTHENTICATION => "Inappropriate Authentication",
        RESULT_INVALID_CREDENTIALS => "Invalid Credentials",
        RESULT_INSUFFICIENT_ACCESS_RIGHTS => "Insufficient Access Rights",
        RESULT_BUSY => "Busy",
        RESULT_UNAVAILABLE => "Unavailable",
        RESULT_UNWILLING_TO_PERFORM => "Unwilling To Perform",
        RESULT_LOOP_DETECT => "Loop Detect",
        RESULT_NAMING_VIOLATION => "Naming Violation",
        RESULT_OBJECT_CLASS_VIOLATION => "Object Class Violation",
        RESULT_NOT_ALLOWED_ON_NON_LEAF => "Not Allowed On Non Leaf",
        RESULT_NOT_ALLOWED_ON_RDN => "Not Allowed On RDN",
        RESULT_ENTRY_ALREADY_EXISTS => "Entry Already Exists",
        RESULT_OBJECT_CLASS_MODS_PROHIBITED => "Object Class Mods Prohibited",
        RESULT_AFFECTS_MULTIPLE_DSAS => "Affects Multiple DSAs",
        RESULT_OTHER => "Other",
        ERROR_NETWORK => "Network Error",
        ERROR_FILTER_COMPILE => "Filter Compile Error",
        ERROR_EMPTY_PASSWORD => "Empty Password Not Allowed",
        ERROR_UNEXPECTED_RESPONSE => "Unexpected Response",
        ERROR_TIMEOUT => "Timeout",
        ERROR_INVALID_REQUEST => "Invalid Request",
        _ => "Unknown",
    }
}
