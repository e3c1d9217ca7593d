//! LDAP message types shared by the relay, the upstream connector and the frontend
//!
//! These are deliberately independent of both the client library used to talk
//! to upstream servers and the codec used by the frontend listener.

use std::fmt;

/// LDAP result codes (RFC 4511 section 4.1.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    Referral,
    NoSuchObject,
    InvalidDnSyntax,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    Other,
    /// Any code the proxy has no dedicated variant for, carried through verbatim
    Unknown(u32),
}

impl ResultCode {
    pub fn code(&self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::Referral => 10,
            ResultCode::NoSuchObject => 32,
            ResultCode::InvalidDnSyntax => 34,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Busy => 51,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::Other => 80,
            ResultCode::Unknown(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

impl From<u32> for ResultCode {
    fn from(value: u32) -> Self {
        match value {
            0 => ResultCode::Success,
            1 => ResultCode::OperationsError,
            2 => ResultCode::ProtocolError,
            3 => ResultCode::TimeLimitExceeded,
            4 => ResultCode::SizeLimitExceeded,
            10 => ResultCode::Referral,
            32 => ResultCode::NoSuchObject,
            34 => ResultCode::InvalidDnSyntax,
            49 => ResultCode::InvalidCredentials,
            50 => ResultCode::InsufficientAccessRights,
            51 => ResultCode::Busy,
            52 => ResultCode::Unavailable,
            53 => ResultCode::UnwillingToPerform,
            80 => ResultCode::Other,
            other => ResultCode::Unknown(other),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Success => write!(f, "success"),
            ResultCode::OperationsError => write!(f, "operationsError"),
            ResultCode::ProtocolError => write!(f, "protocolError"),
            ResultCode::TimeLimitExceeded => write!(f, "timeLimitExceeded"),
            ResultCode::SizeLimitExceeded => write!(f, "sizeLimitExceeded"),
            ResultCode::Referral => write!(f, "referral"),
            ResultCode::NoSuchObject => write!(f, "noSuchObject"),
            ResultCode::InvalidDnSyntax => write!(f, "invalidDNSyntax"),
            ResultCode::InvalidCredentials => write!(f, "invalidCredentials"),
            ResultCode::InsufficientAccessRights => write!(f, "insufficientAccessRights"),
            ResultCode::Busy => write!(f, "busy"),
            ResultCode::Unavailable => write!(f, "unavailable"),
            ResultCode::UnwillingToPerform => write!(f, "unwillingToPerform"),
            ResultCode::Other => write!(f, "other"),
            ResultCode::Unknown(code) => write!(f, "resultCode({})", code),
        }
    }
}

/// Search scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Base,
    OneLevel,
    Subtree,
}

/// Alias dereferencing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never,
    InSearching,
    FindingBaseObject,
    Always,
}

/// A request or response control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

/// A search request as received from a client
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: Scope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: String,
    pub attributes: Vec<String>,
    pub controls: Vec<Control>,
}

impl SearchRequest {
    /// Subtree search with no limits, returning all attributes
    pub fn new(base_dn: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope: Scope::Subtree,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: filter.into(),
            attributes: Vec::new(),
            controls: Vec::new(),
        }
    }

    pub fn with_attributes<S: Into<String>>(mut self, attributes: Vec<S>) -> Self {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_types_only(mut self, types_only: bool) -> Self {
        self.types_only = types_only;
        self
    }
}

/// One attribute of a search result entry.
///
/// Values are raw octet strings so binary attributes survive the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new<V: Into<Vec<u8>>>(name: impl Into<String>, values: Vec<V>) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Values rendered as text, replacing invalid UTF-8
    pub fn text_values(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }
}

/// A search result entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

impl Entry {
    pub fn new(dn: impl Into<String>, attributes: Vec<Attribute>) -> Self {
        Self {
            dn: dn.into(),
            attributes,
        }
    }

    /// Case-insensitive attribute lookup
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }
}

/// What a search returns to the client
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub entries: Vec<Entry>,
    /// Continuation reference URIs
    pub references: Vec<String>,
    /// Referral URIs of the final result, meaningful with [`ResultCode::Referral`]
    pub referrals: Vec<String>,
    pub controls: Vec<Control>,
    pub code: ResultCode,
}

impl SearchResult {
    /// An empty result carrying only a result code
    pub fn with_code(code: ResultCode) -> Self {
        Self {
            entries: Vec::new(),
            references: Vec::new(),
            referrals: Vec::new(),
            controls: Vec::new(),
            code,
        }
    }
}
