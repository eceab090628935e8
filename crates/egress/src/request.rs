use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};

use crate::form::FormEntry;

/// Requested body representation of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Text,
    Json,
    ArrayBuffer,
    FormData,
}

impl ResponseType {
    /// Infer the representation from a `content-type` header value. A
    /// missing header means text.
    #[must_use]
    pub fn infer(content_type: Option<&str>) -> Self {
        let Some(content_type) = content_type else {
            return Self::Text;
        };
        let content_type = content_type.trim().to_ascii_lowercase();
        if content_type.starts_with("application/json") {
            Self::Json
        } else if content_type.starts_with("multipart/form-data") {
            Self::FormData
        } else if content_type == "text"
            || content_type.starts_with("text/")
            || content_type.contains("+xml")
        {
            Self::Text
        } else {
            Self::ArrayBuffer
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::ArrayBuffer => "arrayBuffer",
            Self::FormData => "formData",
        }
    }
}

impl core::str::FromStr for ResponseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "arrayBuffer" => Ok(Self::ArrayBuffer),
            "formData" => Ok(Self::FormData),
            other => Err(format!("unknown response type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RedirectPolicy {
    #[default]
    Follow,
    /// Fail when the server answers with a redirect.
    Error,
    /// Return the redirect response as is.
    Manual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialsPolicy {
    Omit,
    #[default]
    SameOrigin,
    Include,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
    #[default]
    Cors,
    NoCors,
    SameOrigin,
    Navigate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Text(String),
    Bytes(Bytes),
    Form(Vec<FormEntry>),
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b.into())
    }
}

impl From<Vec<FormEntry>> for RequestBody {
    fn from(entries: Vec<FormEntry>) -> Self {
        Self::Form(entries)
    }
}

/// Per-call options of [`Gateway::fetch`](crate::Gateway::fetch).
#[derive(Debug, Clone, Default)]
pub struct FetchParams {
    /// Explicit body representation; inferred from `content-type` if unset.
    pub response_type: Option<ResponseType>,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
    pub redirect: RedirectPolicy,
    pub credentials: CredentialsPolicy,
    pub mode: RequestMode,
    pub referrer: Option<String>,
    pub referrer_policy: Option<String>,
    pub timeout: Option<Duration>,
}

impl FetchParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = Some(response_type);
        self
    }

    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub const fn with_redirect(mut self, redirect: RedirectPolicy) -> Self {
        self.redirect = redirect;
        self
    }

    #[must_use]
    pub const fn with_credentials(mut self, credentials: CredentialsPolicy) -> Self {
        self.credentials = credentials;
        self
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    #[must_use]
    pub fn with_referrer_policy(mut self, policy: impl Into<String>) -> Self {
        self.referrer_policy = Some(policy.into());
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
