use bytes::Bytes;
use http::{HeaderMap, StatusCode, header::CONTENT_TYPE};
use url::Url;

use crate::{
    error::{ContentLengthError, Error, Result},
    form::{self, FormValue},
    request::ResponseType,
};

/// Shaped response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Text(String),
    Json(serde_json::Value),
    Binary(Bytes),
    /// Ordered `(name, value)` entries.
    FormData(Vec<(String, FormValue)>),
}

impl Body {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_form_data(&self) -> Option<&[(String, FormValue)]> {
        match self {
            Self::FormData(entries) => Some(entries),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: Url,
    pub ok: bool,
    pub response_type: ResponseType,
    pub status: StatusCode,
    pub status_text: String,
    pub redirected: bool,
    pub headers: HeaderMap,
    pub body: Body,
}

/// Enforce `max` against the declared `content-length`. Without a limit the
/// header is not inspected.
pub(crate) fn check_content_length(
    headers: &HeaderMap,
    max: Option<u64>,
) -> Result<(), ContentLengthError> {
    let Some(max) = max else {
        return Ok(());
    };
    let value = headers
        .get(http::header::CONTENT_LENGTH)
        .ok_or(ContentLengthError::Missing)?;
    let length: u64 = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or(ContentLengthError::Malformed)?;
    if length > max {
        return Err(ContentLengthError::Exceeded { length, max });
    }
    Ok(())
}

pub(crate) fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
}

/// Negotiate the representation and decode `body` into it.
pub(crate) async fn shape(
    requested: Option<ResponseType>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<(ResponseType, Body)> {
    let content_type = content_type(headers);
    let response_type = requested.unwrap_or_else(|| ResponseType::infer(content_type));

    let body = match response_type {
        ResponseType::Text => Body::Text(String::from_utf8_lossy(&body).into_owned()),
        ResponseType::Json => Body::Json(
            serde_json::from_slice(&body).map_err(|e| Error::MalformedBody(e.into()))?,
        ),
        ResponseType::ArrayBuffer => Body::Binary(body),
        ResponseType::FormData => match content_type {
            Some(ct) if ct.trim_start().to_ascii_lowercase().starts_with("multipart/") => {
                Body::FormData(form::decode_multipart(ct, body).await?)
            }
            Some(ct)
                if ct
                    .trim_start()
                    .to_ascii_lowercase()
                    .starts_with("application/x-www-form-urlencoded") =>
            {
                Body::FormData(form::decode_urlencoded(&body))
            }
            other => {
                return Err(Error::MalformedBody(
                    format!("cannot decode form data from content-type {other:?}").into(),
                ));
            }
        },
    };
    Ok((response_type, body))
}
