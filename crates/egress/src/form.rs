//! `multipart/form-data` encoding for request bodies and decoding for
//! response bodies.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use rand::{Rng, distr::Alphanumeric};

use crate::error::{BoxError, Error, Result};

const DEFAULT_BLOB_NAME: &str = "blob";
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// A file carried in a form, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub last_modified: u64,
    pub data: Bytes,
}

impl FileEntry {
    /// A file stamped with the current time.
    #[must_use]
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size: data.len() as u64,
            last_modified: now_millis(),
            data,
        }
    }

    #[must_use]
    pub const fn with_last_modified(mut self, millis: u64) -> Self {
        self.last_modified = millis;
        self
    }
}

/// One entry of a request form body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormEntry {
    Text { name: String, value: String },
    File { name: String, file: FileEntry },
    /// Raw bytes with an optional file name (`blob` when absent).
    Blob {
        name: String,
        data: Bytes,
        filename: Option<String>,
    },
}

impl FormEntry {
    #[must_use]
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Text {
            name: name.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn file(name: impl Into<String>, file: FileEntry) -> Self {
        Self::File {
            name: name.into(),
            file,
        }
    }

    #[must_use]
    pub fn blob(name: impl Into<String>, data: impl Into<Bytes>, filename: Option<String>) -> Self {
        Self::Blob {
            name: name.into(),
            data: data.into(),
            filename,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Text { name, .. } | Self::File { name, .. } | Self::Blob { name, .. } => name,
        }
    }
}

/// Value of a decoded response form entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    File(FileEntry),
}

impl FormValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::File(_) => None,
        }
    }

    #[must_use]
    pub const fn as_file(&self) -> Option<&FileEntry> {
        match self {
            Self::File(f) => Some(f),
            Self::Text(_) => None,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

fn boundary() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("----EgressFormBoundary{suffix}")
}

pub(crate) struct EncodedForm {
    pub content_type: String,
    pub body: Bytes,
}

pub(crate) fn encode_multipart(entries: &[FormEntry]) -> EncodedForm {
    encode_with_boundary(entries, &boundary())
}

fn encode_with_boundary(entries: &[FormEntry], boundary: &str) -> EncodedForm {
    let mut body = BytesMut::new();
    for entry in entries {
        body.put_slice(b"--");
        body.put_slice(boundary.as_bytes());
        body.put_slice(b"\r\n");
        let disposition = format!(
            "Content-Disposition: form-data; name=\"{}\"",
            escape_quoted(entry.name())
        );
        body.put_slice(disposition.as_bytes());

        let (filename, mime_type, data) = match entry {
            FormEntry::Text { value, .. } => {
                body.put_slice(b"\r\n\r\n");
                body.put_slice(value.as_bytes());
                body.put_slice(b"\r\n");
                continue;
            }
            FormEntry::File { file, .. } => (
                file.name.as_str(),
                if file.mime_type.is_empty() {
                    DEFAULT_MIME_TYPE
                } else {
                    file.mime_type.as_str()
                },
                &file.data,
            ),
            FormEntry::Blob { data, filename, .. } => (
                filename.as_deref().unwrap_or(DEFAULT_BLOB_NAME),
                DEFAULT_MIME_TYPE,
                data,
            ),
        };
        let header = format!(
            "; filename=\"{}\"\r\nContent-Type: {mime_type}\r\n\r\n",
            escape_quoted(filename)
        );
        body.put_slice(header.as_bytes());
        body.put_slice(data);
        body.put_slice(b"\r\n");
    }
    body.put_slice(b"--");
    body.put_slice(boundary.as_bytes());
    body.put_slice(b"--\r\n");

    EncodedForm {
        content_type: format!("multipart/form-data; boundary={boundary}"),
        body: body.freeze(),
    }
}

fn malformed(err: impl Into<BoxError>) -> Error {
    Error::MalformedBody(err.into())
}

/// Decode a `multipart/form-data` body. Parts with a file name become
/// [`FormValue::File`], the rest text.
pub(crate) async fn decode_multipart(
    content_type: &str,
    body: Bytes,
) -> Result<Vec<(String, FormValue)>> {
    let boundary = multer::parse_boundary(content_type).map_err(malformed)?;
    let stream = futures::stream::once(async move { Ok::<_, std::convert::Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut entries = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        let value = match field.file_name() {
            Some(file_name) => {
                let file_name = file_name.to_string();
                let mime_type = field
                    .content_type()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                let data = field.bytes().await.map_err(malformed)?;
                FormValue::File(FileEntry::new(file_name, mime_type, data))
            }
            None => FormValue::Text(field.text().await.map_err(malformed)?),
        };
        entries.push((name, value));
    }
    Ok(entries)
}

/// Decode an `application/x-www-form-urlencoded` body into text entries.
pub(crate) fn decode_urlencoded(body: &[u8]) -> Vec<(String, FormValue)> {
    url::form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), FormValue::Text(v.into_owned())))
        .collect()
}
