use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;

/// Header that selects between urlencoded and JSON encoding of form bodies.
pub const CONTENT_TYPE: &str = "content-type";

/// `Content-Type` for urlencoded form bodies.
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// `Content-Type` that switches a form body to JSON.
pub const APPLICATION_JSON: &str = "application/json";

/// The file part of a multipart body.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePart {
    /// Form field name carrying the bytes.
    pub field: String,
    pub file_name: String,
    pub data: Bytes,
}

/// A `multipart/form-data` body: plain text fields plus an optional file part.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultipartForm {
    pub fields: BTreeMap<String, String>,
    pub file: Option<FilePart>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn file(
        mut self,
        field: impl Into<String>,
        file_name: impl Into<String>,
        data: Bytes,
    ) -> Self {
        self.file = Some(FilePart {
            field: field.into(),
            file_name: file_name.into(),
            data,
        });
        self
    }

    /// Bytes carried by the file part.
    pub fn file_len(&self) -> u64 {
        self.file.as_ref().map_or(0, |f| f.data.len() as u64)
    }
}

/// Request payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    Multipart(MultipartForm),
    /// Key/value form. Sent urlencoded, or as a JSON object when the
    /// request's `Content-Type` is `application/json`.
    Form(BTreeMap<String, String>),
    Json(serde_json::Value),
    Bytes(Bytes),
}

impl RequestBody {
    /// Size of the payload that progress is reported against.
    pub fn upload_len(&self) -> u64 {
        match self {
            Self::Empty | Self::Form(_) | Self::Json(_) => 0,
            Self::Multipart(form) => form.file_len(),
            Self::Bytes(b) => b.len() as u64,
        }
    }
}

/// A single HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub url: String,
    /// HTTP method, case-insensitive (`"post"`, `"PUT"`, ...).
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: RequestBody,
    /// Send and store cookies for this request.
    pub with_credentials: bool,
    pub timeout: Option<Duration>,
}

impl TransportRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            headers: BTreeMap::new(),
            body: RequestBody::Empty,
            with_credentials: false,
            timeout: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns `true` if the `Content-Type` header asks for JSON.
    pub fn wants_json(&self) -> bool {
        self.header_value(CONTENT_TYPE)
            .is_some_and(|v| v.trim().to_ascii_lowercase().starts_with(APPLICATION_JSON))
    }
}

/// A 2xx response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Body as UTF-8 text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parses the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_content_type_detection() {
        let req = TransportRequest::new("post", "http://x").header("Content-Type", "application/json; charset=utf-8");
        assert!(req.wants_json());

        let req = TransportRequest::new("post", "http://x").header("content-type", FORM_URLENCODED);
        assert!(!req.wants_json());

        assert!(!TransportRequest::new("post", "http://x").wants_json());
    }

    #[test]
    fn upload_len_counts_file_part_only() {
        let form = MultipartForm::new()
            .text("index", "3")
            .file("file", "a.bin", Bytes::from_static(b"12345"));
        assert_eq!(RequestBody::Multipart(form).upload_len(), 5);
        assert_eq!(RequestBody::Empty.upload_len(), 0);
    }

    #[test]
    fn response_json() {
        let resp = TransportResponse::new(200, r#"{"ok":true}"#);
        let v: serde_json::Value = resp.json().unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(resp.text(), r#"{"ok":true}"#);
    }
}
