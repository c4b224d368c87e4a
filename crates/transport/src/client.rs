//! Default [`Transport`] built on `reqwest`.

use std::collections::BTreeMap;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Method};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransportError;
use crate::request::{CONTENT_TYPE, MultipartForm, RequestBody, TransportRequest, TransportResponse};
use crate::{ProgressFn, Transport, TransportFuture};

/// Granularity of upload progress callbacks.
const PROGRESS_PIECE: usize = 64 * 1024;

/// HTTP transport backed by two `reqwest` clients: a plain one and one with a
/// cookie store, used for requests sent `with_credentials`.
#[derive(Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
    credentialed: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().build()?;
        let credentialed = reqwest::Client::builder().cookie_store(true).build()?;
        Ok(Self { http, credentialed })
    }

    async fn execute(
        &self,
        request: TransportRequest,
        progress: Option<ProgressFn>,
    ) -> Result<TransportResponse, TransportError> {
        let client = if request.with_credentials {
            &self.credentialed
        } else {
            &self.http
        };
        let method = parse_method(&request.method)?;
        let wants_json = request.wants_json();
        let is_multipart = matches!(request.body, RequestBody::Multipart(_));

        let mut builder = client
            .request(method, &request.url)
            .headers(build_headers(&request.headers, is_multipart)?);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Multipart(form) => builder.multipart(build_multipart(form, progress)?),
            RequestBody::Form(fields) if wants_json => builder.json(&fields),
            RequestBody::Form(fields) => builder.form(&fields),
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Bytes(data) => {
                let len = data.len();
                builder.header(CONTENT_LENGTH, len).body(body_with_progress(data, progress))
            }
        };

        let resp = builder.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        if !status.is_success() {
            return Err(TransportError::bad_response(
                status.as_u16(),
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }

        Ok(TransportResponse {
            status: status.as_u16(),
            body,
        })
    }
}

impl Transport for ReqwestTransport {
    fn send(
        &self,
        request: TransportRequest,
        progress: Option<ProgressFn>,
        abort: CancellationToken,
    ) -> TransportFuture<'_> {
        Box::pin(async move {
            let method = request.method.clone();
            let url = request.url.clone();

            let result = tokio::select! {
                biased;
                _ = abort.cancelled() => Err(TransportError::aborted()),
                result = self.execute(request, progress) => result,
            };

            match &result {
                Ok(resp) => debug!(%method, %url, status = resp.status, "request completed"),
                Err(e) => debug!(%method, %url, error = %e, "request failed"),
            }
            result
        })
    }
}

fn parse_method(method: &str) -> Result<Method, TransportError> {
    Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| TransportError::invalid_request(format!("invalid HTTP method: {method:?}")))
}

/// Converts request headers. A multipart body needs the boundary the client
/// generates, so any caller-supplied `Content-Type` is dropped for it.
fn build_headers(
    headers: &BTreeMap<String, String>,
    is_multipart: bool,
) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_multipart && name.eq_ignore_ascii_case(CONTENT_TYPE) {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::invalid_request(format!("invalid header name: {name:?}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| TransportError::invalid_request(format!("invalid value for header {name}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn build_multipart(form: MultipartForm, progress: Option<ProgressFn>) -> Result<Form, TransportError> {
    let mut out = Form::new();
    for (name, value) in form.fields {
        out = out.text(name, value);
    }
    if let Some(file) = form.file {
        let len = file.data.len() as u64;
        let part = Part::stream_with_length(body_with_progress(file.data, progress), len)
            .file_name(file.file_name)
            .mime_str("application/octet-stream")?;
        out = out.part(file.field, part);
    }
    Ok(out)
}

/// Streams `data` in pieces, reporting `(sent, total)` as each piece is
/// handed to the connection.
fn body_with_progress(data: Bytes, progress: Option<ProgressFn>) -> Body {
    let Some(progress) = progress else {
        return Body::from(data);
    };

    let total = data.len() as u64;
    let pieces: Vec<Bytes> = (0..data.len())
        .step_by(PROGRESS_PIECE)
        .map(|start| data.slice(start..(start + PROGRESS_PIECE).min(data.len())))
        .collect();

    let mut sent = 0u64;
    let stream = futures_util::stream::iter(pieces).map(move |piece| {
        sent += piece.len() as u64;
        progress(sent, total);
        Ok::<_, std::io::Error>(piece)
    });
    Body::wrap_stream(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::TransportErrorKind;
    use crate::request::{APPLICATION_JSON, FORM_URLENCODED};

    /// Reads one HTTP/1.1 request (headers plus body) and returns it as text.
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 8192];
        loop {
            let n = stream.read(&mut tmp).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&tmp[..n]);

            let text = String::from_utf8_lossy(&buf).to_string();
            let Some(header_end) = text.find("\r\n\r\n") else {
                continue;
            };
            let head = text[..header_end].to_ascii_lowercase();
            let body_len = buf.len() - (header_end + 4);
            if let Some(line) = head.lines().find(|l| l.starts_with("content-length:")) {
                let expected: usize = line["content-length:".len()..].trim().parse().unwrap();
                if body_len >= expected {
                    break;
                }
            } else if head.contains("transfer-encoding: chunked") {
                if text.ends_with("0\r\n\r\n") {
                    break;
                }
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Starts a mock HTTP server answering one connection per entry in
    /// `responses`; the join handle yields the raw requests received.
    async fn mock_server(responses: Vec<(u16, &str, &str)>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}");
        let responses: Vec<(u16, String, String)> = responses
            .into_iter()
            .map(|(s, h, b)| (s, h.to_string(), b.to_string()))
            .collect();

        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for (status, extra_headers, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                requests.push(read_request(&mut stream).await);

                let resp = format!(
                    "HTTP/1.1 {status} Status\r\nContent-Type: application/json\r\n{extra_headers}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
            requests
        });

        (url, handle)
    }

    /// Starts a server that accepts a connection and never answers.
    async fn hanging_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = read_request(&mut stream).await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
        (format!("http://127.0.0.1:{port}"), handle)
    }

    fn transport() -> ReqwestTransport {
        ReqwestTransport::new().unwrap()
    }

    #[tokio::test]
    async fn multipart_upload_reports_progress() {
        let (url, handle) = mock_server(vec![(200, "", r#"{"ok":true}"#)]).await;

        let data = Bytes::from(vec![b'x'; 150_000]);
        let form = MultipartForm::new()
            .text("index", "2")
            .file("file", "movie.mp4", data);
        let request = TransportRequest::new("post", format!("{url}/upload"))
            .header("Content-Type", "text/plain")
            .header("X-Token", "abc")
            .body(RequestBody::Multipart(form));

        let calls = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::clone(&calls);
        let progress: ProgressFn = Arc::new(move |sent: u64, total: u64| c.lock().unwrap().push((sent, total)));

        let resp = transport()
            .send(request, Some(progress), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.text(), r#"{"ok":true}"#);

        let raw = handle.await.unwrap().remove(0);
        let lower = raw.to_ascii_lowercase();
        assert!(raw.starts_with("POST /upload HTTP/1.1"));
        assert!(lower.contains("content-type: multipart/form-data; boundary="));
        assert!(!lower.contains("content-type: text/plain"));
        assert!(lower.contains("x-token: abc"));
        assert!(raw.contains("name=\"index\""));
        assert!(raw.contains("filename=\"movie.mp4\""));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls.last(), Some(&(150_000, 150_000)));
        assert!(calls.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[tokio::test]
    async fn form_body_is_urlencoded() {
        let (url, handle) = mock_server(vec![(200, "", "{}")]).await;

        let mut fields = BTreeMap::new();
        fields.insert("fileHash".to_string(), "abc123".to_string());
        fields.insert("name".to_string(), "a b".to_string());
        let request = TransportRequest::new("post", format!("{url}/merge"))
            .header("Content-Type", FORM_URLENCODED)
            .body(RequestBody::Form(fields));

        transport()
            .send(request, None, CancellationToken::new())
            .await
            .unwrap();

        let raw = handle.await.unwrap().remove(0);
        assert!(raw.to_ascii_lowercase().contains("content-type: application/x-www-form-urlencoded"));
        assert!(raw.ends_with("fileHash=abc123&name=a+b"));
    }

    #[tokio::test]
    async fn form_body_is_json_when_header_asks() {
        let (url, handle) = mock_server(vec![(201, "", "{}")]).await;

        let mut fields = BTreeMap::new();
        fields.insert("fileHash".to_string(), "abc123".to_string());
        let request = TransportRequest::new("PUT", format!("{url}/merge"))
            .header("Content-Type", APPLICATION_JSON)
            .body(RequestBody::Form(fields));

        let resp = transport()
            .send(request, None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status, 201);

        let raw = handle.await.unwrap().remove(0);
        assert!(raw.starts_with("PUT /merge"));
        assert!(raw.ends_with(r#"{"fileHash":"abc123"}"#));
    }

    #[tokio::test]
    async fn non_success_status_is_bad_response() {
        let (url, handle) = mock_server(vec![(500, "", r#"{"error":"disk full"}"#)]).await;

        let err = transport()
            .send(
                TransportRequest::new("post", url),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, TransportErrorKind::BadResponse);
        assert_eq!(err.status, Some(500));
        assert!(err.message.contains("disk full"));
        handle.abort();
    }

    #[tokio::test]
    async fn abort_settles_in_flight_request() {
        let (url, handle) = hanging_server().await;
        let abort = CancellationToken::new();

        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = transport()
            .send(TransportRequest::new("post", url), None, abort)
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Aborted);
        handle.abort();
    }

    #[tokio::test]
    async fn already_aborted_request_never_sends() {
        let abort = CancellationToken::new();
        abort.cancel();
        let err = transport()
            .send(TransportRequest::new("post", "http://127.0.0.1:9/"), None, abort)
            .await
            .unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test]
    async fn request_timeout_is_classified() {
        let (url, handle) = hanging_server().await;
        let mut request = TransportRequest::new("post", url);
        request.timeout = Some(Duration::from_millis(200));

        let err = transport()
            .send(request, None, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Timeout);
        handle.abort();
    }

    #[tokio::test]
    async fn connection_refused_is_network() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = transport()
            .send(
                TransportRequest::new("post", format!("http://127.0.0.1:{port}/")),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Network);
    }

    #[tokio::test]
    async fn invalid_method_is_rejected() {
        let err = transport()
            .send(
                TransportRequest::new("not a method", "http://127.0.0.1:9/"),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn credentials_keep_cookies_between_requests() {
        let (url, handle) = mock_server(vec![
            (200, "Set-Cookie: sid=42; Path=/\r\n", "{}"),
            (200, "", "{}"),
        ])
        .await;
        let transport = transport();

        for path in ["/upload", "/merge"] {
            let mut request = TransportRequest::new("post", format!("{url}{path}"));
            request.with_credentials = true;
            transport
                .send(request, None, CancellationToken::new())
                .await
                .unwrap();
        }

        let requests = handle.await.unwrap();
        assert!(requests[1].to_ascii_lowercase().contains("cookie: sid=42"));
    }

    #[test]
    fn method_parsing_is_case_insensitive() {
        assert_eq!(parse_method("post").unwrap(), Method::POST);
        assert_eq!(parse_method(" Put ").unwrap(), Method::PUT);
    }

    #[test]
    fn multipart_drops_content_type() {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        headers.insert("X-A".to_string(), "1".to_string());

        let map = build_headers(&headers, true).unwrap();
        assert!(map.get("content-type").is_none());
        assert_eq!(map.get("x-a").unwrap(), "1");

        let map = build_headers(&headers, false).unwrap();
        assert_eq!(map.get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn invalid_header_rejected() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), "1".to_string());
        let err = build_headers(&headers, false).unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::InvalidRequest);
    }
}
