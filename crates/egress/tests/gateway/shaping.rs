use anyhow::Result;
use bytes::Bytes;
use egress::{
    Body, ContentLengthError, Error, ErrorKind, FetchParams, FileEntry, FormEntry, FormValue,
    Gateway, ResponseType, TransportResponse,
};
use http::{
    HeaderMap, HeaderValue, Method, StatusCode,
    header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST},
};

use super::common::{answering, public_resolver, recording_transport, respond};

fn with_length(length: Option<&'static str>) -> Gateway {
    Gateway::builder(answering(move |request| {
        let mut response =
            TransportResponse::new(request.url.clone(), StatusCode::OK).with_body("payload");
        if let Some(length) = length {
            response = response.with_header(CONTENT_LENGTH, HeaderValue::from_static(length));
        }
        response
    }))
    .max_content_length(100)
    .resolver(public_resolver())
    .build()
}

#[tokio::test]
async fn content_length_is_enforced() -> Result<()> {
    let url = "https://files.example/blob";
    assert!(with_length(Some("50")).fetch(url, FetchParams::new()).await?.ok);
    assert!(with_length(Some("100")).fetch(url, FetchParams::new()).await?.ok);

    let cases = [
        (
            Some("500"),
            ContentLengthError::Exceeded {
                length: 500,
                max: 100,
            },
        ),
        (None, ContentLengthError::Missing),
        (Some("many"), ContentLengthError::Malformed),
    ];
    for (length, expected) in cases {
        let err = with_length(length)
            .fetch(url, FetchParams::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContentLengthExceeded);
        assert!(matches!(err, Error::ContentLength(e) if e == expected));
    }
    Ok(())
}

#[tokio::test]
async fn content_length_ignored_without_cap() -> Result<()> {
    let gateway = Gateway::builder(answering(|request| {
        TransportResponse::new(request.url.clone(), StatusCode::OK).with_body("no length")
    }))
    .resolver(public_resolver())
    .build();
    let res = gateway
        .fetch("https://files.example/", FetchParams::new())
        .await?;
    assert_eq!(res.body.as_text(), Some("no length"));
    Ok(())
}

#[tokio::test]
async fn body_shape_follows_content_type() -> Result<()> {
    let gateway = Gateway::builder(answering(|request| match request.url.path() {
        "/json" => respond(request, "application/json; charset=utf-8", br#"{"a":[1,2]}"#),
        "/xml" => respond(request, "application/rss+xml", b"<rss/>"),
        "/png" => respond(request, "image/png", b"\x89PNG"),
        _ => respond(request, "text/html", b"<p>hi</p>"),
    }))
    .resolver(public_resolver())
    .build();

    let res = gateway
        .fetch("https://api.example/json", FetchParams::new())
        .await?;
    assert_eq!(res.response_type, ResponseType::Json);
    assert_eq!(res.body, Body::Json(serde_json::json!({"a": [1, 2]})));

    let res = gateway
        .fetch("https://api.example/xml", FetchParams::new())
        .await?;
    assert_eq!(res.response_type, ResponseType::Text);
    assert_eq!(res.body.as_text(), Some("<rss/>"));

    let res = gateway
        .fetch("https://api.example/png", FetchParams::new())
        .await?;
    assert_eq!(res.response_type, ResponseType::ArrayBuffer);
    assert_eq!(res.body.as_bytes(), Some(&Bytes::from_static(b"\x89PNG")));

    let res = gateway
        .fetch(
            "https://api.example/json",
            FetchParams::new().with_response_type(ResponseType::ArrayBuffer),
        )
        .await?;
    assert_eq!(res.response_type, ResponseType::ArrayBuffer);

    let err = gateway
        .fetch(
            "https://api.example/xml",
            FetchParams::new().with_response_type(ResponseType::Json),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedBody);
    Ok(())
}

#[tokio::test]
async fn multipart_response_becomes_form_entries() -> Result<()> {
    let body: &'static [u8] = b"--xyz\r\n\
Content-Disposition: form-data; name=\"title\"\r\n\r\n\
hello\r\n\
--xyz\r\n\
Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
abc\r\n\
--xyz--\r\n";
    let gateway = Gateway::builder(answering(move |request| {
        respond(request, "multipart/form-data; boundary=xyz", body)
    }))
    .resolver(public_resolver())
    .build();

    let res = gateway
        .fetch("https://api.example/form", FetchParams::new())
        .await?;
    assert_eq!(res.response_type, ResponseType::FormData);
    let entries = res.body.as_form_data().expect("form entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], ("title".to_string(), FormValue::Text("hello".into())));
    let file = entries[1].1.as_file().expect("file entry");
    assert_eq!(file.name, "a.txt");
    assert_eq!(file.mime_type, "text/plain");
    assert_eq!(file.data, Bytes::from_static(b"abc"));
    Ok(())
}

#[tokio::test]
async fn result_reports_status() -> Result<()> {
    let gateway = Gateway::builder(answering(|request| {
        TransportResponse::new(request.url.clone(), StatusCode::NOT_FOUND)
            .with_redirected(true)
            .with_body("gone")
    }))
    .resolver(public_resolver())
    .build();
    let res = gateway
        .fetch("https://api.example/missing", FetchParams::new())
        .await?;
    assert!(!res.ok);
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert_eq!(res.status_text, "Not Found");
    assert!(res.redirected);
    assert_eq!(res.url.as_str(), "https://api.example/missing");
    Ok(())
}

#[tokio::test]
async fn upstream_reason_phrase_is_kept() -> Result<()> {
    let gateway = Gateway::builder(answering(|request| {
        TransportResponse::new(request.url.clone(), StatusCode::IM_A_TEAPOT)
            .with_status_text("Short And Stout")
    }))
    .resolver(public_resolver())
    .build();
    let res = gateway
        .fetch("https://api.example/brew", FetchParams::new())
        .await?;
    assert_eq!(res.status, StatusCode::IM_A_TEAPOT);
    assert_eq!(res.status_text, "Short And Stout");
    Ok(())
}

#[tokio::test]
async fn static_headers_override_caller_headers() -> Result<()> {
    let (transport, recorded) = recording_transport();
    let mut fixed = HeaderMap::new();
    fixed.insert(AUTHORIZATION, HeaderValue::from_static("Bearer host-token"));
    let gateway = Gateway::builder(transport)
        .static_headers(fixed)
        .resolver(public_resolver())
        .build();

    let res = gateway
        .fetch(
            "https://api.example/",
            FetchParams::new()
                .with_header(AUTHORIZATION, HeaderValue::from_static("Bearer guest"))
                .with_header(HOST, HeaderValue::from_static("evil.example"))
                .with_header(
                    http::HeaderName::from_static("x-trace"),
                    HeaderValue::from_static("1"),
                ),
        )
        .await?;
    assert_eq!(res.headers.get("x-upstream").map(HeaderValue::as_bytes), Some(&b"yes"[..]));

    let sent = recorded.requests();
    let headers = &sent[0].headers;
    let auth: Vec<_> = headers.get_all(AUTHORIZATION).iter().collect();
    assert_eq!(auth, ["Bearer host-token"]);
    assert_eq!(headers.get("x-trace").map(HeaderValue::as_bytes), Some(&b"1"[..]));
    assert!(headers.get(HOST).is_none());
    Ok(())
}

#[tokio::test]
async fn computed_static_headers_see_the_url() -> Result<()> {
    let (transport, recorded) = recording_transport();
    let gateway = Gateway::builder(transport)
        .static_headers_fn(|url| {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(url.host_str().unwrap_or_default()) {
                headers.insert("x-target", value);
            }
            headers
        })
        .resolver(public_resolver())
        .build();

    gateway
        .fetch("https://one.example/", FetchParams::new())
        .await?;
    gateway
        .fetch("https://two.example/", FetchParams::new())
        .await?;
    let targets: Vec<_> = recorded
        .requests()
        .iter()
        .map(|r| r.headers["x-target"].clone())
        .collect();
    assert_eq!(targets, ["one.example", "two.example"]);
    Ok(())
}

#[tokio::test]
async fn request_bodies_are_encoded() -> Result<()> {
    let (transport, recorded) = recording_transport();
    let gateway = Gateway::builder(transport)
        .resolver(public_resolver())
        .build();

    gateway
        .fetch(
            "https://api.example/text",
            FetchParams::new()
                .with_method(Method::POST)
                .with_body("plain"),
        )
        .await?;
    gateway
        .fetch(
            "https://api.example/form",
            FetchParams::new().with_method(Method::POST).with_body(vec![
                FormEntry::text("title", "hello"),
                FormEntry::file(
                    "doc",
                    FileEntry::new("a.txt", "text/plain", Bytes::from_static(b"abc")),
                ),
            ]),
        )
        .await?;

    let sent = recorded.requests();
    assert_eq!(sent[0].method, Method::POST);
    assert_eq!(sent[0].headers[CONTENT_TYPE], "text/plain;charset=UTF-8");
    assert_eq!(sent[0].body.as_deref(), Some(&b"plain"[..]));

    let content_type = sent[1].headers[CONTENT_TYPE].to_str()?;
    let boundary = content_type
        .strip_prefix("multipart/form-data; boundary=")
        .expect("multipart content type");
    let body = String::from_utf8(sent[1].body.clone().unwrap_or_default().to_vec())?;
    assert!(body.starts_with(&format!("--{boundary}\r\n")));
    assert!(body.contains("name=\"title\"\r\n\r\nhello\r\n"));
    assert!(body.contains("name=\"doc\"; filename=\"a.txt\"\r\nContent-Type: text/plain\r\n\r\nabc\r\n"));
    assert!(body.ends_with(&format!("--{boundary}--\r\n")));
    Ok(())
}

#[tokio::test]
async fn static_content_type_wins_over_form_encoding() -> Result<()> {
    let (transport, recorded) = recording_transport();
    let mut fixed = HeaderMap::new();
    fixed.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    let gateway = Gateway::builder(transport)
        .static_headers(fixed)
        .resolver(public_resolver())
        .build();

    gateway
        .fetch(
            "https://api.example/form",
            FetchParams::new()
                .with_method(Method::POST)
                .with_body(vec![FormEntry::blob("raw", Bytes::from_static(b"\x00\x01"), None)]),
        )
        .await?;
    let sent = recorded.requests();
    assert_eq!(sent[0].headers[CONTENT_TYPE], "application/octet-stream");
    let body = sent[0].body.clone().unwrap_or_default();
    assert!(body.windows(b"filename=\"blob\"".len()).any(|w| w == b"filename=\"blob\""));
    Ok(())
}
