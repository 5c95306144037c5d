// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Snapshot of the inbound request

use access_log_utils::pingora::SessionWrapper;
use http::header;
use log::debug;
use multer::Multipart;
use percent_encoding::percent_decode_str;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::document::{RequestPart, Timestamp, UploadedFile};

/// Parses the value of a header like `X-Request-Start` set by a front-end server.
///
/// Accepted are seconds, milliseconds or microseconds since the Unix epoch, optionally prefixed
/// with `t=` as nginx and Apache do it.
pub fn parse_start_header(value: &str) -> Option<Timestamp> {
    let value = value.trim();
    let value = value.strip_prefix("t=").unwrap_or(value);
    let mut secs: f64 = value.parse().ok()?;
    if secs > 1e14 {
        secs /= 1e6;
    } else if secs > 1e11 {
        secs /= 1e3;
    }
    Timestamp::from_secs(secs)
}

/// Repeated keys turn the value into an array.
fn insert_value(map: &mut Map<String, Value>, key: String, value: Value) {
    match map.get_mut(&key) {
        Some(Value::Array(values)) => values.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            map.insert(key, value);
        }
    }
}

fn parse_form(input: &str) -> Option<Map<String, Value>> {
    let pairs: Vec<(String, String)> = match serde_urlencoded::from_str(input) {
        Ok(pairs) => pairs,
        Err(err) => {
            debug!("Failed decoding form data: {err}");
            return None;
        }
    };

    let mut map = Map::new();
    for (key, value) in pairs {
        insert_value(&mut map, key, value.into());
    }
    Some(map).filter(|map| !map.is_empty())
}

fn parse_cookies(cookies: &str) -> Option<Map<String, Value>> {
    let decode = |value: &str| percent_decode_str(value.trim()).decode_utf8_lossy().into_owned();

    let mut map = Map::new();
    for cookie in cookies.split(';').filter(|cookie| !cookie.trim().is_empty()) {
        let (name, value) = cookie.split_once('=').unwrap_or((cookie, ""));
        insert_value(&mut map, decode(name), decode(value).into());
    }
    Some(map).filter(|map| !map.is_empty())
}

#[derive(Debug, Default)]
struct FormData {
    fields: Option<Map<String, Value>>,
    files: Option<Vec<UploadedFile>>,
}

/// Splits a `multipart/form-data` body into form fields and uploaded files. Parsing stops at the
/// first malformed part, keeping whatever was found before it.
async fn parse_multipart(body: &[u8], boundary: String) -> FormData {
    let mut multipart = Multipart::with_reader(body, boundary);
    let mut fields = Map::new();
    let mut files = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                debug!("Failed parsing multipart request body: {err}");
                break;
            }
        };

        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        let file_name = field.file_name().map(str::to_owned);
        let content_type = field.content_type().map(ToString::to_string);
        let content = match field.bytes().await {
            Ok(content) => content,
            Err(err) => {
                debug!("Failed reading multipart field {name}: {err}");
                break;
            }
        };

        match file_name {
            Some(file_name) => files.push(UploadedFile {
                field: name,
                name: file_name,
                content_type,
                size: content.len(),
            }),
            None => insert_value(
                &mut fields,
                name,
                String::from_utf8_lossy(&content).into_owned().into(),
            ),
        }
    }

    FormData {
        fields: Some(fields).filter(|fields| !fields.is_empty()),
        files: Some(files).filter(|files| !files.is_empty()),
    }
}

/// Fills in `post`, `rawpost` and `files` depending on the content type of the body.
async fn capture_body(part: &mut RequestPart, content_type: &str, body: &[u8]) {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "multipart/form-data" => match multer::parse_boundary(content_type) {
            Ok(boundary) => {
                let form = parse_multipart(body, boundary).await;
                part.post = form.fields;
                part.files = form.files;
            }
            Err(err) => debug!("Ignoring multipart request body: {err}"),
        },
        "application/x-www-form-urlencoded" => {
            let body = String::from_utf8_lossy(body);
            part.post = parse_form(&body);
            part.rawpost = Some(body.into_owned());
        }
        _ => part.rawpost = Some(String::from_utf8_lossy(body).into_owned()),
    }
}

fn header_str<'a>(
    session: &'a impl SessionWrapper,
    name: impl header::AsHeaderName,
) -> Option<&'a str> {
    session
        .get_header(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn client_ip(session: &impl SessionWrapper) -> Option<String> {
    header_str(session, "x-forwarded-for")
        .or_else(|| header_str(session, "client-ip"))
        .map(str::to_owned)
        .or_else(|| session.client_addr().map(|addr| addr.ip().to_string()))
}

fn server_snapshot(session: &impl SessionWrapper) -> BTreeMap<String, String> {
    let header = session.req_header();
    let mut server = BTreeMap::new();
    for (name, value) in header.headers.iter() {
        let key = format!("http_{}", name.as_str().replace('-', "_"));
        let value = String::from_utf8_lossy(value.as_bytes());
        server
            .entry(key)
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    server.insert("request_method".to_owned(), header.method.to_string());
    server.insert("request_uri".to_owned(), header.uri.to_string());
    server.insert("server_protocol".to_owned(), format!("{:?}", header.version));
    if let Some(addr) = session.client_addr() {
        server.insert("remote_addr".to_owned(), addr.ip().to_string());
        server.insert("remote_port".to_owned(), addr.port().to_string());
    }
    server
}

/// Returns `true` if the request header announces a request body.
pub(crate) fn expects_body(session: &impl SessionWrapper) -> bool {
    session.get_header(header::TRANSFER_ENCODING).is_some()
        || header_str(session, header::CONTENT_LENGTH)
            .and_then(|length| length.parse::<u64>().ok())
            .is_some_and(|length| length > 0)
}

/// Captures the request data of the session along with the request body if any.
///
/// `capture_server` adds a snapshot of all request headers and connection data under `server`.
pub(crate) async fn capture(
    session: &mut impl SessionWrapper,
    start: Timestamp,
    body: Option<&[u8]>,
    capture_server: bool,
) -> RequestPart {
    let mut part = RequestPart::new(start);
    let content_type = {
        let session = &*session;
        let uri = session.uri();

        part.method = Some(session.req_header().method.to_string());
        part.url.scheme = Some(
            uri.scheme_str()
                .or_else(|| header_str(session, "x-forwarded-proto"))
                .unwrap_or("http")
                .to_ascii_lowercase(),
        );
        part.url.host = session.host().map(|host| host.into_owned());
        part.url.uri = uri.path_and_query().map(|uri| uri.as_str().to_owned());
        part.ip = client_ip(session);
        part.referer = header_str(session, header::REFERER).map(str::to_owned);
        part.useragent = header_str(session, header::USER_AGENT).map(str::to_owned);
        part.get = uri.query().and_then(parse_form);
        part.cookies = header_str(session, header::COOKIE).and_then(parse_cookies);

        if capture_server {
            part.server = Some(server_snapshot(session));
        }

        header_str(session, header::CONTENT_TYPE)
            .unwrap_or_default()
            .to_owned()
    };

    if let Some(body) = body.filter(|body| !body.is_empty()) {
        capture_body(&mut part, &content_type, body).await;
    }

    part
}
