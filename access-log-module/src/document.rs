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

//! Request and response parts of an access log document
//!
//! Optional fields are left out of the JSON representation entirely rather than being written as
//! `null`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{SerializeTuple, Serializer};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A point in time with sub-second precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(SystemTime);

impl Timestamp {
    /// Samples the current time.
    pub fn now() -> Self {
        Self(SystemTime::now())
    }

    /// Converts seconds since the Unix epoch into a timestamp. Returns `None` for negative or
    /// out of range values.
    pub fn from_secs(secs: f64) -> Option<Self> {
        let duration = Duration::try_from_secs_f64(secs).ok()?;
        UNIX_EPOCH.checked_add(duration).map(Self)
    }

    /// Seconds since the Unix epoch
    pub fn secs(&self) -> f64 {
        self.0
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs_f64())
            .unwrap_or_default()
    }

    /// ISO 8601 representation in UTC with second precision, e.g. `2024-05-29T10:53:19Z`
    pub fn iso8601(&self) -> String {
        DateTime::<Utc>::from(self.0).to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Seconds passed since an earlier timestamp, zero if `earlier` is actually later
    pub fn seconds_since(&self, earlier: &Self) -> f64 {
        self.0
            .duration_since(earlier.0)
            .map(|duration| duration.as_secs_f64())
            .unwrap_or_default()
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        Self(time)
    }
}

/// URL components of the request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UrlPart {
    /// `http` or `https`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    /// Host name and port as requested by the client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Path and query string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl UrlPart {
    fn is_empty(&self) -> bool {
        self.scheme.is_none() && self.host.is_none() && self.uri.is_none()
    }
}

/// Metadata of a file uploaded with a `multipart/form-data` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedFile {
    /// Name of the form field
    pub field: String,
    /// File name supplied by the client
    pub name: String,
    /// Content type supplied by the client
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// File size in bytes
    pub size: usize,
}

/// Data captured when the request starts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestPart {
    /// Start time in ISO 8601 format
    pub start_date: String,
    /// Start time in seconds since the Unix epoch
    pub start_time: f64,
    /// Request method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request URL
    #[serde(skip_serializing_if = "UrlPart::is_empty")]
    pub url: UrlPart,
    /// Client IP address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Value of the `Referer` header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    /// Value of the `User-Agent` header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub useragent: Option<String>,
    /// Query string parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get: Option<Map<String, Value>>,
    /// Form fields of the request body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post: Option<Map<String, Value>>,
    /// Raw request body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rawpost: Option<String>,
    /// Uploaded files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<UploadedFile>>,
    /// Request cookies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookies: Option<Map<String, Value>>,
    /// Request headers and connection data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<BTreeMap<String, String>>,
}

impl RequestPart {
    /// Creates a request part containing nothing but the start time.
    pub fn new(start: Timestamp) -> Self {
        Self {
            start_date: start.iso8601(),
            start_time: start.secs(),
            method: None,
            url: UrlPart::default(),
            ip: None,
            referer: None,
            useragent: None,
            get: None,
            post: None,
            rawpost: None,
            files: None,
            cookies: None,
            server: None,
        }
    }
}

/// An error captured while processing the request
///
/// Serialized as a `[code, message, file, line]` tuple, `file` and `line` being `null` if the
/// location is unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    /// Error code, an HTTP status where applicable
    pub code: i64,
    /// Error message
    pub message: String,
    /// Source file where the error was recorded
    pub file: Option<String>,
    /// Line in the source file
    pub line: Option<u32>,
}

impl Serialize for ErrorEntry {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut tuple = serializer.serialize_tuple(4)?;
        tuple.serialize_element(&self.code)?;
        tuple.serialize_element(&self.message)?;
        tuple.serialize_element(&self.file)?;
        tuple.serialize_element(&self.line)?;
        tuple.end()
    }
}

/// Data captured when the request is done
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponsePart {
    /// End time in ISO 8601 format
    pub end_date: String,
    /// End time in seconds since the Unix epoch
    pub end_time: f64,
    /// Seconds elapsed between start and end
    pub time: f64,
    /// Response status, `0` if no response was sent
    pub http_code: u16,
    /// Number of response body bytes sent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    /// Response headers as `Name: value` lines
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<String>>,
    /// Errors captured while processing the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Vec<ErrorEntry>>,
    /// Extra data added by request handlers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<BTreeMap<String, Vec<Value>>>,
    /// Resources loaded while processing the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inc_files: Option<Vec<String>>,
    /// Resident memory of the process in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    /// Peak resident memory of the process in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_peak: Option<u64>,
}
