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

//! Structures handling command line options, environment files and YAML deserialization for the
//! Access Log Module

use access_log_utils::pingora::{Error, ErrorType};
use clap::{Parser, ValueEnum};
use http::HeaderName;
use log::warn;
use serde::de::{Deserializer, Error as _};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default timeout of Elasticsearch requests in seconds
pub const DEFAULT_TIMEOUT: f64 = 5.0;

/// Default number of request body bytes kept for the access log
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Backend persisting access log documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// A directory per document containing `req.log` and `res.log`, `file` in config file
    File,
    /// An Elasticsearch index, `elasticsearch` in config file
    Elasticsearch,
}

impl TryFrom<&str> for SinkKind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "file" => Ok(Self::File),
            "elasticsearch" => Ok(Self::Elasticsearch),
            other => Err(format!("Unsupported access log sink {other}")),
        }
    }
}

/// Value compared against the tolerance threshold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceBasis {
    /// Time between request start and end, `elapsed` in config file
    #[default]
    Elapsed,
    /// End timestamp in seconds since the Unix epoch, `end_time` in config file
    #[value(name = "end_time")]
    EndTime,
}

impl TryFrom<&str> for ToleranceBasis {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "elapsed" => Ok(Self::Elapsed),
            "end_time" => Ok(Self::EndTime),
            other => Err(format!("Unsupported tolerance basis {other}")),
        }
    }
}

/// Command line options of the access log module
///
/// Most options can also be set via environment variables.
#[derive(Debug, Default, Parser)]
pub struct AccessLogOpt {
    /// Access log sink: file or elasticsearch
    #[clap(long, env = "ACCESS_LOG_SINK", value_enum)]
    pub log_sink: Option<SinkKind>,

    /// Base directory of the file sink, each request gets a subdirectory
    #[clap(long, env = "ACCESS_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Elasticsearch index URL, e.g. http://localhost:9200/access
    #[clap(long, env = "ACCESS_LOG_ENDPOINT")]
    pub log_endpoint: Option<String>,

    /// Elasticsearch API key
    #[clap(long, env = "ACCESS_LOG_API_KEY", hide_env_values = true)]
    pub log_api_key: Option<String>,

    /// Timeout of Elasticsearch requests in seconds
    #[clap(long, env = "ACCESS_LOG_TIMEOUT")]
    pub log_timeout: Option<f64>,

    /// Requests faster than this many seconds are logged without headers, extra data and
    /// resource list
    #[clap(long, env = "ACCESS_LOG_TOLERANCE")]
    pub log_tolerance: Option<f64>,

    /// Value compared against the tolerance: elapsed or end_time
    #[clap(long, env = "ACCESS_LOG_TOLERANCE_BASIS", value_enum)]
    pub log_tolerance_basis: Option<ToleranceBasis>,

    /// Fail requests if the access log cannot be written
    #[clap(long, env = "ACCESS_LOG_ESCALATE")]
    pub log_escalate: bool,

    /// Request header used to derive the document ID. Only use this behind a trusted front-end
    /// server that sets the header for each request.
    #[clap(long)]
    pub log_id_header: Option<HeaderName>,

    /// Maximal number of request body bytes to log
    #[clap(long)]
    pub log_body_limit: Option<usize>,

    /// Request header containing the time the request was received by a front-end server
    #[clap(long)]
    pub log_start_header: Option<HeaderName>,

    /// File with ACCESS_LOG_* settings in KEY=VALUE format
    #[clap(long)]
    pub log_env_file: Option<PathBuf>,
}

fn deserialize_header_name<'de, D>(d: D) -> Result<HeaderName, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(d)?;
    HeaderName::try_from(name.as_str())
        .map_err(|err| D::Error::custom(format!("Invalid header name {name}: {err}")))
}

fn deserialize_optional_header_name<'de, D>(d: D) -> Result<Option<HeaderName>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_header_name(d).map(Some)
}

/// Configuration settings of the access log module
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AccessLogConf {
    /// Sink receiving the documents. If unset, access logging is disabled.
    pub log_sink: Option<SinkKind>,

    /// Base directory of the file sink
    pub log_dir: Option<PathBuf>,

    /// Elasticsearch index URL, documents are stored under `<log_endpoint>/_doc/<id>`
    pub log_endpoint: Option<String>,

    /// Elasticsearch API key, sent as `Authorization: ApiKey <key>` header if set
    pub log_api_key: Option<String>,

    /// Timeout of Elasticsearch requests in seconds
    pub log_timeout: f64,

    /// If set, requests faster than this are logged without headers, extra data and resource list
    pub log_tolerance: Option<f64>,

    /// Value compared against `log_tolerance`
    pub log_tolerance_basis: ToleranceBasis,

    /// If `true`, failures to write the access log fail the request
    pub log_escalate: bool,

    /// Request header used to derive the document ID. Requests carrying the same value share a
    /// document, so this should only be set behind a trusted front-end server assigning a unique
    /// value to each request. If unset, every request gets a fresh ID.
    #[serde(deserialize_with = "deserialize_optional_header_name")]
    pub log_id_header: Option<HeaderName>,

    /// Request header containing the time the request was received by a front-end server
    #[serde(deserialize_with = "deserialize_header_name")]
    pub log_start_header: HeaderName,

    /// If `true`, a snapshot of request headers and connection data is logged
    pub log_capture_server: bool,

    /// Maximal number of request body bytes to log, anything beyond that is cut off
    pub log_body_limit: usize,
}

impl Default for AccessLogConf {
    fn default() -> Self {
        Self {
            log_sink: None,
            log_dir: None,
            log_endpoint: None,
            log_api_key: None,
            log_timeout: DEFAULT_TIMEOUT,
            log_tolerance: None,
            log_tolerance_basis: ToleranceBasis::default(),
            log_escalate: false,
            log_id_header: None,
            log_start_header: HeaderName::from_static("x-request-start"),
            log_capture_server: true,
            log_body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

/// Parses the contents of an environment file.
///
/// Empty lines and lines starting with `#` are ignored, so are lines without `=`. Surrounding
/// quotes are removed from values.
pub fn parse_env_file(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(name, value)| {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            (name.trim().to_owned(), value.to_owned())
        })
        .collect()
}

fn parse_number(name: &str, value: &str) -> Option<f64> {
    match value.parse() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Ignoring invalid value of {name}: {err}");
            None
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl AccessLogConf {
    /// Timeout of Elasticsearch requests. Zero, negative and non-finite settings are replaced by
    /// [`DEFAULT_TIMEOUT`].
    pub fn timeout(&self) -> Duration {
        match Duration::try_from_secs_f64(self.log_timeout) {
            Ok(timeout) if !timeout.is_zero() => timeout,
            _ => {
                warn!(
                    "Invalid access log timeout {}, using {DEFAULT_TIMEOUT} seconds instead",
                    self.log_timeout
                );
                Duration::from_secs_f64(DEFAULT_TIMEOUT)
            }
        }
    }

    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: AccessLogOpt) {
        if opt.log_sink.is_some() {
            self.log_sink = opt.log_sink;
        }
        if opt.log_dir.is_some() {
            self.log_dir = opt.log_dir;
        }
        if opt.log_endpoint.is_some() {
            self.log_endpoint = opt.log_endpoint;
        }
        if opt.log_api_key.is_some() {
            self.log_api_key = opt.log_api_key;
        }
        if let Some(timeout) = opt.log_timeout {
            self.log_timeout = timeout;
        }
        if opt.log_tolerance.is_some() {
            self.log_tolerance = opt.log_tolerance;
        }
        if let Some(basis) = opt.log_tolerance_basis {
            self.log_tolerance_basis = basis;
        }
        if opt.log_escalate {
            self.log_escalate = true;
        }
        if opt.log_id_header.is_some() {
            self.log_id_header = opt.log_id_header;
        }
        if let Some(limit) = opt.log_body_limit {
            self.log_body_limit = limit;
        }
        if let Some(header) = opt.log_start_header {
            self.log_start_header = header;
        }
    }

    /// Merges `ACCESS_LOG_*` variables into the current configuration. Other variables are
    /// ignored, so are invalid values.
    pub fn merge_with_env(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (name, value) in vars {
            match name.as_str() {
                "ACCESS_LOG_SINK" => match SinkKind::try_from(value.as_str()) {
                    Ok(sink) => self.log_sink = Some(sink),
                    Err(err) => warn!("Ignoring {name}: {err}"),
                },
                "ACCESS_LOG_DIR" => self.log_dir = Some(value.into()),
                "ACCESS_LOG_ENDPOINT" => self.log_endpoint = Some(value),
                "ACCESS_LOG_API_KEY" => self.log_api_key = Some(value),
                "ACCESS_LOG_TIMEOUT" => {
                    if let Some(timeout) = parse_number(&name, &value) {
                        self.log_timeout = timeout;
                    }
                }
                "ACCESS_LOG_TOLERANCE" => {
                    if let Some(tolerance) = parse_number(&name, &value) {
                        self.log_tolerance = Some(tolerance);
                    }
                }
                "ACCESS_LOG_TOLERANCE_BASIS" => match ToleranceBasis::try_from(value.as_str()) {
                    Ok(basis) => self.log_tolerance_basis = basis,
                    Err(err) => warn!("Ignoring {name}: {err}"),
                },
                "ACCESS_LOG_ESCALATE" => self.log_escalate = parse_flag(&value),
                _ => {}
            }
        }
    }

    /// Reads an environment file and merges its `ACCESS_LOG_*` variables into the current
    /// configuration.
    pub fn merge_with_env_file(&mut self, path: &Path) -> Result<(), Box<Error>> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            Error::because(
                ErrorType::FileReadError,
                format!("failed reading environment file {}", path.display()),
                err,
            )
        })?;
        self.merge_with_env(parse_env_file(&contents));
        Ok(())
    }
}
