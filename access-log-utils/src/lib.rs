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

//! # Module helpers
//!
//! This crate contains the pieces shared by `access-log-module` and `access-log-server`: the
//! [`RequestFilter`] trait describing a handler with `request_filter`, `request_body_filter` and
//! `logging` phases,
//! the [`SessionWrapper`](pingora::SessionWrapper) abstraction these phases operate on and
//! loading of YAML configuration files.

pub mod pingora;

use async_trait::async_trait;
use bytes::Bytes;
use log::trace;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use std::fmt::Debug;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::pingora::{Error, ErrorType, SessionWrapper};

/// Request filter result indicating how the current request should be processed further
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RequestFilterResult {
    /// Response has been sent, no further processing should happen. Other Pingora phases should
    /// not be triggered.
    ResponseSent,

    /// Request has been handled and further request filters should not run. Response hasn’t been
    /// sent however, next Pingora phase should deal with that.
    Handled,

    /// Request filter could not handle this request, next request filter should run if it exists.
    #[default]
    Unhandled,
}

/// Trait to be implemented by request filters.
#[async_trait]
pub trait RequestFilter: Sized + Sync {
    /// Configuration type of this handler.
    type Conf;

    /// Per-request state of this handler, see [`ProxyHttp::CTX`](pingora::ProxyHttp::CTX)
    type CTX: Send;

    /// Creates a new instance of the handler from its configuration.
    fn new(conf: Self::Conf) -> Result<Self, Box<Error>>
    where
        Self::Conf: TryInto<Self, Error = Box<Error>>,
    {
        conf.try_into()
    }

    /// Creates a new state object, see [`ProxyHttp::new_ctx`](pingora::ProxyHttp::new_ctx)
    fn new_ctx() -> Self::CTX;

    /// Handler to run during Pingora’s `request_filter` phase, see
    /// [`ProxyHttp::request_filter`](pingora::ProxyHttp::request_filter). This uses a different
    /// return type to account for the existence of multiple request filters.
    async fn request_filter(
        &self,
        session: &mut impl SessionWrapper,
        ctx: &mut Self::CTX,
    ) -> Result<RequestFilterResult, Box<Error>>;

    /// Handler to run during Pingora’s `request_body_filter` phase, see
    /// [`ProxyHttp::request_body_filter`](pingora::ProxyHttp::request_body_filter).
    ///
    /// This is called for each chunk of the request body. `end_of_stream` is `true` for the last
    /// one.
    async fn request_body_filter(
        &self,
        _session: &mut impl SessionWrapper,
        _body: Option<&Bytes>,
        _end_of_stream: bool,
        _ctx: &mut Self::CTX,
    ) -> Result<(), Box<Error>> {
        Ok(())
    }

    /// Handler to run during Pingora’s `logging` phase, see
    /// [`ProxyHttp::logging`](pingora::ProxyHttp::logging).
    ///
    /// This phase runs once per request, regardless of whether processing succeeded. `e` is the
    /// error that terminated processing if any.
    async fn logging(
        &self,
        _session: &mut impl SessionWrapper,
        _e: Option<&Error>,
        _ctx: &mut Self::CTX,
    ) {
    }
}

/// Trait for configuration structures that can be loaded from YAML files. This trait has a blanket
/// implementation for any structure implementing [`serde::Deserialize`].
pub trait FromYaml {
    /// Loads configuration from a YAML file.
    fn load_from_yaml<P>(path: P) -> Result<Self, Box<Error>>
    where
        P: AsRef<Path>,
        Self: Sized;

    /// Loads configuration from a list of YAML files. Top-level settings of later files override
    /// the ones found in earlier files. An empty list produces the configuration of an empty
    /// document.
    fn load_from_files<P>(files: &[P]) -> Result<Self, Box<Error>>
    where
        P: AsRef<Path>,
        Self: Sized;

    /// Loads configuration from a YAML string.
    fn from_yaml(yaml: impl AsRef<str>) -> Result<Self, Box<Error>>
    where
        Self: Sized;
}

fn read_yaml(path: &Path) -> Result<Value, Box<Error>> {
    let file = File::open(path).map_err(|err| {
        Error::because(
            ErrorType::FileOpenError,
            format!("failed opening configuration file {}", path.display()),
            err,
        )
    })?;
    let reader = BufReader::new(file);

    serde_yaml::from_reader(reader).map_err(|err| {
        Error::because(
            ErrorType::FileReadError,
            format!("failed reading configuration file {}", path.display()),
            err,
        )
    })
}

impl<D> FromYaml for D
where
    D: DeserializeOwned + Debug + ?Sized,
{
    fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<Error>> {
        Self::load_from_files(&[path])
    }

    fn load_from_files<P: AsRef<Path>>(files: &[P]) -> Result<Self, Box<Error>> {
        let mut merged = Mapping::new();
        for path in files {
            match read_yaml(path.as_ref())? {
                Value::Mapping(mapping) => merged.extend(mapping),
                Value::Null => {}
                _ => {
                    return Err(Error::explain(
                        ErrorType::FileReadError,
                        format!(
                            "configuration file {} doesn’t contain a map",
                            path.as_ref().display()
                        ),
                    ))
                }
            }
        }

        let conf = serde_yaml::from_value(Value::Mapping(merged)).map_err(|err| {
            Error::because(
                ErrorType::FileReadError,
                "failed deserializing configuration",
                err,
            )
        })?;
        trace!("Loaded configuration files: {conf:#?}");

        Ok(conf)
    }

    fn from_yaml(yaml: impl AsRef<str>) -> Result<Self, Box<Error>> {
        let value: Value = serde_yaml::from_str(yaml.as_ref()).map_err(|err| {
            Error::because(ErrorType::ReadError, "failed parsing configuration", err)
        })?;
        let value = match value {
            Value::Null => Value::Mapping(Mapping::new()),
            value => value,
        };

        serde_yaml::from_value(value).map_err(|err| {
            Error::because(
                ErrorType::ReadError,
                "failed deserializing configuration",
                err,
            )
        })
    }
}
