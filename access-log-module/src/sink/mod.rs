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

//! Backends persisting access log documents
//!
//! A [`Sink`] is selected once from configuration and shared by all requests. For each document
//! it creates a [`DocumentWriter`] holding whatever per-document state the backend needs.

mod elasticsearch;
mod file;

use access_log_utils::pingora::Error;
use async_trait::async_trait;
use std::fmt::Debug;

use crate::configuration::{AccessLogConf, SinkKind};
use crate::document::{RequestPart, ResponsePart};
use crate::identifier::DocumentId;

pub use elasticsearch::ElasticsearchSink;
pub use file::{FileSink, REQUEST_FILE, RESPONSE_FILE};

/// Writes the two parts of a single access log document
#[async_trait]
pub trait DocumentWriter: Debug + Send + Sync {
    /// Persists the request part, called when the request starts.
    async fn write_request(&mut self, request: &RequestPart) -> Result<(), Box<Error>>;

    /// Persists the response part, called once the request is done.
    async fn write_response(&mut self, response: &ResponsePart) -> Result<(), Box<Error>>;
}

/// Configured access log backend
#[derive(Debug, Clone)]
pub enum Sink {
    /// Writes documents into a directory tree
    File(FileSink),
    /// Indexes documents in Elasticsearch
    Elasticsearch(ElasticsearchSink),
}

impl Sink {
    /// Creates the sink selected by the configuration, `None` if access logging is disabled.
    ///
    /// Missing sink settings are not an error here, these are reported for each document by
    /// [`Sink::bootstrap`].
    pub fn from_conf(conf: &AccessLogConf) -> Result<Option<Self>, Box<Error>> {
        Ok(match conf.log_sink {
            None => None,
            Some(SinkKind::File) => Some(Self::File(FileSink::new(conf.log_dir.clone()))),
            Some(SinkKind::Elasticsearch) => Some(Self::Elasticsearch(ElasticsearchSink::new(
                conf.log_endpoint.clone(),
                conf.log_api_key.clone(),
                conf.timeout(),
            )?)),
        })
    }

    /// Validates the configuration and prepares the resources of a new document.
    pub async fn bootstrap(
        &self,
        id: &DocumentId,
    ) -> Result<Box<dyn DocumentWriter>, Box<Error>> {
        match self {
            Self::File(sink) => Ok(Box::new(sink.bootstrap(id).await?)),
            Self::Elasticsearch(sink) => Ok(Box::new(sink.bootstrap(id)?)),
        }
    }
}
