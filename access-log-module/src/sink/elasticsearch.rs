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

//! Indexes documents in Elasticsearch
//!
//! The request part is stored as soon as the request starts, with `time` set to `-1` to mark it
//! as incomplete. Once the request is done, the same document is overwritten with request and
//! response fields merged.

use access_log_utils::pingora::{Error, ErrorType};
use async_trait::async_trait;
use log::{debug, trace};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

use super::DocumentWriter;
use crate::document::{RequestPart, ResponsePart};
use crate::escalation::{CONFIGURATION_MISSING, SINK_REJECTED, SINK_UNREACHABLE};
use crate::identifier::DocumentId;

/// Sink storing documents under `<endpoint>/_doc/<id>`
#[derive(Debug, Clone)]
pub struct ElasticsearchSink {
    endpoint: Option<String>,
    api_key: Option<String>,
    client: Client,
}

impl ElasticsearchSink {
    /// Creates a sink for the given index URL. `timeout` applies to each request.
    pub fn new(
        endpoint: Option<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, Box<Error>> {
        let client = Client::builder().timeout(timeout).build().map_err(|err| {
            Error::because(
                ErrorType::InternalError,
                "failed creating HTTP client",
                err,
            )
        })?;
        Ok(Self {
            endpoint: endpoint.filter(|endpoint| !endpoint.is_empty()),
            api_key: api_key.filter(|key| !key.is_empty()),
            client,
        })
    }

    pub(crate) fn bootstrap(&self, id: &DocumentId) -> Result<ElasticsearchWriter, Box<Error>> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            Error::explain(
                CONFIGURATION_MISSING,
                "elasticsearch sink requires log_endpoint setting",
            )
        })?;
        Ok(ElasticsearchWriter {
            url: format!("{}/_doc/{id}", endpoint.trim_end_matches('/')),
            api_key: self.api_key.clone(),
            client: self.client.clone(),
            request: Map::new(),
        })
    }
}

/// Upserts a single document, keeping the request fields around for the second write
#[derive(Debug)]
pub(crate) struct ElasticsearchWriter {
    url: String,
    api_key: Option<String>,
    client: Client,
    request: Map<String, Value>,
}

fn to_map(data: &impl Serialize) -> Result<Map<String, Value>, Box<Error>> {
    match serde_json::to_value(data) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::explain(
            ErrorType::InternalError,
            "access log document is not an object",
        )),
        Err(err) => Err(Error::because(
            ErrorType::InternalError,
            "failed serializing access log document",
            err,
        )),
    }
}

impl ElasticsearchWriter {
    async fn put(&self, document: &Map<String, Value>) -> Result<(), Box<Error>> {
        let body = serde_json::to_vec(document).map_err(|err| {
            Error::because(
                ErrorType::InternalError,
                "failed serializing access log document",
                err,
            )
        })?;

        let mut request = self
            .client
            .put(&self.url)
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .body(body);
        if let Some(api_key) = &self.api_key {
            request = request.header(AUTHORIZATION, format!("ApiKey {api_key}"));
        }

        let response = request.send().await.map_err(|err| {
            Error::because(
                SINK_UNREACHABLE,
                format!("failed sending document to {}", self.url),
                err,
            )
        })?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            if let Ok(text) = response.text().await {
                debug!("Elasticsearch response: {text}");
            }
            return Err(Error::explain(
                SINK_REJECTED,
                format!("Elasticsearch responded with status {status} for {}", self.url),
            ));
        }

        trace!("Stored document at {}, status {status}", self.url);
        Ok(())
    }
}

#[async_trait]
impl DocumentWriter for ElasticsearchWriter {
    async fn write_request(&mut self, request: &RequestPart) -> Result<(), Box<Error>> {
        let mut document = to_map(request)?;
        document.insert("time".to_owned(), (-1).into());
        self.request = document;
        self.put(&self.request).await
    }

    async fn write_response(&mut self, response: &ResponsePart) -> Result<(), Box<Error>> {
        let mut document = self.request.clone();
        document.extend(to_map(response)?);
        self.put(&document).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Bytes;
    use axum::extract::{Path, State};
    use axum::http::HeaderMap;
    use axum::routing::put;
    use axum::Router;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use test_log::test;
    use tokio::net::TcpListener;

    use crate::document::Timestamp;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone)]
    struct Index {
        status: StatusCode,
        delay: Duration,
        documents: Arc<Mutex<HashMap<String, Value>>>,
        puts: Arc<Mutex<Vec<HeaderMap>>>,
    }

    impl Index {
        fn new(status: StatusCode) -> Self {
            Self {
                status,
                delay: Duration::ZERO,
                documents: Default::default(),
                puts: Default::default(),
            }
        }
    }

    async fn put_document(
        State(index): State<Index>,
        Path((_, id)): Path<(String, String)>,
        headers: HeaderMap,
        body: Bytes,
    ) -> StatusCode {
        tokio::time::sleep(index.delay).await;
        index.puts.lock().unwrap().push(headers);
        if index.status.is_success() {
            let document = serde_json::from_slice(&body).unwrap();
            index.documents.lock().unwrap().insert(id, document);
        }
        index.status
    }

    async fn serve(index: Index) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/{index}/_doc/{id}", put(put_document))
            .with_state(index);
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/access/")
    }

    fn request() -> RequestPart {
        let mut request = RequestPart::new(Timestamp::from_secs(1716979999.0).unwrap());
        request.method = Some("GET".to_owned());
        request
    }

    fn response() -> ResponsePart {
        ResponsePart {
            end_date: "2024-05-29T10:53:20Z".to_owned(),
            end_time: 1716980000.0,
            time: 1.0,
            http_code: 404,
            length: Some(9),
            headers: None,
            error: None,
            extra: None,
            inc_files: None,
            memory: None,
            memory_peak: None,
        }
    }

    #[test(tokio::test)]
    async fn merged_upsert() {
        let index = Index::new(StatusCode::CREATED);
        let endpoint = serve(index.clone()).await;
        let sink = ElasticsearchSink::new(Some(endpoint), Some("c2VjcmV0".to_owned()), TIMEOUT)
            .unwrap();
        let id = DocumentId::generate(Some("merged"));
        let mut writer = sink.bootstrap(&id).unwrap();

        writer.write_request(&request()).await.unwrap();
        assert_eq!(
            index.documents.lock().unwrap()[id.as_str()],
            json!({
                "start_date": "2024-05-29T10:53:19Z",
                "start_time": 1716979999.0,
                "method": "GET",
                "time": -1,
            })
        );

        writer.write_response(&response()).await.unwrap();
        let documents = index.documents.lock().unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(
            documents[id.as_str()],
            json!({
                "start_date": "2024-05-29T10:53:19Z",
                "start_time": 1716979999.0,
                "method": "GET",
                "end_date": "2024-05-29T10:53:20Z",
                "end_time": 1716980000.0,
                "time": 1.0,
                "http_code": 404,
                "length": 9,
            })
        );

        let puts = index.puts.lock().unwrap();
        assert_eq!(puts.len(), 2);
        for headers in puts.iter() {
            assert_eq!(
                headers[CONTENT_TYPE],
                "application/json; charset=utf-8"
            );
            assert_eq!(headers[AUTHORIZATION], "ApiKey c2VjcmV0");
        }
    }

    #[test(tokio::test)]
    async fn rejected() {
        let index = Index::new(StatusCode::INTERNAL_SERVER_ERROR);
        let endpoint = serve(index.clone()).await;
        let sink = ElasticsearchSink::new(Some(endpoint), None, TIMEOUT).unwrap();
        let mut writer = sink.bootstrap(&DocumentId::generate(None)).unwrap();

        let err = writer.write_request(&request()).await.unwrap_err();
        assert_eq!(err.etype(), &SINK_REJECTED);
        assert!(index.documents.lock().unwrap().is_empty());
        assert!(!index.puts.lock().unwrap()[0].contains_key(AUTHORIZATION));
    }

    #[test(tokio::test)]
    async fn unreachable() {
        let mut index = Index::new(StatusCode::OK);
        index.delay = Duration::from_secs(2);
        let endpoint = serve(index).await;
        let sink = ElasticsearchSink::new(Some(endpoint), None, Duration::from_millis(200)).unwrap();
        let mut writer = sink.bootstrap(&DocumentId::generate(None)).unwrap();
        let err = writer.write_response(&response()).await.unwrap_err();
        assert_eq!(err.etype(), &SINK_UNREACHABLE);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/access", listener.local_addr().unwrap());
        drop(listener);
        let sink = ElasticsearchSink::new(Some(endpoint), None, TIMEOUT).unwrap();
        let mut writer = sink.bootstrap(&DocumentId::generate(None)).unwrap();
        let err = writer.write_request(&request()).await.unwrap_err();
        assert_eq!(err.etype(), &SINK_UNREACHABLE);
    }

    #[test]
    fn configuration() {
        let sink = ElasticsearchSink::new(None, None, TIMEOUT).unwrap();
        let err = sink.bootstrap(&DocumentId::generate(None)).unwrap_err();
        assert_eq!(err.etype(), &CONFIGURATION_MISSING);
    }
}
