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

//! Handler for Pingora’s `request_filter` and `logging` phases

use access_log_utils::pingora::{Error, ErrorType, SessionWrapper};
use access_log_utils::{RequestFilter, RequestFilterResult};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use std::sync::Arc;

use crate::annotations::Annotations;
use crate::configuration::AccessLogConf;
use crate::document::{ErrorEntry, Timestamp};
use crate::escalation::EscapeHatch;
use crate::identifier::DocumentId;
use crate::request::{capture, expects_body, parse_start_header};
use crate::sink::Sink;
use crate::transaction::{Outcome, TolerancePolicy, Transaction};

/// Handler for Pingora’s `request_filter` and `logging` phases
#[derive(Debug)]
pub struct AccessLogHandler {
    conf: AccessLogConf,
    sink: Option<Sink>,
    hatch: Arc<EscapeHatch>,
}

impl TryFrom<AccessLogConf> for AccessLogHandler {
    type Error = Box<Error>;

    fn try_from(conf: AccessLogConf) -> Result<Self, Self::Error> {
        let sink = Sink::from_conf(&conf)?;
        if sink.is_none() {
            warn!("No access log sink configured, access logging is disabled");
        }
        let hatch = Arc::new(EscapeHatch::new(conf.log_escalate.into()));
        Ok(Self { conf, sink, hatch })
    }
}

impl AccessLogHandler {
    /// Returns `true` if a sink is configured.
    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Number of sink and configuration failures reported so far
    pub fn failures(&self) -> usize {
        self.hatch.reported()
    }

    fn document_id(&self, session: &impl SessionWrapper) -> DocumentId {
        let hint = self
            .conf
            .log_id_header
            .as_ref()
            .and_then(|name| session.get_header(name))
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty());
        DocumentId::generate(hint)
    }

    fn start_time(&self, session: &impl SessionWrapper) -> Timestamp {
        session
            .get_header(&self.conf.log_start_header)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_start_header)
            .unwrap_or_else(Timestamp::now)
    }

    /// Writes the request part and arms the transaction.
    async fn capture_request(
        &self,
        session: &mut impl SessionWrapper,
        transaction: &mut Transaction,
        body: Option<&[u8]>,
    ) -> Result<(), Box<Error>> {
        let start = transaction.start();
        let request = capture(session, start, body, self.conf.log_capture_server).await;
        let captured = transaction.capture_request(&request).await;
        transaction.arm();
        captured
    }
}

/// Per-request state of the access log handler
#[derive(Debug, Default)]
pub struct AccessLogCtx {
    transaction: Option<Transaction>,
    // Request body received so far, set while the request part waits for it
    body: Option<Vec<u8>>,
}

impl AccessLogCtx {
    /// Access log transaction of the current request, if logging started
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }
}

fn outcome(session: &impl SessionWrapper, e: Option<&Error>) -> Outcome {
    let mut outcome = Outcome {
        length: session.body_bytes_sent(),
        ..Default::default()
    };

    if let Some(header) = session.response_written() {
        outcome.http_code = header.status.as_u16();
        outcome.headers = header
            .headers
            .iter()
            .map(|(name, value)| format!("{name}: {}", String::from_utf8_lossy(value.as_bytes())))
            .collect();
    }

    outcome.error = e.map(|e| ErrorEntry {
        code: match e.etype() {
            ErrorType::HTTPStatus(status) => (*status).into(),
            _ => 0,
        },
        message: e.to_string(),
        file: None,
        line: None,
    });

    outcome
}

#[async_trait]
impl RequestFilter for AccessLogHandler {
    type Conf = AccessLogConf;
    type CTX = AccessLogCtx;

    fn new_ctx() -> Self::CTX {
        AccessLogCtx::default()
    }

    async fn request_filter(
        &self,
        session: &mut impl SessionWrapper,
        ctx: &mut Self::CTX,
    ) -> Result<RequestFilterResult, Box<Error>> {
        let Some(sink) = &self.sink else {
            return Ok(RequestFilterResult::Unhandled);
        };
        if ctx.transaction.is_some() {
            return Ok(RequestFilterResult::Unhandled);
        }

        let id = self.document_id(&*session);
        let start = self.start_time(&*session);
        let tolerance = TolerancePolicy {
            threshold: self.conf.log_tolerance,
            basis: self.conf.log_tolerance_basis,
        };
        let mut transaction = Transaction::new(id.clone(), start, tolerance, self.hatch.clone());

        let bootstrapped = transaction.bootstrap(sink).await;
        session.extensions_mut().insert(Annotations::new(id));

        if expects_body(&*session) {
            // Request part is written once the body is complete
            ctx.body = Some(Vec::new());
            ctx.transaction = Some(transaction);
            bootstrapped?;
            return Ok(RequestFilterResult::Unhandled);
        }

        let captured = self.capture_request(session, &mut transaction, None).await;

        // The response part is written even if the request fails below
        ctx.transaction = Some(transaction);

        bootstrapped.and(captured)?;
        Ok(RequestFilterResult::Unhandled)
    }

    async fn request_body_filter(
        &self,
        session: &mut impl SessionWrapper,
        body: Option<&Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<(), Box<Error>> {
        let Some(buffer) = ctx.body.as_mut() else {
            return Ok(());
        };

        if let Some(chunk) = body {
            let room = self.conf.log_body_limit.saturating_sub(buffer.len());
            if chunk.len() > room {
                debug!(
                    "Request body exceeds {} bytes, logging it truncated",
                    self.conf.log_body_limit
                );
            }
            buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }

        if !end_of_stream {
            return Ok(());
        }

        let body = ctx.body.take().unwrap_or_default();
        let Some(transaction) = ctx.transaction.as_mut() else {
            return Ok(());
        };
        self.capture_request(session, transaction, Some(&body)).await
    }

    async fn logging(
        &self,
        session: &mut impl SessionWrapper,
        e: Option<&Error>,
        ctx: &mut Self::CTX,
    ) {
        let Some(transaction) = ctx.transaction.as_mut() else {
            return;
        };

        if let Some(body) = ctx.body.take() {
            // Request body never completed, log whatever arrived
            if self
                .capture_request(session, transaction, Some(&body))
                .await
                .is_err()
            {
                debug!("Not escalating access log failure after request completion");
            }
        }

        let annotations = session.extensions_mut().remove::<Annotations>();
        let outcome = outcome(&*session, e);
        transaction.finish(outcome, annotations).await;
    }
}
