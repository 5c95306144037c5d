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

//! Per-request state machine writing the two parts of an access log document

use access_log_utils::pingora::Error;
use log::{debug, error, warn};
use serde::Serialize;
use std::cell::RefCell;
use std::sync::{Arc, Once};

use crate::annotations::Annotations;
use crate::configuration::ToleranceBasis;
use crate::document::{ErrorEntry, RequestPart, ResponsePart, Timestamp};
use crate::escalation::EscapeHatch;
use crate::identifier::DocumentId;
use crate::memory;
use crate::sink::{DocumentWriter, Sink};

/// Progress of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Nothing happened yet
    Idle,
    /// Sink resources prepared, or sink failed and the transaction is degraded
    Bootstrapped,
    /// Request part handed to the sink
    RequestCaptured,
    /// Waiting for the request to complete
    Running,
    /// Response part assembled
    ResponseCaptured,
    /// Done, nothing will be written any more
    Terminal,
}

/// Decides whether verbose response data is omitted for fast requests
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TolerancePolicy {
    /// Threshold in seconds, no suppression if `None`
    pub threshold: Option<f64>,
    /// Value compared against the threshold
    pub basis: ToleranceBasis,
}

impl TolerancePolicy {
    /// Returns `true` if headers, extra data and resources should be left out of the response
    /// part.
    pub fn suppresses(&self, start: &Timestamp, end: &Timestamp) -> bool {
        let Some(threshold) = self.threshold else {
            return false;
        };
        let value = match self.basis {
            ToleranceBasis::Elapsed => end.seconds_since(start),
            ToleranceBasis::EndTime => end.secs(),
        };
        value < threshold
    }
}

/// How the request ended, as seen by the host
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Response status, `0` if no response was sent
    pub http_code: u16,
    /// Number of response body bytes sent
    pub length: usize,
    /// Response headers as `Name: value` lines
    pub headers: Vec<String>,
    /// Error the host failed the request with
    pub error: Option<ErrorEntry>,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<ErrorEntry>> = const { RefCell::new(None) };
}

/// Installs a panic hook remembering message and source location of the last panic on each
/// thread. A transaction dropped while a panic unwinds the request records these in its response
/// part. The previously installed hook keeps running.
///
/// Calling this more than once has no effect.
pub fn install_panic_hook() {
    static INSTALLED: Once = Once::new();
    INSTALLED.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let payload = info.payload();
            let message = payload
                .downcast_ref::<&str>()
                .map(|message| (*message).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "request processing panicked".to_owned());
            let entry = ErrorEntry {
                code: 0,
                message,
                file: info.location().map(|location| location.file().to_owned()),
                line: info.location().map(|location| location.line()),
            };
            LAST_PANIC.with(|last| *last.borrow_mut() = Some(entry));
            previous(info);
        }));
    });
}

impl Outcome {
    fn aborted() -> Self {
        let panic = if std::thread::panicking() {
            LAST_PANIC.with(|last| last.borrow().clone())
        } else {
            None
        };
        Self {
            error: Some(panic.unwrap_or_else(|| ErrorEntry {
                code: 0,
                message: "request processing ended before completion".to_owned(),
                file: None,
                line: None,
            })),
            ..Default::default()
        }
    }
}

/// Response part logged in degraded mode, along with its ID
#[derive(Debug, Serialize)]
struct DiscardedDocument<'a> {
    id: &'a DocumentId,
    response: &'a ResponsePart,
}

/// Access log state of a single request
///
/// The request part is written by [`Transaction::capture_request`], the response part by
/// [`Transaction::finish`]. If the transaction is dropped after being armed but before
/// `finish` ran, the response part is still written from a spawned task, recording an aborted
/// request.
#[derive(Debug)]
pub struct Transaction {
    id: DocumentId,
    start: Timestamp,
    phase: Phase,
    writer: Option<Box<dyn DocumentWriter>>,
    tolerance: TolerancePolicy,
    hatch: Arc<EscapeHatch>,
    finalize_on_drop: bool,
}

impl Transaction {
    /// Creates an idle transaction.
    pub fn new(
        id: DocumentId,
        start: Timestamp,
        tolerance: TolerancePolicy,
        hatch: Arc<EscapeHatch>,
    ) -> Self {
        Self {
            id,
            start,
            phase: Phase::Idle,
            writer: None,
            tolerance,
            hatch,
            finalize_on_drop: true,
        }
    }

    /// Document ID of this transaction
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// Time the request started
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns `true` if the sink could not be prepared and documents go to the diagnostic log.
    pub fn is_degraded(&self) -> bool {
        self.phase > Phase::Idle && self.writer.is_none()
    }

    /// Prepares the sink for this document.
    ///
    /// A failure puts the transaction into degraded mode. It is reported to the escape hatch and
    /// only returned if failures are escalated.
    pub async fn bootstrap(&mut self, sink: &Sink) -> Result<(), Box<Error>> {
        if self.phase != Phase::Idle {
            return Ok(());
        }
        self.phase = Phase::Bootstrapped;

        match sink.bootstrap(&self.id).await {
            Ok(writer) => {
                self.writer = Some(writer);
                Ok(())
            }
            Err(err) => self.hatch.report(err),
        }
    }

    /// Writes the request part. Nothing is written in degraded mode.
    pub async fn capture_request(&mut self, request: &RequestPart) -> Result<(), Box<Error>> {
        if self.phase != Phase::Bootstrapped {
            return Ok(());
        }
        self.phase = Phase::RequestCaptured;

        match &mut self.writer {
            Some(writer) => match writer.write_request(request).await {
                Ok(()) => Ok(()),
                Err(err) => self.hatch.report(err),
            },
            None => Ok(()),
        }
    }

    /// Marks the transaction as running, from now on the response part will be written no
    /// matter how the request ends.
    pub fn arm(&mut self) {
        if self.phase == Phase::RequestCaptured {
            self.phase = Phase::Running;
        }
    }

    fn response_part(
        &self,
        end: Timestamp,
        outcome: Outcome,
        annotations: Option<Annotations>,
    ) -> ResponsePart {
        let (mut errors, extra, resources) = annotations
            .map(Annotations::into_parts)
            .unwrap_or_default();
        errors.extend(outcome.error);

        let verbose = !self.tolerance.suppresses(&self.start, &end);
        ResponsePart {
            end_date: end.iso8601(),
            end_time: end.secs(),
            time: end.seconds_since(&self.start),
            http_code: outcome.http_code,
            length: Some(outcome.length),
            headers: Some(outcome.headers).filter(|headers| verbose && !headers.is_empty()),
            error: Some(errors).filter(|errors| !errors.is_empty()),
            extra: Some(extra).filter(|extra| verbose && !extra.is_empty()),
            inc_files: Some(resources).filter(|resources| verbose && !resources.is_empty()),
            memory: memory::current(),
            memory_peak: memory::peak(),
        }
    }

    /// Writes the response part and makes the transaction terminal.
    ///
    /// This does something only the first time it is called on an armed transaction. Sink
    /// failures are reported to the escape hatch but never returned, the request cannot be
    /// failed at this point.
    pub async fn finish(&mut self, outcome: Outcome, annotations: Option<Annotations>) {
        if self.phase != Phase::Running {
            return;
        }

        let response = self.response_part(Timestamp::now(), outcome, annotations);
        self.phase = Phase::ResponseCaptured;

        match &mut self.writer {
            Some(writer) => {
                if let Err(err) = writer.write_response(&response).await {
                    if self.hatch.report(err).is_err() {
                        debug!("Not escalating access log failure after request completion");
                    }
                }
            }
            None => {
                let document = DiscardedDocument {
                    id: &self.id,
                    response: &response,
                };
                match serde_json::to_string(&document) {
                    Ok(document) => {
                        warn!("Access log sink unavailable, discarding document: {document}")
                    }
                    Err(err) => {
                        error!("Failed serializing access log document {}: {err}", self.id)
                    }
                }
            }
        }

        self.phase = Phase::Terminal;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finalize_on_drop || self.phase != Phase::Running {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(
                "Request {} ended without logging response, no runtime to write it",
                self.id
            );
            return;
        };

        let mut transaction = Self {
            id: self.id.clone(),
            start: self.start,
            phase: self.phase,
            writer: self.writer.take(),
            tolerance: self.tolerance,
            hatch: self.hatch.clone(),
            finalize_on_drop: false,
        };
        self.phase = Phase::Terminal;

        let outcome = Outcome::aborted();
        warn!("Request {} ended without logging response", self.id);
        runtime.spawn(async move {
            transaction.finish(outcome, None).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::{json, Value};
    use std::path::Path;
    use std::time::Duration;
    use test_log::test;

    use crate::escalation::{Escalation, CONFIGURATION_MISSING};
    use crate::sink::{FileSink, RESPONSE_FILE};

    fn transaction(tolerance: TolerancePolicy, hatch: &Arc<EscapeHatch>) -> Transaction {
        Transaction::new(
            DocumentId::generate(None),
            Timestamp::now(),
            tolerance,
            hatch.clone(),
        )
    }

    async fn start(transaction: &mut Transaction, sink: &Sink) {
        transaction.bootstrap(sink).await.unwrap();
        let request = RequestPart::new(Timestamp::now());
        transaction.capture_request(&request).await.unwrap();
        transaction.arm();
    }

    fn read_response(dir: &Path, id: &DocumentId) -> Vec<Value> {
        std::fs::read_to_string(dir.join(id.as_str()).join(RESPONSE_FILE))
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn annotated(id: &DocumentId) -> Annotations {
        let mut annotations = Annotations::new(id.clone());
        annotations.extra("user", "alice", true);
        annotations.resource("templates/index.html");
        annotations
    }

    fn outcome() -> Outcome {
        Outcome {
            http_code: 200,
            length: 11,
            headers: vec!["Content-Type: text/plain".to_owned()],
            error: None,
        }
    }

    #[test]
    fn tolerance() {
        let start = Timestamp::from_secs(1000.0).unwrap();
        let end = Timestamp::from_secs(1000.5).unwrap();

        assert!(!TolerancePolicy::default().suppresses(&start, &end));

        let elapsed = TolerancePolicy {
            threshold: Some(1.0),
            basis: ToleranceBasis::Elapsed,
        };
        assert!(elapsed.suppresses(&start, &end));
        assert!(!elapsed.suppresses(&start, &Timestamp::from_secs(1001.0).unwrap()));

        let end_time = TolerancePolicy {
            threshold: Some(1000.7),
            basis: ToleranceBasis::EndTime,
        };
        assert!(end_time.suppresses(&start, &end));
        assert!(!end_time.suppresses(&start, &Timestamp::from_secs(1000.7).unwrap()));
    }

    #[test(tokio::test)]
    async fn finishes_once() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = Sink::File(FileSink::new(Some(tmp.path().into())));
        let hatch = Arc::new(EscapeHatch::default());
        let mut transaction = transaction(TolerancePolicy::default(), &hatch);
        start(&mut transaction, &sink).await;
        assert_eq!(transaction.phase(), Phase::Running);

        let id = transaction.id().clone();
        transaction.finish(outcome(), Some(annotated(&id))).await;
        transaction.finish(outcome(), None).await;
        assert_eq!(transaction.phase(), Phase::Terminal);
        drop(transaction);

        let responses = read_response(tmp.path(), &id);
        assert_eq!(responses.len(), 1);
        let response = &responses[0];
        assert_eq!(response["http_code"], 200);
        assert_eq!(response["length"], 11);
        assert_eq!(response["headers"], json!(["Content-Type: text/plain"]));
        assert_eq!(response["extra"], json!({"user": ["alice"]}));
        assert_eq!(response["inc_files"], json!(["templates/index.html"]));
        assert!(response.get("error").is_none());
        assert!(response["time"].as_f64().unwrap() >= 0.0);
        assert_eq!(hatch.reported(), 0);
    }

    #[test(tokio::test)]
    async fn fast_requests_are_terse() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = Sink::File(FileSink::new(Some(tmp.path().into())));
        let hatch = Arc::new(EscapeHatch::default());
        let mut transaction = transaction(
            TolerancePolicy {
                threshold: Some(60.0),
                basis: ToleranceBasis::Elapsed,
            },
            &hatch,
        );
        start(&mut transaction, &sink).await;

        let id = transaction.id().clone();
        let mut annotations = annotated(&id);
        annotations.error(8, "undefined variable");
        transaction.finish(outcome(), Some(annotations)).await;

        let response = &read_response(tmp.path(), &id)[0];
        assert!(response.get("headers").is_none());
        assert!(response.get("extra").is_none());
        assert!(response.get("inc_files").is_none());
        assert_eq!(response["error"][0][0], 8);
        assert_eq!(response["error"][0][1], "undefined variable");
    }

    #[test(tokio::test)]
    async fn degraded_mode() {
        let sink = Sink::File(FileSink::new(None));
        let hatch = Arc::new(EscapeHatch::default());
        let mut transaction = transaction(TolerancePolicy::default(), &hatch);
        start(&mut transaction, &sink).await;
        assert!(transaction.is_degraded());
        assert_eq!(transaction.phase(), Phase::Running);

        transaction.finish(outcome(), None).await;
        assert_eq!(transaction.phase(), Phase::Terminal);
        assert_eq!(hatch.reported(), 1);
    }

    #[test(tokio::test)]
    async fn escalated_bootstrap_failure() {
        let sink = Sink::File(FileSink::new(None));
        let hatch = Arc::new(EscapeHatch::new(Escalation::Fail));
        let mut transaction = transaction(TolerancePolicy::default(), &hatch);

        let err = transaction.bootstrap(&sink).await.unwrap_err();
        assert_eq!(err.etype(), &CONFIGURATION_MISSING);
        transaction
            .capture_request(&RequestPart::new(Timestamp::now()))
            .await
            .unwrap();
        transaction.arm();
        assert_eq!(transaction.phase(), Phase::Running);
        assert_eq!(hatch.reported(), 1);
    }

    #[test(tokio::test)]
    async fn finalized_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = Sink::File(FileSink::new(Some(tmp.path().into())));
        let hatch = Arc::new(EscapeHatch::default());
        let mut transaction = transaction(TolerancePolicy::default(), &hatch);
        start(&mut transaction, &sink).await;
        let id = transaction.id().clone();
        drop(transaction);

        let responses = wait_for_response(tmp.path(), &id).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["http_code"], 0);
        assert_eq!(responses[0]["error"][0][0], 0);
        assert_eq!(
            responses[0]["error"][0][1],
            "request processing ended before completion"
        );
    }

    async fn wait_for_response(dir: &Path, id: &DocumentId) -> Vec<Value> {
        let path = dir.join(id.as_str()).join(RESPONSE_FILE);
        for _ in 0..100 {
            if std::fs::read_to_string(&path).is_ok_and(|contents| contents.ends_with('\n')) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        read_response(dir, id)
    }

    #[test(tokio::test)]
    async fn panic_location_recorded() {
        install_panic_hook();

        let tmp = tempfile::tempdir().unwrap();
        let sink = Sink::File(FileSink::new(Some(tmp.path().into())));
        let hatch = Arc::new(EscapeHatch::default());
        let mut transaction = transaction(TolerancePolicy::default(), &hatch);
        start(&mut transaction, &sink).await;
        let id = transaction.id().clone();

        let line = line!() + 3;
        let task = tokio::spawn(async move {
            let _transaction = transaction;
            panic!("template missing");
        });
        assert!(task.await.unwrap_err().is_panic());

        let responses = wait_for_response(tmp.path(), &id).await;
        assert_eq!(responses.len(), 1);
        let error = &responses[0]["error"][0];
        assert_eq!(error[0], 0);
        assert_eq!(error[1], "template missing");
        assert_eq!(error[2], file!());
        assert_eq!(error[3], line);
    }

    #[test(tokio::test)]
    async fn idle_transactions_write_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = Sink::File(FileSink::new(Some(tmp.path().into())));
        let hatch = Arc::new(EscapeHatch::default());
        let mut transaction = transaction(TolerancePolicy::default(), &hatch);
        transaction.finish(outcome(), None).await;
        assert_eq!(transaction.phase(), Phase::Idle);

        transaction.bootstrap(&sink).await.unwrap();
        drop(transaction);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let entries = std::fs::read_dir(tmp.path()).unwrap().count();
        assert_eq!(entries, 1);
        assert!(std::fs::read_dir(tmp.path())
            .unwrap()
            .flatten()
            .all(|entry| !entry.path().join(RESPONSE_FILE).exists()));
    }
}
