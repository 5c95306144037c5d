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

//! Reporting of access log failures

use access_log_utils::pingora::{Error, ErrorType};
use log::error;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Sink configuration is incomplete, e.g. no directory for the file sink
pub const CONFIGURATION_MISSING: ErrorType = ErrorType::Custom("ConfigurationMissing");

/// Sink could not be reached, e.g. network failure or timeout
pub const SINK_UNREACHABLE: ErrorType = ErrorType::Custom("SinkUnreachable");

/// Sink responded but did not accept the document
pub const SINK_REJECTED: ErrorType = ErrorType::Custom("SinkRejected");

/// How access log failures affect the request being logged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Escalation {
    /// Failures are logged, the request proceeds normally
    #[default]
    Log,
    /// Failures are logged and returned to the caller, failing the request
    Fail,
}

impl From<bool> for Escalation {
    fn from(escalate: bool) -> Self {
        if escalate {
            Self::Fail
        } else {
            Self::Log
        }
    }
}

/// Single exit point for configuration and sink failures
///
/// Every failure passed to [`EscapeHatch::report`] produces exactly one diagnostic log entry.
#[derive(Debug, Default)]
pub struct EscapeHatch {
    policy: Escalation,
    reported: AtomicUsize,
}

impl EscapeHatch {
    /// Creates an escape hatch with the given policy.
    pub fn new(policy: Escalation) -> Self {
        Self {
            policy,
            reported: AtomicUsize::new(0),
        }
    }

    /// Policy applied by this escape hatch
    pub fn policy(&self) -> Escalation {
        self.policy
    }

    /// Logs the failure. The error is handed back only if failures should be escalated.
    pub fn report(&self, err: Box<Error>) -> Result<(), Box<Error>> {
        self.reported.fetch_add(1, Ordering::Relaxed);
        error!("Access log failure: {err}");
        match self.policy {
            Escalation::Log => Ok(()),
            Escalation::Fail => Err(err),
        }
    }

    /// Number of failures reported since creation
    pub fn reported(&self) -> usize {
        self.reported.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn policies() {
        let hatch = EscapeHatch::new(Escalation::Log);
        assert!(hatch
            .report(Error::explain(SINK_REJECTED, "status 500"))
            .is_ok());
        assert_eq!(hatch.reported(), 1);

        let hatch = EscapeHatch::new(Escalation::from(true));
        let err = hatch
            .report(Error::explain(SINK_UNREACHABLE, "connection refused"))
            .unwrap_err();
        assert_eq!(err.etype(), &SINK_UNREACHABLE);
        assert_eq!(hatch.reported(), 1);
    }
}
