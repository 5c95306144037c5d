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

//! Document identifiers

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identifier correlating the request and response parts of an access log document
///
/// This is a hex-encoded SHA-256 digest, so it is safe to use as a directory name or URL segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Generates a document ID.
    ///
    /// With a hint, typically a request ID assigned by a front-end server, the result is derived
    /// from the hint alone: the same hint always produces the same ID. Without a hint, a fresh
    /// token is made up from current time and random data.
    pub fn generate(hint: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        match hint {
            Some(hint) => hasher.update(hint.as_bytes()),
            None => {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|time| time.as_nanos())
                    .unwrap_or_default();
                hasher.update(nanos.to_be_bytes());
                hasher.update(Uuid::new_v4().as_bytes());
            }
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Returns the ID as string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
