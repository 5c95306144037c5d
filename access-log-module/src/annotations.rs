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

//! Data accumulated by request handlers while a request is being processed

use access_log_utils::pingora::SessionWrapper;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::Location;

use crate::document::ErrorEntry;
use crate::identifier::DocumentId;

/// Errors, extra data and loaded resources of the current request
///
/// The access log handler stores an instance in the session extensions during the
/// `request_filter` phase and collects it in the `logging` phase. Handlers running in between
/// retrieve it with [`Annotations::of`].
#[derive(Debug, Clone, PartialEq)]
pub struct Annotations {
    id: DocumentId,
    errors: Vec<ErrorEntry>,
    extra: BTreeMap<String, Vec<Value>>,
    resources: Vec<String>,
}

impl Annotations {
    /// Creates an empty accumulator for the given document.
    pub fn new(id: DocumentId) -> Self {
        Self {
            id,
            errors: Vec::new(),
            extra: BTreeMap::new(),
            resources: Vec::new(),
        }
    }

    /// Retrieves the accumulator of the current request. Returns `None` if access logging is
    /// disabled for this request.
    pub fn of(session: &mut impl SessionWrapper) -> Option<&mut Self> {
        session.extensions_mut().get_mut()
    }

    /// ID of the document this request will be logged under
    pub fn document_id(&self) -> &DocumentId {
        &self.id
    }

    /// Adds extra data under the given key.
    ///
    /// Values under the same key are kept in the order they were added. If `append` is `false`,
    /// previously added values for this key are discarded.
    pub fn extra(&mut self, key: impl Into<String>, value: impl Into<Value>, append: bool) {
        let values = self.extra.entry(key.into()).or_default();
        if !append {
            values.clear();
        }
        values.push(value.into());
    }

    /// Records an error, along with the source location of the caller.
    #[track_caller]
    pub fn error(&mut self, code: i64, message: impl Into<String>) {
        let location = Location::caller();
        self.errors.push(ErrorEntry {
            code,
            message: message.into(),
            file: Some(location.file().to_owned()),
            line: Some(location.line()),
        });
    }

    /// Records an error with explicit location data.
    pub fn push_error(&mut self, entry: ErrorEntry) {
        self.errors.push(entry);
    }

    /// Records a resource, e.g. a file or template, that was loaded to produce the response.
    pub fn resource(&mut self, path: impl Into<String>) {
        self.resources.push(path.into());
    }

    /// Errors recorded so far, in the order they occurred
    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    /// Extra data recorded so far
    pub fn extras(&self) -> &BTreeMap<String, Vec<Value>> {
        &self.extra
    }

    /// Resources recorded so far
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub(crate) fn into_parts(self) -> (Vec<ErrorEntry>, BTreeMap<String, Vec<Value>>, Vec<String>) {
        (self.errors, self.extra, self.resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn annotations() -> Annotations {
        Annotations::new(DocumentId::generate(Some("test")))
    }

    #[test]
    fn extra_append_and_reset() {
        let mut annotations = annotations();
        annotations.extra("k", "a", true);
        annotations.extra("k", "b", false);
        annotations.extra("k", "c", true);
        annotations.extra("other", 42, true);
        annotations.extra("other", json!({"nested": true}), true);

        assert_eq!(annotations.extras()["k"], vec![json!("b"), json!("c")]);
        assert_eq!(
            annotations.extras()["other"],
            vec![json!(42), json!({"nested": true})]
        );
    }

    #[test]
    fn first_value_without_append() {
        let mut annotations = annotations();
        annotations.extra("k", "only", false);
        assert_eq!(annotations.extras()["k"], vec![json!("only")]);
    }

    #[test]
    fn errors_keep_order_and_location() {
        let mut annotations = annotations();
        annotations.error(1, "first");
        annotations.error(1, "first");
        annotations.push_error(ErrorEntry {
            code: 500,
            message: "second".to_owned(),
            file: None,
            line: None,
        });

        let errors = annotations.errors();
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].message, "first");
        assert_eq!(errors[1].message, "first");
        assert_eq!(errors[0].file.as_deref(), Some(file!()));
        assert_eq!(errors[1].line, errors[0].line.map(|line| line + 1));
        assert_eq!(errors[2].code, 500);
    }
}
