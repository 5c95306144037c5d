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

//! # Access Log Module for Pingora
//!
//! This crate records every request as a document with two parts. The request part is captured
//! and written as soon as the request starts. The response part is written once the request is
//! done, along with any errors, extra data and loaded resources other handlers recorded in the
//! meantime. Both parts are correlated by a document ID. A configuration could look like this:
//!
//! ```yaml
//! log_sink: elasticsearch
//! log_endpoint: http://localhost:9200/access
//! log_api_key: c2VjcmV0
//! log_timeout: 2
//! log_tolerance: 0.5
//! ```
//!
//! Two sinks are supported:
//!
//! * `file`: each document gets a directory `<log_dir>/<id>`, request part and response part are
//!   appended as JSON lines to `req.log` and `res.log` in it.
//! * `elasticsearch`: the document is stored under `<log_endpoint>/_doc/<id>`. The request part
//!   is written with `time` set to `-1`, then overwritten with request and response data merged.
//!
//! If `log_sink` isn’t set, access logging is disabled. All settings are also available as
//! command line options and `ACCESS_LOG_*` environment variables, see [`AccessLogOpt`].
//!
//! Sink failures never affect the request unless `log_escalate` is enabled. In that case a
//! failure to prepare the sink or to write the request part fails the request. Either way the
//! failure is logged and counted, see [`AccessLogHandler::failures`].
//!
//! With `log_tolerance` set, requests taking less than this many seconds are logged without
//! response headers, extra data and resources.
//!
//! Document IDs are random unless `log_id_header` names a request header to derive them from.
//! Requests with the same header value share a document, so only set this behind a trusted
//! front-end server assigning a unique value to each request.
//!
//! ## Code example
//!
//! `AccessLogHandler` handles the `request_filter` phase where it captures request data and
//! writes the request part. For requests with a body, the request part is written once the body
//! has been received in the `request_body_filter` phase. The response part is written during the `logging` phase. Handlers
//! running in between can add data to the document:
//!
//! ```rust
//! use access_log_module::{AccessLogConf, AccessLogHandler, Annotations};
//! use access_log_utils::pingora::{RequestHeader, TestSession};
//! use access_log_utils::{FromYaml, RequestFilter};
//!
//! # tokio_test_block_on(async {
//! let conf = AccessLogConf::from_yaml("log_sink: file\nlog_dir: /tmp/access").unwrap();
//! let handler = AccessLogHandler::new(conf).unwrap();
//!
//! let header = RequestHeader::build("GET", b"/", None).unwrap();
//! let mut session = TestSession::from(header);
//! let mut ctx = AccessLogHandler::new_ctx();
//! handler.request_filter(&mut session, &mut ctx).await.unwrap();
//!
//! if let Some(annotations) = Annotations::of(&mut session) {
//!     annotations.extra("user", "alice", true);
//! }
//!
//! handler.logging(&mut session, None, &mut ctx).await;
//! # });
//! # fn tokio_test_block_on(future: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Builder::new_current_thread()
//! #         .enable_all()
//! #         .build()
//! #         .unwrap()
//! #         .block_on(future)
//! # }
//! ```

mod annotations;
pub mod configuration;
pub mod document;
pub mod escalation;
mod handler;
pub mod identifier;
mod memory;
pub mod request;
pub mod sink;
pub mod transaction;

pub use annotations::Annotations;
pub use configuration::{AccessLogConf, AccessLogOpt};
pub use handler::{AccessLogCtx, AccessLogHandler};
