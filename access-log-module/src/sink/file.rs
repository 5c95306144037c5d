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

//! Stores each document in its own directory

use access_log_utils::pingora::{Error, ErrorType};
use async_trait::async_trait;
use log::trace;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{DirBuilder, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::DocumentWriter;
use crate::document::{RequestPart, ResponsePart};
use crate::escalation::{CONFIGURATION_MISSING, SINK_UNREACHABLE};
use crate::identifier::DocumentId;

/// Name of the file receiving request parts
pub const REQUEST_FILE: &str = "req.log";

/// Name of the file receiving response parts
pub const RESPONSE_FILE: &str = "res.log";

/// Sink writing documents to `<dir>/<id>/req.log` and `<dir>/<id>/res.log`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSink {
    dir: Option<PathBuf>,
}

impl FileSink {
    /// Creates a sink storing documents under the given base directory.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub(crate) async fn bootstrap(&self, id: &DocumentId) -> Result<FileWriter, Box<Error>> {
        let dir = self
            .dir
            .as_ref()
            .filter(|dir| !dir.as_os_str().is_empty())
            .ok_or_else(|| {
                Error::explain(
                    CONFIGURATION_MISSING,
                    "file sink requires log_dir setting",
                )
            })?
            .join(id.as_str());

        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);
        builder.create(&dir).await.map_err(|err| {
            Error::because(
                SINK_UNREACHABLE,
                format!("failed creating log directory {}", dir.display()),
                err,
            )
        })?;

        Ok(FileWriter { dir })
    }
}

/// Appends the parts of a single document to its directory
#[derive(Debug)]
pub(crate) struct FileWriter {
    dir: PathBuf,
}

async fn append_line(path: &Path, data: &impl Serialize) -> Result<(), Box<Error>> {
    let mut line = serde_json::to_vec(data).map_err(|err| {
        Error::because(
            ErrorType::InternalError,
            "failed serializing access log document",
            err,
        )
    })?;
    line.push(b'\n');

    let write = async {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    };
    write.await.map_err(|err| {
        Error::because(
            SINK_UNREACHABLE,
            format!("failed writing {}", path.display()),
            err,
        )
    })?;

    trace!("Appended {} bytes to {}", line.len(), path.display());
    Ok(())
}

#[async_trait]
impl DocumentWriter for FileWriter {
    async fn write_request(&mut self, request: &RequestPart) -> Result<(), Box<Error>> {
        append_line(&self.dir.join(REQUEST_FILE), request).await
    }

    async fn write_response(&mut self, response: &ResponsePart) -> Result<(), Box<Error>> {
        append_line(&self.dir.join(RESPONSE_FILE), response).await
    }
}
