//! Live Response: interactive sessions on a single device.
//!
//! A session is a multi-step async flow:
//!
//! 1. POST `.../liveresponse/sessions` with the device id; returns a
//!    session in `PENDING` state.
//! 2. Poll GET `.../sessions/{session_id}` until the sensor checks in and
//!    the session becomes `ACTIVE`.
//! 3. POST `.../sessions/{session_id}/commands` for each command, then poll
//!    GET `.../commands/{command_id}` until it is `complete` (or `error`).
//! 4. For file retrieval, GET `.../files/{file_id}/content` returns the raw
//!    bytes.
//! 5. PUT `.../sessions/{session_id}` with `status: CLOSE` ends the session.
//!
//! Sessions expire on the server when idle. When a command is rejected
//! with 404 because the session no longer exists, [`LiveResponseSession::execute`]
//! opens a fresh session on the same device and retries, up to
//! [`MAX_SESSION_RETRIES`] times.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::client::ApiClient;
use crate::error::{ApiError, Result};
use crate::job::{PollConfig, poll_until};

const SESSIONS_PATH: &str = "/appservices/v6/orgs/{org_key}/liveresponse/sessions";

/// Session re-establishments attempted by one command before giving up.
pub const MAX_SESSION_RETRIES: usize = 5;

// ── Request types ──────────────────────────────────────────────────────

/// A command run inside a session. Serialized with the server's
/// space-separated command names.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "name")]
pub enum Command {
    /// Stage a file from the device for download.
    #[serde(rename = "get file")]
    GetFile {
        /// Absolute path on the device.
        path: String,
    },
    /// List a directory.
    #[serde(rename = "directory list")]
    DirectoryList {
        /// Directory path (a trailing separator is expected by the sensor).
        path: String,
    },
    /// Start a process.
    #[serde(rename = "create process")]
    CreateProcess {
        /// Command line.
        path: String,
        /// Wait for the process to exit before completing.
        wait: bool,
        /// File on the device receiving the process output.
        #[serde(skip_serializing_if = "Option::is_none")]
        output_file: Option<String>,
    },
    /// Delete a file.
    #[serde(rename = "delete file")]
    DeleteFile {
        /// Absolute path on the device.
        path: String,
    },
    /// List running processes.
    #[serde(rename = "process list")]
    ProcessList,
}

// ── Response types ─────────────────────────────────────────────────────

/// One entry of a directory listing.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryEntry {
    /// File or directory name.
    pub filename: String,
    /// Attribute flags such as `DIRECTORY` or `ARCHIVE`.
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
}

impl DirectoryEntry {
    /// `true` for subdirectories.
    pub fn is_dir(&self) -> bool {
        self.attributes.iter().any(|a| a == "DIRECTORY")
    }
}

fn string_field(doc: &Value, key: &str) -> Option<String> {
    match doc.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ── Session ────────────────────────────────────────────────────────────

/// An open Live Response session.
#[derive(Debug)]
pub struct LiveResponseSession {
    api: Arc<ApiClient>,
    device_id: i64,
    session_id: String,
    poll: PollConfig,
}

impl LiveResponseSession {
    /// Opens a session on `device_id` and waits until it is active.
    ///
    /// # Errors
    ///
    /// - `ApiError::Timeout` if the sensor does not check in within
    ///   `poll.timeout`.
    /// - `ApiError::Api` if the session ends in any state other than
    ///   `ACTIVE`.
    pub async fn start(api: &Arc<ApiClient>, device_id: i64, poll: PollConfig) -> Result<Self> {
        let session_id = establish(api, device_id, &poll).await?;
        Ok(LiveResponseSession {
            api: Arc::clone(api),
            device_id,
            session_id,
            poll,
        })
    }

    /// Current server-side session id (changes if the session is re-established).
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Device this session is attached to.
    pub fn device_id(&self) -> i64 {
        self.device_id
    }

    fn session_path(&self, suffix: &str) -> String {
        format!(
            "{}/{}{suffix}",
            self.api.path(SESSIONS_PATH, None, None),
            self.session_id
        )
    }

    /// Runs `command` to completion and returns the final command document.
    ///
    /// A 404 from the session (expired or closed server-side) opens a new
    /// session and retries the command, at most [`MAX_SESSION_RETRIES`] times.
    #[instrument(skip(self), fields(device_id = self.device_id))]
    pub async fn execute(&mut self, command: &Command) -> Result<Value> {
        let mut retries = 0;
        loop {
            match self.submit_and_wait(command).await {
                Err(ApiError::ObjectNotFound { uri, .. }) if retries < MAX_SESSION_RETRIES => {
                    retries += 1;
                    warn!(
                        %uri,
                        attempt = retries,
                        "live response session no longer exists; re-establishing"
                    );
                    self.session_id = establish(&self.api, self.device_id, &self.poll).await?;
                }
                other => return other,
            }
        }
    }

    async fn submit_and_wait(&self, command: &Command) -> Result<Value> {
        let commands = self.session_path("/commands");
        let submitted = self.api.post_json(&commands, command).await?;
        let command_id = string_field(&submitted, "id").ok_or_else(|| {
            ApiError::Api(format!("command submission returned no id: {submitted}"))
        })?;

        let path = format!("{commands}/{command_id}");
        let api = &self.api;
        let what = format!("live response command {command_id}");
        poll_until(&self.poll, &what, move || {
            let path = path.clone();
            async move {
                let doc = api.get_object(&path, &[]).await?;
                match doc.get("status").and_then(Value::as_str) {
                    Some("complete") => Ok(Some(doc)),
                    Some("error") => Err(ApiError::Api(format!(
                        "live response command failed: {}",
                        doc.get("result_desc")
                            .and_then(Value::as_str)
                            .unwrap_or("no description")
                    ))),
                    _ => Ok(None),
                }
            }
        })
        .await
    }

    /// Downloads a file from the device.
    pub async fn get_file(&mut self, path: &str) -> Result<bytes::Bytes> {
        let done = self
            .execute(&Command::GetFile {
                path: path.to_string(),
            })
            .await?;
        let file_id = done
            .get("file_details")
            .and_then(|d| string_field(d, "file_id"))
            .ok_or_else(|| ApiError::Api(format!("get file returned no file id: {done}")))?;
        self.api
            .get_raw_data(&self.session_path(&format!("/files/{file_id}/content")))
            .await
    }

    /// Lists a directory on the device.
    pub async fn list_directory(&mut self, path: &str) -> Result<Vec<DirectoryEntry>> {
        let done = self
            .execute(&Command::DirectoryList {
                path: path.to_string(),
            })
            .await?;
        let files = done.get("files").cloned().unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(files)?)
    }

    /// Starts a process and returns its pid when the sensor reports one.
    ///
    /// With `output_file`, the process output is written there on the
    /// device and can be fetched with [`LiveResponseSession::get_file`].
    pub async fn create_process(
        &mut self,
        command_line: &str,
        wait: bool,
        output_file: Option<&str>,
    ) -> Result<Option<i64>> {
        let done = self
            .execute(&Command::CreateProcess {
                path: command_line.to_string(),
                wait,
                output_file: output_file.map(str::to_string),
            })
            .await?;
        Ok(done
            .get("process_details")
            .and_then(|d| d.get("pid"))
            .and_then(Value::as_i64))
    }

    /// Deletes a file on the device.
    pub async fn delete_file(&mut self, path: &str) -> Result<()> {
        self.execute(&Command::DeleteFile {
            path: path.to_string(),
        })
        .await
        .map(drop)
    }

    /// Closes the session.
    pub async fn close(self) -> Result<()> {
        let body = json!({ "session_id": self.session_id, "status": "CLOSE" });
        self.api
            .put_object(&self.session_path(""), &body)
            .await?
            .error_for_status()?;
        info!(session_id = %self.session_id, "closed live response session");
        Ok(())
    }
}

/// Opens a session and polls it until `ACTIVE`, returning its id.
async fn establish(api: &ApiClient, device_id: i64, poll: &PollConfig) -> Result<String> {
    let base = api.path(SESSIONS_PATH, None, None);
    let created = api.post_json(&base, &json!({ "device_id": device_id })).await?;
    let session_id = string_field(&created, "id")
        .ok_or_else(|| ApiError::Api(format!("session creation returned no id: {created}")))?;
    info!(%session_id, device_id, "opened live response session");

    let path = format!("{base}/{session_id}");
    let what = format!("live response session {session_id}");
    poll_until(poll, &what, move || {
        let path = path.clone();
        async move {
            let doc = api.get_object(&path, &[]).await?;
            match doc.get("status").and_then(Value::as_str) {
                Some("ACTIVE") => Ok(Some(())),
                Some("PENDING") | None => Ok(None),
                Some(other) => Err(ApiError::Api(format!(
                    "live response session {} ended in state {other}",
                    path.rsplit('/').next().unwrap_or_default()
                ))),
            }
        }
    })
    .await?;
    Ok(session_id)
}
