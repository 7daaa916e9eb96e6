//! JSON output types for the `backend-spawn` CLI.
//!
//! All stdout output is JSON only. Tracing logs go to stderr.
//! Schema version is fixed at "0.1".

use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: &str = "0.1";

/// Serialize `value` to a JSON string and print it as a single line to stdout.
///
/// This is the single place where stdout JSON output is written, ensuring the
/// stdout-is-JSON-only contract is enforced uniformly across all record types.
fn print_json_to_stdout(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).expect("JSON serialization failed")
    );
}

/// Top-level envelope used for every successful record.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response<T: Serialize> {
    pub schema_version: &'static str,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> Response<T> {
    pub fn new(kind: &'static str, data: T) -> Self {
        Response {
            schema_version: SCHEMA_VERSION,
            ok: true,
            kind,
            data,
        }
    }

    /// Serialize to a JSON string and print to stdout.
    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Top-level envelope for error records.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub schema_version: &'static str,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorResponse {
            schema_version: SCHEMA_VERSION,
            ok: false,
            kind: "error",
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

// ---------- Record payloads ----------

/// Emitted once when the child has been spawned.
#[derive(Debug, Serialize, Deserialize)]
pub struct SpawnData {
    pub pid: u32,
    pub argv: Vec<String>,
}

/// One line of child stdout.
#[derive(Debug, Serialize, Deserialize)]
pub struct LineData {
    pub line: String,
}

/// The terminal record for a child.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExitData {
    /// Exit classification: success | failed | sigquit | sigkill |
    /// dispatcher-exit | dispatcher-changed
    pub class: String,
}

/// Response for the `config` sub-command.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigData {
    /// Resolved config file path (it may not exist; defaults apply then).
    pub path: String,
    /// Effective, clamped nice value for spawned children.
    pub nice: i32,
}
