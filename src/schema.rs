//! JSON output types for the CLI client.
//!
//! All stdout output is JSON only. Tracing logs go to stderr.

use serde::{Deserialize, Serialize};

/// Serialize `value` to a JSON string and print it as a single line to stdout.
///
/// This is the single place where stdout JSON output is written, ensuring the
/// stdout-is-JSON-only contract is enforced uniformly across all output types.
fn print_json_to_stdout(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).expect("JSON serialization failed")
    );
}

/// Output of `start`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartOutput {
    #[serde(rename = "workerId")]
    pub worker_id: String,
}

/// Output of `stop`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StopOutput {
    #[serde(rename = "workerId")]
    pub worker_id: String,
    pub stopped: bool,
}

/// Output of `get-status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusOutput {
    #[serde(rename = "workerId")]
    pub worker_id: String,
    pub done: bool,
    pub state: String,
    #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// One line of `stream-output`: exactly one of the two fields is present.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamLine {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Error line emitted before a non-zero exit.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorOutput {
    pub error: String,
}

impl StartOutput {
    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

impl StopOutput {
    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

impl StatusOutput {
    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

impl StreamLine {
    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

impl ErrorOutput {
    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_output_omits_absent_fields() {
        let rendered = serde_json::to_string(&StatusOutput {
            worker_id: "01ARZ3".into(),
            done: false,
            state: "running".into(),
            exit_code: None,
            pid: Some(4242),
        })
        .expect("serialize");
        assert!(rendered.contains("\"workerId\":\"01ARZ3\""));
        assert!(rendered.contains("\"pid\":4242"));
        assert!(!rendered.contains("exitCode"));
    }

    #[test]
    fn stream_line_carries_one_stream() {
        let rendered = serde_json::to_string(&StreamLine {
            stdout: Some("hello\n".into()),
            stderr: None,
        })
        .expect("serialize");
        assert_eq!(rendered, "{\"stdout\":\"hello\\n\"}");
    }
}
