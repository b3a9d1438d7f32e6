//! External helper programs for face encoding and push notifications.
//!
//! The encoder helper reads one image on stdin and prints a JSON array of
//! signatures (`[[f32, ...], ...]`, empty when no face is found). The notify
//! helper receives the parent's push address and a JSON payload on stdin.

use atlas_core::backend::{Encoder, EncoderError, Notifier, NotifyError};
use atlas_core::{NotificationPayload, Signature};
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;

pub const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_secs(10);

/// Program plus arguments, split from a whitespace-separated command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl HelperCommand {
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            timeout: DEFAULT_HELPER_TIMEOUT,
        })
    }

    /// Kill the helper if it has not exited after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the helper with `input` on stdin and return its stdout.
    async fn run(&self, extra_args: &[&str], input: Vec<u8>) -> Result<Vec<u8>, String> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to run `{}`: {e}", self.program))?;

        // Feed stdin while the output is collected so a chatty helper cannot deadlock us.
        let stdin = child.stdin.take();
        let program = self.program.as_str();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!(program, error = %e, "helper closed stdin early");
                }
            }
        };

        // On expiry the child is dropped with the future and killed.
        let (_, output) = tokio::time::timeout(self.timeout, async {
            tokio::join!(feed, child.wait_with_output())
        })
        .await
        .map_err(|_| {
            format!(
                "`{}` timed out after {}s and was killed",
                self.program,
                self.timeout.as_secs_f32()
            )
        })?;
        let output = output.map_err(|e| format!("`{}` did not finish: {e}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "`{}` exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            ));
        }
        Ok(output.stdout)
    }
}

/// Face encoder backed by an external helper program.
///
/// Called from the engine thread; the helper runs on the daemon's runtime.
pub struct CommandEncoder {
    command: HelperCommand,
    runtime: Handle,
}

impl CommandEncoder {
    pub fn new(command: HelperCommand, runtime: Handle) -> Self {
        Self { command, runtime }
    }
}

impl Encoder for CommandEncoder {
    fn detect(&mut self, image: &[u8]) -> Result<Vec<Signature>, EncoderError> {
        let stdout = self
            .runtime
            .block_on(self.command.run(&[], image.to_vec()))
            .map_err(EncoderError::Failed)?;
        parse_signatures(&stdout)
    }
}

/// Parse encoder output: a JSON array of float arrays.
pub fn parse_signatures(stdout: &[u8]) -> Result<Vec<Signature>, EncoderError> {
    let text = std::str::from_utf8(stdout)
        .map_err(|e| EncoderError::Malformed(format!("not UTF-8: {e}")))?
        .trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<Vec<Signature>>(text).map_err(|e| EncoderError::Malformed(e.to_string()))
}

#[derive(Serialize)]
struct NotifyMessage<'a> {
    title: &'a str,
    body: String,
    #[serde(flatten)]
    payload: &'a NotificationPayload,
}

fn notify_message(payload: &NotificationPayload) -> Result<Vec<u8>, NotifyError> {
    serde_json::to_vec(&NotifyMessage {
        title: payload.title(),
        body: payload.body(),
        payload,
    })
    .map_err(|e| NotifyError(e.to_string()))
}

/// Push notifications through an external helper (e.g. an FCM sender).
///
/// Invoked as `<command> <address>` with the JSON message on stdin.
pub struct CommandNotifier {
    command: HelperCommand,
    runtime: Handle,
}

impl CommandNotifier {
    pub fn new(command: HelperCommand, runtime: Handle) -> Self {
        Self { command, runtime }
    }
}

impl Notifier for CommandNotifier {
    fn send(&mut self, address: &str, payload: &NotificationPayload) -> Result<(), NotifyError> {
        let message = notify_message(payload)?;
        self.runtime
            .block_on(self.command.run(&[address], message))
            .map(|_| ())
            .map_err(NotifyError)
    }
}

/// Notifier used when no helper is configured: logs what would have been sent.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&mut self, _address: &str, payload: &NotificationPayload) -> Result<(), NotifyError> {
        tracing::info!(body = %payload.body(), "notification (no notify command configured)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::AttendanceStatus;

    #[test]
    fn test_parse_command_line() {
        let cmd = HelperCommand::parse("  atlas-encode --model hog ").unwrap();
        assert_eq!(cmd.program(), "atlas-encode");
        assert_eq!(cmd.args, vec!["--model".to_string(), "hog".to_string()]);
        assert_eq!(HelperCommand::parse("   "), None);
    }

    #[test]
    fn test_parse_signatures() {
        let sigs = parse_signatures(b"[[0.1, 0.2], [0.3, 0.4]]\n").unwrap();
        assert_eq!(sigs.len(), 2);
        assert_eq!(sigs[1].values(), &[0.3, 0.4]);
    }

    #[test]
    fn test_parse_no_faces() {
        assert!(parse_signatures(b"[]").unwrap().is_empty());
        assert!(parse_signatures(b"\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_signatures(b"{\"faces\": 1}"),
            Err(EncoderError::Malformed(_))
        ));
        assert!(matches!(
            parse_signatures(b"[[]]"),
            Err(EncoderError::Malformed(_))
        ));
    }

    #[test]
    fn test_notify_message_shape() {
        let payload = NotificationPayload {
            display_name: "Ani Lestari".into(),
            time: "07:02:11".into(),
            status: AttendanceStatus::Late,
        };
        let json: serde_json::Value =
            serde_json::from_slice(&notify_message(&payload).unwrap()).unwrap();
        assert_eq!(json["title"], "ATLAS attendance report");
        assert_eq!(json["body"], "Ani Lestari was recorded late at 07:02:11.");
        assert_eq!(json["display_name"], "Ani Lestari");
        assert_eq!(json["status"], "late");
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Runtime::new().unwrap()
    }

    fn encoder(command_line: &str, rt: &tokio::runtime::Runtime) -> CommandEncoder {
        CommandEncoder::new(HelperCommand::parse(command_line).unwrap(), rt.handle().clone())
    }

    #[test]
    fn test_missing_encoder_program() {
        let rt = runtime();
        let mut encoder = encoder("/nonexistent/atlas-encode", &rt);
        assert!(matches!(
            encoder.detect(b"not an image"),
            Err(EncoderError::Failed(_))
        ));
    }

    #[test]
    fn test_encoder_reads_helper_stdout() {
        // `cat` echoes the input back, so the "image" doubles as encoder output.
        let rt = runtime();
        let mut encoder = encoder("cat", &rt);
        let sigs = encoder.detect(b"[[0.25, 0.5, 0.75]]").unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].values(), &[0.25, 0.5, 0.75]);
    }

    #[test]
    fn test_hung_encoder_is_killed() {
        let rt = runtime();
        let command = HelperCommand::parse("sleep 30")
            .unwrap()
            .with_timeout(Duration::from_millis(200));
        let mut encoder = CommandEncoder::new(command, rt.handle().clone());

        let started = std::time::Instant::now();
        match encoder.detect(b"") {
            Err(EncoderError::Failed(msg)) => assert!(msg.contains("timed out"), "{msg}"),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_notifier_exit_status() {
        let rt = runtime();
        let payload = NotificationPayload {
            display_name: "Ani Lestari".into(),
            time: "06:45:00".into(),
            status: AttendanceStatus::OnTime,
        };

        let mut ok = CommandNotifier::new(HelperCommand::parse("true").unwrap(), rt.handle().clone());
        assert!(ok.send("fcm-token", &payload).is_ok());

        let mut failing =
            CommandNotifier::new(HelperCommand::parse("false").unwrap(), rt.handle().clone());
        assert!(failing.send("fcm-token", &payload).is_err());
    }
}
