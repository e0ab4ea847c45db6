//! Reports as external programs speaking JSON over stdio.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ReportError, ReportRunner};

/// Runs each report as a child process.
///
/// The report identifier is the program to execute, or the script handed to
/// `interpreter` when one is configured. Parameters are written to stdin as
/// JSON (`null` when absent) while stdout is read; stdout is parsed as the
/// JSON result, with empty output meaning `null`. The child is killed if the
/// run is abandoned.
///
/// With a reports directory, identifiers are resolved relative to it and
/// anything resolving outside it is refused.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    interpreter: Option<PathBuf>,
    reports_dir: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every report through `interpreter` (e.g. `sh` or `node`).
    pub fn with_interpreter(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: Some(interpreter.into()),
            reports_dir: None,
        }
    }

    /// Only run reports that resolve inside `dir`.
    pub fn reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    async fn resolve(&self, report: &str) -> Result<PathBuf, ReportError> {
        let Some(dir) = &self.reports_dir else {
            return Ok(PathBuf::from(report));
        };
        let io = |source: std::io::Error| ReportError::Io {
            report: report.to_owned(),
            source,
        };
        let root = tokio::fs::canonicalize(dir).await.map_err(io)?;
        let path = tokio::fs::canonicalize(root.join(report)).await.map_err(io)?;
        if !path.starts_with(&root) {
            return Err(ReportError::Forbidden {
                report: report.to_owned(),
            });
        }
        Ok(path)
    }

    fn command(&self, program: &Path) -> Command {
        let mut cmd = match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(program);
                cmd
            }
            None => Command::new(program),
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ReportRunner for ProcessRunner {
    async fn run(&self, report: &str, parameters: Option<Value>) -> Result<Value, ReportError> {
        let io = |source: std::io::Error| ReportError::Io {
            report: report.to_owned(),
            source,
        };
        let input = serde_json::to_vec(&parameters.unwrap_or(Value::Null)).map_err(|source| {
            ReportError::Output {
                report: report.to_owned(),
                source,
            }
        })?;

        let program = self.resolve(report).await?;
        let mut child = self.command(&program).spawn().map_err(io)?;

        // stdout must be drained while stdin is written or a chatty report
        // blocks on a full pipe.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&input).await {
                // A report that ignores its input may exit before reading it.
                Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(io)?;
        fed.map_err(io)?;
        debug!(report, status = %output.status, "report exited");

        if !output.status.success() {
            return Err(ReportError::Failed {
                report: report.to_owned(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout).map_err(|source| ReportError::Output {
            report: report.to_owned(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::time::Duration;

    fn script(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{body}").unwrap();
        file.flush().unwrap();
        file
    }

    fn path(file: &tempfile::NamedTempFile) -> String {
        file.path().to_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn echoes_parameters() {
        let report = script("cat");
        let runner = ProcessRunner::with_interpreter("sh");
        let result = runner.run(&path(&report), Some(json!("Test"))).await.unwrap();
        assert_eq!(result, json!("Test"));
    }

    #[tokio::test]
    async fn absent_parameters_are_null() {
        let report = script("cat");
        let runner = ProcessRunner::with_interpreter("sh");
        let result = runner.run(&path(&report), None).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn empty_output_is_null() {
        let report = script("cat > /dev/null");
        let runner = ProcessRunner::with_interpreter("sh");
        let result = runner.run(&path(&report), Some(json!({"a": 1}))).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let report = script("echo 'no such table' >&2; exit 3");
        let runner = ProcessRunner::with_interpreter("sh");
        let err = runner.run(&path(&report), None).await.unwrap_err();
        match err {
            ReportError::Failed { stderr, .. } => assert_eq!(stderr, "no such table"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn invalid_output_is_rejected() {
        let report = script("cat > /dev/null; echo not-json");
        let runner = ProcessRunner::with_interpreter("sh");
        let err = runner.run(&path(&report), None).await.unwrap_err();
        assert!(matches!(err, ReportError::Output { .. }));
    }

    #[tokio::test]
    async fn large_parameters_do_not_block_on_output() {
        let report = script("cat");
        let runner = ProcessRunner::with_interpreter("sh");
        let parameters = json!("x".repeat(200_000));
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            runner.run(&path(&report), Some(parameters.clone())),
        )
        .await
        .expect("report run did not finish")
        .unwrap();
        assert_eq!(result, parameters);
    }

    #[tokio::test]
    async fn runs_report_inside_reports_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("echo.sh"), "cat\n").unwrap();
        let runner = ProcessRunner::with_interpreter("sh").reports_dir(dir.path());
        let result = runner.run("echo.sh", Some(json!({"a": 1}))).await.unwrap();
        assert_eq!(result, json!({"a": 1}));
    }

    #[tokio::test]
    async fn refuses_report_outside_reports_dir() {
        let dir = tempfile::tempdir().unwrap();
        let outside = script("cat");
        let runner = ProcessRunner::with_interpreter("sh").reports_dir(dir.path());

        let err = runner.run(&path(&outside), None).await.unwrap_err();
        assert!(matches!(err, ReportError::Forbidden { .. }), "{err}");

        let name = outside.path().file_name().unwrap().to_str().unwrap();
        let escaping = format!("../{name}");
        let err = runner.run(&escaping, None).await.unwrap_err();
        assert!(
            matches!(err, ReportError::Forbidden { .. } | ReportError::Io { .. }),
            "{err}"
        );
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let runner = ProcessRunner::new();
        let err = runner.run("/nonexistent/report", None).await.unwrap_err();
        assert!(matches!(err, ReportError::Io { .. }));
    }
}
