use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

use super::{ForegroundApp, ForegroundDetector};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Detects the foreground application by running a command and reading the
/// identifier from its standard output.
///
/// Empty output or a non-zero exit means "nothing in the foreground".
#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandDetector {
    #[must_use]
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Build from a full argv list
    ///
    /// # Errors
    ///
    /// Returns an error if `argv` is empty
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Detector command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ForegroundDetector for CommandDetector {
    async fn current_app(&self) -> Result<Option<ForegroundApp>> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .with_context(|| format!("'{}' timed out", self.program))?
            .with_context(|| format!("Failed to run '{}'", self.program))?;

        if !output.status.success() {
            log::debug!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }

        let app_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if app_id.is_empty() {
            return Ok(None);
        }
        Ok(Some(ForegroundApp::new(app_id)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandDetector {
        CommandDetector::new("sh", &["-c", script])
    }

    #[tokio::test]
    async fn test_reads_trimmed_identifier() {
        let app = sh("echo '  com.example.target  '")
            .current_app()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(app.app_id, "com.example.target");
    }

    #[tokio::test]
    async fn test_empty_output_is_none() {
        assert!(sh("printf ''").current_app().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_command_is_none() {
        assert!(sh("echo oops >&2; exit 1").current_app().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_program_is_error() {
        let detector = CommandDetector::new("intentgate-no-such-program", &[]);
        assert!(detector.current_app().await.is_err());
    }

    #[tokio::test]
    async fn test_slow_command_times_out() {
        let detector = sh("sleep 5").with_timeout(Duration::from_millis(50));
        assert!(detector.current_app().await.is_err());
    }

    #[test]
    fn test_from_argv() {
        let argv = vec!["xdotool".to_string(), "getactivewindow".to_string()];
        let detector = CommandDetector::from_argv(&argv).unwrap();
        assert_eq!(detector.program, "xdotool");
        assert_eq!(detector.args, vec!["getactivewindow".to_string()]);
    }
}
