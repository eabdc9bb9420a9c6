//! External training step.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use fedlink_core::task::{TaskConfig, TrainingCommand};
use fedlink_core::FederationError;
use tokio::process::Command;
use tracing::{debug, info};

/// Turns the model at `model_in` into an update at `model_out`.
#[async_trait]
pub trait Trainer: Send + Sync {
    async fn train(&self, model_in: &Path, model_out: &Path) -> Result<(), FederationError>;
}

/// Runs the plan's training task as a child process. The child is killed if
/// the future is dropped (e.g. on cancellation).
pub struct ProcessTrainer {
    task: TaskConfig,
}

impl ProcessTrainer {
    pub fn new(task: TaskConfig) -> Self { Self { task } }
}

const STDERR_TAIL: usize = 512;

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end();
    match text.char_indices().rev().nth(STDERR_TAIL) {
        Some((i, _)) => format!("...{}", &text[i..]),
        None => text.to_string(),
    }
}

#[async_trait]
impl Trainer for ProcessTrainer {
    async fn train(&self, model_in: &Path, model_out: &Path) -> Result<(), FederationError> {
        let cmd = TrainingCommand::builder(&self.task).model_in(model_in).model_out(model_out).build()?;
        info!(program = cmd.program(), args = ?cmd.args(), "training_started");
        let output = Command::new(cmd.program())
            .args(cmd.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| FederationError::TrainingFailure(format!("cannot start {}: {e}", cmd.program())))?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!(target: "trainer", "{line}");
        }
        if !output.status.success() {
            return Err(FederationError::TrainingFailure(format!("trainer exited with {}: {}", output.status, tail(&output.stderr))));
        }
        info!("training_finished");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use fedlink_core::task::ArgValue;

    fn shell_task(script: &Path, args: &[(&str, ArgValue)]) -> TaskConfig {
        TaskConfig {
            script: script.to_str().unwrap().to_string(),
            interpreter: Some("/bin/sh".into()),
            args: args.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    #[tokio::test]
    async fn successful_run_writes_update() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("train.sh");
        // Copies the input model and appends the epochs value.
        std::fs::write(&script, "cp \"$2\" \"$4\"\nprintf '%s' \"$6\" >> \"$4\"\n").unwrap();
        let input = dir.path().join("model.bin");
        let output = dir.path().join("update.bin");
        std::fs::write(&input, b"w").unwrap();

        let trainer = ProcessTrainer::new(shell_task(&script, &[("epochs", ArgValue::Int(3))]));
        trainer.train(&input, &output).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"w3");
    }

    #[tokio::test]
    async fn non_zero_exit_is_training_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fail.sh");
        std::fs::write(&script, "echo boom >&2\nexit 3\n").unwrap();
        let trainer = ProcessTrainer::new(shell_task(&script, &[]));
        let err = trainer.train(&dir.path().join("in.bin"), &dir.path().join("out.bin")).await.unwrap_err();
        match err {
            FederationError::TrainingFailure(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsafe_arguments_never_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let script = dir.path().join("train.sh");
        std::fs::write(&script, format!("touch {}\n", marker.display())).unwrap();
        let trainer = ProcessTrainer::new(shell_task(&script, &[("lr", ArgValue::from("0.1;reboot"))]));
        let err = trainer.train(&dir.path().join("in.bin"), &dir.path().join("out.bin")).await.unwrap_err();
        assert!(matches!(err, FederationError::InvalidArgument(_)));
        assert!(!marker.exists());
    }
}
