//! Stage executors: how a stage's `cmd` is actually run.

use std::path::Path;
use std::process::Command;

use tracing::{debug, info, warn};

use spamflow_shared::{ParamsDocument, Result, SpamflowError, StageDef};
use spamflow_stages::{StageKind, run_stage};

/// Runs one stage's command in the project root.
///
/// Returning `Ok` means the command succeeded; the runner still checks that
/// every declared output exists.
pub trait StageExecutor: Send + Sync {
    fn execute(&self, stage: &StageDef, root: &Path, params: &ParamsDocument) -> Result<()>;
}

/// Parse `spamflow stage <name>` into a built-in stage.
pub fn builtin_kind(cmd: &str) -> Option<StageKind> {
    let mut words = cmd.split_whitespace();
    match (words.next(), words.next(), words.next(), words.next()) {
        (Some("spamflow"), Some("stage"), Some(name), None) => name.parse().ok(),
        _ => None,
    }
}

/// Runs built-in stages in-process and hands anything else to the shell.
#[derive(Debug, Default, Clone)]
pub struct BuiltinExecutor {
    shell: ShellExecutor,
}

impl StageExecutor for BuiltinExecutor {
    fn execute(&self, stage: &StageDef, root: &Path, params: &ParamsDocument) -> Result<()> {
        match builtin_kind(&stage.cmd) {
            Some(kind) => {
                debug!(stage = %stage.name, %kind, "running built-in stage");
                run_stage(kind, root, &params.params).map(|outcome| {
                    info!(stage = %stage.name, "{outcome}");
                })
            }
            None => self.shell.execute(stage, root, params),
        }
    }
}

/// Runs `sh -c <cmd>` with the project root as working directory.
#[derive(Debug, Default, Clone)]
pub struct ShellExecutor;

impl StageExecutor for ShellExecutor {
    fn execute(&self, stage: &StageDef, root: &Path, _params: &ParamsDocument) -> Result<()> {
        debug!(stage = %stage.name, cmd = %stage.cmd, "running shell command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&stage.cmd)
            .current_dir(root)
            .output()
            .map_err(|e| SpamflowError::stage_failed(&stage.name, format!("spawn failed: {e}")))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!("{line}");
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            warn!("{line}");
        }

        if output.status.success() {
            Ok(())
        } else {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            Err(SpamflowError::stage_failed(
                &stage.name,
                format!("command exited with status {code}"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spamflow_shared::Params;

    fn shell_stage(cmd: &str) -> StageDef {
        StageDef {
            name: "shell".into(),
            cmd: cmd.into(),
            deps: vec![],
            outs: vec![],
            params: vec![],
            metrics: None,
        }
    }

    fn params() -> ParamsDocument {
        ParamsDocument::from_params(Params::default()).unwrap()
    }

    #[test]
    fn recognizes_builtin_commands() {
        assert_eq!(
            builtin_kind("spamflow stage preprocessing"),
            Some(StageKind::Preprocessing)
        );
        assert_eq!(
            builtin_kind("  spamflow   stage model_building "),
            Some(StageKind::ModelBuilding)
        );
        assert_eq!(builtin_kind("spamflow stage unknown"), None);
        assert_eq!(builtin_kind("spamflow stage preprocessing --x"), None);
        assert_eq!(builtin_kind("python preprocess.py"), None);
    }

    #[cfg(unix)]
    #[test]
    fn shell_runs_in_root() {
        let root = std::env::temp_dir().join(format!("spamflow_exec_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&root).unwrap();
        BuiltinExecutor::default()
            .execute(&shell_stage("echo hi > out.txt"), &root, &params())
            .expect("shell");
        assert_eq!(std::fs::read_to_string(root.join("out.txt")).unwrap(), "hi\n");
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_stage_failure() {
        let root = std::env::temp_dir();
        let err = ShellExecutor
            .execute(&shell_stage("exit 3"), &root, &params())
            .unwrap_err();
        match err {
            SpamflowError::StageFailed { stage, message } => {
                assert_eq!(stage, "shell");
                assert!(message.contains('3'));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
