//! In-process execution on the machine running cda

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

use super::capture::decode;
use super::{log_result, Endpoint, EndpointKind, ExecutionResult, LoginSpec, RunOptions};
use crate::error::Result;

/// The local host
///
/// No handshake and no session. Commands run through `sh -c` with the
/// environment overlay applied to the child; escalated commands run through
/// `sudo K=V.. sh -c` so sudo does not filter the overlay out.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    hostname: String,
}

impl LocalEndpoint {
    pub fn new() -> Self {
        Self {
            hostname: "localhost".to_string(),
        }
    }

    fn command(cmd: &str, options: &RunOptions) -> Command {
        let mut command = if options.escalate {
            let mut c = Command::new("sudo");
            for (key, value) in &options.env {
                if let Some(v) = value {
                    c.arg(format!("{}={}", key, v));
                }
            }
            let mut script = String::new();
            for (key, value) in &options.env {
                if value.is_none() {
                    script.push_str(&format!("unset -v {}\n", key));
                }
            }
            script.push_str(cmd);
            c.args(["sh", "-c", &script]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", cmd]);
            for (key, value) in &options.env {
                match value {
                    Some(v) => c.env(key, v),
                    None => c.env_remove(key),
                };
            }
            c
        };

        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }
        command.stdin(Stdio::null());
        command
    }
}

impl Default for LocalEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint for LocalEndpoint {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Local
    }

    fn connect(&self, _login: &LoginSpec) -> Result<()> {
        Ok(())
    }

    fn run(&self, cmd: &str, options: &RunOptions) -> Result<ExecutionResult> {
        if !options.quiet {
            debug!("{}: running command: {}", self.hostname, cmd);
        }

        // output() drains stdout and stderr concurrently before reaping
        let output = Self::command(cmd, options).output()?;
        let result = ExecutionResult::new(
            decode("stdout", output.stdout)?,
            decode("stderr", output.stderr)?,
            output.status.code().unwrap_or(-1),
        );

        log_result(&self.hostname, cmd, &result, options.quiet);
        Ok(result)
    }

    fn copy_to(&self, src: &Path, dst: &str) -> Result<()> {
        if src == Path::new(dst) {
            return Ok(());
        }
        fs::copy(src, dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CdaError;

    #[test]
    fn test_binary_output_is_an_error() {
        let local = LocalEndpoint::new();
        match local.run("printf '\\377\\376'", &RunOptions::new()) {
            Err(CdaError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::InvalidData),
            other => panic!("expected invalid data, got {:?}", other),
        }
    }

    #[test]
    fn test_captures_both_streams_and_code() {
        let local = LocalEndpoint::new();
        let result = local
            .run("echo out; echo err >&2; exit 4", &RunOptions::new())
            .unwrap();
        assert_eq!(result.out, "out\n");
        assert_eq!(result.err, "err\n");
        assert_eq!(result.returncode, 4);
        assert!(!result.success());
    }

    #[test]
    fn test_env_overlay_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().to_str().unwrap().to_string();
        let local = LocalEndpoint::new();
        let result = local
            .run(
                "printf '%s:%s:%s' \"$CDA_A\" \"${HOME+set}\" \"$(pwd)\"",
                &RunOptions::new().env("CDA_A", "x y").unset("HOME").cwd(&cwd),
            )
            .unwrap();
        let expected_cwd = dir.path().canonicalize().unwrap();
        assert_eq!(
            result.out,
            format!("x y::{}", expected_cwd.to_str().unwrap())
        );
    }

    #[test]
    fn test_escalated_argv() {
        let opts = RunOptions::new().env("A", "1").unset("B").sudo();
        let command = LocalEndpoint::command("id -u", &opts);
        assert_eq!(command.get_program(), "sudo");
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["A=1", "sh", "-c", "unset -v B\nid -u"]);
    }

    #[test]
    fn test_run_or_die_and_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "contents").unwrap();
        let p = path.to_str().unwrap();

        let local = LocalEndpoint::new();
        assert!(local.exists(p).unwrap());
        assert!(!local.exists(&format!("{}.missing", p)).unwrap());
        assert_eq!(local.read_file(p).unwrap(), "contents");

        let err = local.run_or_die("exit 7", &RunOptions::new()).unwrap_err();
        assert!(matches!(err, crate::CdaError::CommandFailed { code: 7, .. }));
    }

    #[test]
    fn test_copy_to() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        std::fs::write(&src, "data").unwrap();
        LocalEndpoint::new()
            .copy_to(&src, dst.to_str().unwrap())
            .unwrap();
        assert_eq!(std::fs::read_to_string(dst).unwrap(), "data");
    }
}
