/*!
 * Command execution against local and remote hosts
 *
 * Every host is addressed through an [`Endpoint`]. Running a command yields an
 * [`ExecutionResult`]; a non-zero exit code is an ordinary result. Only
 * infrastructure failure (no session could be established before the connect
 * timeout) surfaces as an error.
 */

pub mod capture;
pub mod connection;
pub mod local;
pub mod quote;
pub mod registry;
pub mod remote;
pub mod ssh;
pub mod transport;

use std::fmt;
use std::io::Write;
use std::path::Path;
use tracing::error;

use crate::error::{CdaError, Result};

pub use capture::{capture_output, OutputSource};
pub use connection::{Connection, LoginSpec};
pub use local::LocalEndpoint;
pub use quote::{quote, quote_join};
pub use registry::{EndpointFactory, EndpointRegistry};
pub use remote::RemoteEndpoint;
pub use ssh::SshTransport;
pub use transport::{Transport, TransportError};

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionResult {
    pub out: String,
    pub err: String,
    pub returncode: i32,
}

impl ExecutionResult {
    pub fn new(out: impl Into<String>, err: impl Into<String>, returncode: i32) -> Self {
        Self {
            out: out.into(),
            err: err.into(),
            returncode,
        }
    }

    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(rc={}, out={:?}, err={:?})",
            self.returncode,
            self.out.trim_end(),
            self.err.trim_end()
        )
    }
}

/// Per-invocation knobs for [`Endpoint::run`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Environment overlay; `None` removes the variable
    pub env: Vec<(String, Option<String>)>,
    pub cwd: Option<String>,
    /// Run through sudo
    pub escalate: bool,
    /// Skip the "running command" log line
    pub quiet: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), Some(value.into())));
        self
    }

    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.env.push((key.into(), None));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn sudo(mut self) -> Self {
        self.escalate = true;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Local,
    Remote,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Local => write!(f, "local"),
            EndpointKind::Remote => write!(f, "remote"),
        }
    }
}

/// An execution target
///
/// Implementations are shared across pool threads through the
/// [`EndpointRegistry`], so every method takes `&self`.
pub trait Endpoint: Send + Sync {
    fn hostname(&self) -> &str;

    fn kind(&self) -> EndpointKind;

    /// Establish a session; no-op when already logged in as the same user
    fn connect(&self, login: &LoginSpec) -> Result<()>;

    /// Run `cmd` through a shell and capture its output
    fn run(&self, cmd: &str, options: &RunOptions) -> Result<ExecutionResult>;

    /// Copy a local file to `dst` on this endpoint
    fn copy_to(&self, src: &Path, dst: &str) -> Result<()>;

    /// Run and turn a non-zero exit code into [`CdaError::CommandFailed`]
    fn run_or_die(&self, cmd: &str, options: &RunOptions) -> Result<ExecutionResult> {
        let result = self.run(cmd, options)?;
        if !result.success() {
            error!(
                "{}: command '{}' failed with rc={}: {}",
                self.hostname(),
                cmd,
                result.returncode,
                result.err.trim_end()
            );
            return Err(CdaError::command_failed(
                self.hostname(),
                cmd,
                result.returncode,
                &result.err,
            ));
        }
        Ok(result)
    }

    /// Write `contents` to a destination that may need root
    ///
    /// The data is staged in an unprivileged temporary file and then poured
    /// into the destination by an escalated shell, so an existing file keeps
    /// its owner and mode.
    fn write_file(&self, dst: &str, contents: &str) -> Result<()> {
        let mut local = tempfile::NamedTempFile::new()?;
        local.write_all(contents.as_bytes())?;
        local.flush()?;

        let staged = format!("/tmp/cda-{}.tmp", uuid::Uuid::new_v4());
        self.copy_to(local.path(), &staged)?;

        let script = format!(
            "rc=0 ; cat {tmp} > {dst} || rc=$? ; rm -rf {tmp} ; exit $rc",
            tmp = quote(&staged),
            dst = quote(dst)
        );
        self.run_or_die(&script, &RunOptions::new().sudo().quiet())?;
        Ok(())
    }

    fn read_file(&self, path: &str) -> Result<String> {
        let result = self.run_or_die(&format!("cat {}", quote(path)), &RunOptions::new().quiet())?;
        Ok(result.out)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let result = self.run(&format!("test -e {}", quote(path)), &RunOptions::new().quiet())?;
        Ok(result.success())
    }

    /// Whether `target` answers one ICMP echo from this endpoint
    fn ping(&self, target: &str) -> Result<bool> {
        let result = self.run(
            &format!("ping -c 1 -W 1 {}", quote(target)),
            &RunOptions::new().quiet(),
        )?;
        Ok(result.success())
    }
}

/// Build the shell script a remote shell runs for `cmd`
///
/// With escalation the environment is passed as `K=V` arguments to sudo and
/// removed variables are unset inside the script; without it the script
/// exports and unsets them itself.
pub(crate) fn remote_script(cmd: &str, options: &RunOptions) -> String {
    let mut script = String::new();
    for (key, value) in &options.env {
        match value {
            Some(v) if !options.escalate => {
                script.push_str(&format!("export {}={}\n", key, quote(v)));
            }
            Some(_) => {}
            None => script.push_str(&format!("unset -v {}\n", key)),
        }
    }
    if let Some(cwd) = &options.cwd {
        script.push_str(&format!("cd {} || exit 10\n", quote(cwd)));
    }
    script.push_str(cmd);

    if !options.escalate {
        return script;
    }

    let mut argv = vec!["sudo".to_string()];
    for (key, value) in &options.env {
        if let Some(v) = value {
            argv.push(format!("{}={}", key, v));
        }
    }
    argv.extend(["sh".to_string(), "-c".to_string(), script]);
    quote_join(&argv)
}

/// Log the single result line every endpoint emits per command
pub(crate) fn log_result(host: &str, cmd: &str, result: &ExecutionResult, quiet: bool) {
    if quiet {
        tracing::trace!("{}: {} -> {}", host, cmd, result);
    } else {
        tracing::debug!("{}: {} -> {}", host, cmd, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Endpoint that keeps the provided `write_file`
    struct Recorder {
        rc: i32,
        fail_copy: bool,
        copies: Mutex<Vec<(PathBuf, String, String)>>,
        commands: Mutex<Vec<(String, RunOptions)>>,
    }

    impl Recorder {
        fn new(rc: i32) -> Self {
            Self {
                rc,
                fail_copy: false,
                copies: Mutex::new(Vec::new()),
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    impl Endpoint for Recorder {
        fn hostname(&self) -> &str {
            "h1"
        }

        fn kind(&self) -> EndpointKind {
            EndpointKind::Remote
        }

        fn connect(&self, _login: &LoginSpec) -> Result<()> {
            Ok(())
        }

        fn run(&self, cmd: &str, options: &RunOptions) -> Result<ExecutionResult> {
            self.commands
                .lock()
                .unwrap()
                .push((cmd.to_string(), options.clone()));
            Ok(ExecutionResult::new("", "denied", self.rc))
        }

        fn copy_to(&self, src: &Path, dst: &str) -> Result<()> {
            if self.fail_copy {
                return Err(CdaError::Io(std::io::Error::other("disk full")));
            }
            let contents = std::fs::read_to_string(src)?;
            self.copies
                .lock()
                .unwrap()
                .push((src.to_path_buf(), dst.to_string(), contents));
            Ok(())
        }
    }

    fn pour_script(staged: &str, dst: &str) -> String {
        format!(
            "rc=0 ; cat {tmp} > {dst} || rc=$? ; rm -rf {tmp} ; exit $rc",
            tmp = quote(staged),
            dst = quote(dst)
        )
    }

    #[test]
    fn test_write_file_stages_then_pours_escalated() {
        let endpoint = Recorder::new(0);
        endpoint.write_file("/etc/my hosts", "a b\n").unwrap();

        let copies = endpoint.copies.lock().unwrap().clone();
        assert_eq!(copies.len(), 1);
        let (local, staged, contents) = &copies[0];
        assert!(staged.starts_with("/tmp/cda-"));
        assert!(staged.ends_with(".tmp"));
        assert_eq!(contents, "a b\n");
        // The local staging file is gone once the write returns
        assert!(!local.exists());

        let commands = endpoint.commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 1);
        let (cmd, options) = &commands[0];
        assert_eq!(cmd, &pour_script(staged, "/etc/my hosts"));
        assert!(cmd.contains("'/etc/my hosts'"));
        assert!(options.escalate);
        assert!(options.quiet);
    }

    #[test]
    fn test_write_file_failure_still_removes_staged_copy() {
        let endpoint = Recorder::new(1);
        let err = endpoint.write_file("/etc/hosts", "x").unwrap_err();
        match err {
            CdaError::CommandFailed { host, code, stderr, .. } => {
                assert_eq!(host, "h1");
                assert_eq!(code, 1);
                assert_eq!(stderr, "denied");
            }
            other => panic!("expected a command failure, got {:?}", other),
        }

        let copies = endpoint.copies.lock().unwrap().clone();
        let (local, staged, _) = &copies[0];
        assert!(!local.exists());
        let commands = endpoint.commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].0.contains(&format!("rm -rf {}", quote(staged))));
        assert!(commands[0].0.ends_with("exit $rc"));
    }

    #[test]
    fn test_write_file_failed_copy_runs_nothing() {
        let mut endpoint = Recorder::new(0);
        endpoint.fail_copy = true;
        assert!(matches!(endpoint.write_file("/etc/hosts", "x"), Err(CdaError::Io(_))));
        assert!(endpoint.commands.lock().unwrap().is_empty());
    }

    #[test]
    fn test_success_iff_zero() {
        assert!(ExecutionResult::new("", "", 0).success());
        for rc in [-1, 1, 2, 10, 255] {
            assert!(!ExecutionResult::new("x", "y", rc).success());
        }
    }

    #[test]
    fn test_remote_script_plain() {
        let opts = RunOptions::new().env("A", "1 2").unset("B").cwd("/var/tmp");
        assert_eq!(
            remote_script("ls", &opts),
            "export A='1 2'\nunset -v B\ncd /var/tmp || exit 10\nls"
        );
    }

    #[test]
    fn test_remote_script_escalated_passes_env_to_sudo() {
        let opts = RunOptions::new().env("KUBECONFIG", "/k").sudo();
        assert_eq!(
            remote_script("virsh list", &opts),
            "sudo KUBECONFIG=/k sh -c 'virsh list'"
        );
    }

    #[test]
    fn test_remote_script_escalated_with_cwd() {
        let opts = RunOptions::new().cwd("/root").sudo();
        assert_eq!(
            remote_script("pwd", &opts),
            "sudo sh -c 'cd /root || exit 10\npwd'"
        );
    }

    #[test]
    fn test_display() {
        let r = ExecutionResult::new("hello\n", "", 0);
        assert_eq!(r.to_string(), "(rc=0, out=\"hello\", err=\"\")");
    }
}
