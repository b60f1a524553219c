//! Remote endpoint with transparent reconnect
//!
//! Connect protocol: the login's strategies are tried one per attempt in
//! priority order, wrapping around after the last. Network and authentication
//! failures sleep `backoff` and move on; any other failure aborts at once.
//! The loop gives up with [`CdaError::ConnectTimeout`] once `timeout` has
//! elapsed.
//!
//! Commands share one session. When a channel cannot be opened the endpoint
//! reruns the connect protocol and retries the command, without limit. The
//! reconnect path is serialized and keyed by a session generation so a burst
//! of concurrent failures produces a single reconnect.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use cda_core_resilience::{Poll, PollConfig, PollError, PollLoop};

use super::capture::capture_output;
use super::transport::{Transport, TransportError};
use super::{log_result, remote_script, Endpoint, EndpointKind, ExecutionResult, LoginSpec, RunOptions};
use crate::config::TimingConfig;
use crate::error::{CdaError, Result};

/// Timing knobs of the connect protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectTiming {
    pub backoff: Duration,
    pub timeout: Duration,
    pub capture_poll: Duration,
}

impl From<&TimingConfig> for ConnectTiming {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            backoff: timing.connect_backoff(),
            timeout: timing.connect_timeout(),
            capture_poll: timing.capture_poll(),
        }
    }
}

struct SessionState<S> {
    session: Option<Arc<S>>,
    generation: u64,
}

pub struct RemoteEndpoint<T: Transport> {
    hostname: String,
    transport: T,
    timing: ConnectTiming,
    login: RwLock<Option<LoginSpec>>,
    state: RwLock<SessionState<T::Session>>,
    reconnect_lock: Mutex<()>,
}

impl<T: Transport> RemoteEndpoint<T> {
    pub fn new(hostname: impl Into<String>, transport: T, timing: ConnectTiming) -> Self {
        Self {
            hostname: hostname.into(),
            transport,
            timing,
            login: RwLock::new(None),
            state: RwLock::new(SessionState {
                session: None,
                generation: 0,
            }),
            reconnect_lock: Mutex::new(()),
        }
    }

    /// Number of sessions established so far
    pub fn generation(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .session
            .is_some()
    }

    fn establish(&self, login: &LoginSpec) -> Result<Arc<T::Session>> {
        let strategies = login.strategies();
        if strategies.is_empty() {
            return Err(CdaError::NoLogins {
                host: self.hostname.clone(),
            });
        }

        let config = PollConfig::every(self.timing.backoff).with_deadline(self.timing.timeout);
        let result = PollLoop::new(config).run(|attempt| {
            let connection = &strategies[(attempt as usize) % strategies.len()];
            match self
                .transport
                .login(&self.hostname, &login.username, connection)
            {
                Ok(session) => {
                    info!(
                        "{}: logged in as {} using {:?}",
                        self.hostname, login.username, connection
                    );
                    Ok(Poll::Ready(session))
                }
                Err(e) if e.is_recoverable() => {
                    if attempt == 0 {
                        info!(
                            "{}: login with {:?} failed ({}), retrying every {:?}",
                            self.hostname, connection, e, self.timing.backoff
                        );
                    } else {
                        debug!("{}: login with {:?} failed: {}", self.hostname, connection, e);
                    }
                    Ok(Poll::Pending)
                }
                Err(e) => Err(CdaError::Login {
                    host: self.hostname.clone(),
                    message: e.to_string(),
                }),
            }
        });

        match result {
            Ok(session) => Ok(Arc::new(session)),
            Err(PollError::Aborted(e)) => Err(e),
            Err(_) => Err(CdaError::ConnectTimeout {
                host: self.hostname.clone(),
                timeout: self.timing.timeout,
            }),
        }
    }

    fn install(&self, session: Arc<T::Session>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.session = Some(session);
        state.generation += 1;
    }

    /// Reconnect unless another caller already did since generation `seen`
    fn reconnect(&self, seen: u64) -> Result<()> {
        let _guard = self
            .reconnect_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.generation() != seen {
            debug!("{}: session already re-established", self.hostname);
            return Ok(());
        }

        let login = self
            .login
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| self.not_connected())?;
        let session = self.establish(&login)?;
        self.install(session);
        Ok(())
    }

    fn session(&self) -> Result<(Arc<T::Session>, u64)> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match &state.session {
            Some(session) => Ok((Arc::clone(session), state.generation)),
            None => Err(self.not_connected()),
        }
    }

    fn not_connected(&self) -> CdaError {
        CdaError::Login {
            host: self.hostname.clone(),
            message: "no session; connect() was never called".to_string(),
        }
    }

    /// Run `op` on the current session, reconnecting on lost channels
    fn with_session<R, F>(&self, what: &str, mut op: F) -> Result<R>
    where
        F: FnMut(&T::Session) -> std::result::Result<R, TransportError>,
    {
        loop {
            let (session, generation) = self.session()?;
            match op(&session) {
                Ok(value) => return Ok(value),
                Err(e @ TransportError::Channel(_)) | Err(e @ TransportError::Network(_)) => {
                    warn!("{}: {} failed ({}), reconnecting", self.hostname, what, e);
                    self.reconnect(generation)?;
                }
                Err(e) => {
                    return Err(CdaError::Login {
                        host: self.hostname.clone(),
                        message: format!("{}: {}", what, e),
                    })
                }
            }
        }
    }
}

impl<T: Transport> Endpoint for RemoteEndpoint<T> {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Remote
    }

    fn connect(&self, login: &LoginSpec) -> Result<()> {
        let _guard = self
            .reconnect_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        {
            let current = self.login.read().unwrap_or_else(PoisonError::into_inner);
            if self.is_connected()
                && current.as_ref().map(|l| l.username.as_str()) == Some(login.username.as_str())
            {
                return Ok(());
            }
        }

        *self.login.write().unwrap_or_else(PoisonError::into_inner) = Some(login.clone());
        let session = self.establish(login)?;
        self.install(session);
        Ok(())
    }

    fn run(&self, cmd: &str, options: &RunOptions) -> Result<ExecutionResult> {
        let script = remote_script(cmd, options);
        if !options.quiet {
            debug!("{}: running command: {}", self.hostname, cmd);
        }

        let mut channel = self.with_session("opening channel", |session| {
            self.transport.open(session, &script)
        })?;
        let result = capture_output(&mut channel, self.timing.capture_poll)?;

        log_result(&self.hostname, cmd, &result, options.quiet);
        Ok(result)
    }

    fn copy_to(&self, src: &Path, dst: &str) -> Result<()> {
        debug!("{}: copying {} to {}", self.hostname, src.display(), dst);
        self.with_session("upload", |session| self.transport.upload(session, src, dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::capture::OutputSource;
    use crate::exec::connection::Connection;
    use std::io;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeSession {
        id: u64,
    }

    struct FakeChannel {
        out: Vec<u8>,
        sent: bool,
    }

    impl OutputSource for FakeChannel {
        fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Ok(0);
            }
            self.sent = true;
            buf[..self.out.len()].copy_from_slice(&self.out);
            Ok(self.out.len())
        }

        fn read_stderr(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn exit_status(&mut self) -> io::Result<Option<i32>> {
            Ok(Some(0))
        }
    }

    /// Login fails `login_failures` times; channels fail `open_failures` times
    #[derive(Default)]
    struct Flaky {
        login_failures: u32,
        fatal_login: bool,
        open_failures: u32,
        logins: AtomicU64,
        failed_logins: AtomicU32,
        failed_opens: AtomicU32,
        tried: StdMutex<Vec<String>>,
        /// Sessions with an id below this cannot open channels
        healthy_from: u64,
    }

    impl Transport for Flaky {
        type Session = FakeSession;
        type Channel = FakeChannel;

        fn login(
            &self,
            _host: &str,
            _username: &str,
            connection: &Connection,
        ) -> std::result::Result<FakeSession, TransportError> {
            self.tried.lock().unwrap().push(format!("{:?}", connection));
            if self.fatal_login {
                return Err(TransportError::Fatal("host key mismatch".into()));
            }
            if self.failed_logins.load(Ordering::SeqCst) < self.login_failures {
                self.failed_logins.fetch_add(1, Ordering::SeqCst);
                return Err(TransportError::Network("connection refused".into()));
            }
            let id = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(FakeSession { id })
        }

        fn open(
            &self,
            session: &FakeSession,
            command: &str,
        ) -> std::result::Result<FakeChannel, TransportError> {
            if session.id < self.healthy_from
                || self.failed_opens.load(Ordering::SeqCst) < self.open_failures
            {
                self.failed_opens.fetch_add(1, Ordering::SeqCst);
                return Err(TransportError::Channel("session closed".into()));
            }
            Ok(FakeChannel {
                out: command.as_bytes().to_vec(),
                sent: false,
            })
        }

        fn upload(
            &self,
            _session: &FakeSession,
            _src: &Path,
            _dst: &str,
        ) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    fn timing() -> ConnectTiming {
        ConnectTiming {
            backoff: Duration::ZERO,
            timeout: Duration::from_secs(30),
            capture_poll: Duration::ZERO,
        }
    }

    fn login() -> LoginSpec {
        LoginSpec::new("core")
            .with_password(Some("pw"))
            .with_key_paths(vec![])
    }

    #[test]
    fn test_connect_cycles_strategies_until_success() {
        let endpoint = RemoteEndpoint::new(
            "h1",
            Flaky {
                login_failures: 3,
                ..Default::default()
            },
            timing(),
        );
        endpoint.connect(&login()).unwrap();
        assert!(endpoint.is_connected());
        assert_eq!(endpoint.generation(), 1);
        let tried = endpoint.transport.tried.lock().unwrap().clone();
        assert_eq!(
            tried,
            vec!["Password(***)", "Agent", "Password(***)", "Agent"]
        );
    }

    #[test]
    fn test_connect_is_idempotent_for_same_user() {
        let endpoint = RemoteEndpoint::new("h1", Flaky::default(), timing());
        endpoint.connect(&login()).unwrap();
        endpoint.connect(&login()).unwrap();
        assert_eq!(endpoint.generation(), 1);
    }

    #[test]
    fn test_unexpected_login_failure_is_not_retried() {
        let endpoint = RemoteEndpoint::new(
            "h1",
            Flaky {
                fatal_login: true,
                ..Default::default()
            },
            timing(),
        );
        let err = endpoint.connect(&login()).unwrap_err();
        assert!(matches!(err, CdaError::Login { .. }));
        assert_eq!(endpoint.transport.tried.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_connect_timeout() {
        let endpoint = RemoteEndpoint::new(
            "h1",
            Flaky {
                login_failures: u32::MAX,
                ..Default::default()
            },
            ConnectTiming {
                timeout: Duration::ZERO,
                ..timing()
            },
        );
        let err = endpoint.connect(&login()).unwrap_err();
        assert!(matches!(err, CdaError::ConnectTimeout { .. }));
        assert!(!endpoint.is_connected());
    }

    #[test]
    fn test_no_logins() {
        let endpoint = RemoteEndpoint::new("h1", Flaky::default(), timing());
        let spec = LoginSpec::new("core")
            .with_key_paths(vec![])
            .with_discover_auth(false);
        assert!(matches!(
            endpoint.connect(&spec),
            Err(CdaError::NoLogins { .. })
        ));
    }

    #[test]
    fn test_run_retries_through_disconnects() {
        let endpoint = RemoteEndpoint::new(
            "h1",
            Flaky {
                open_failures: 4,
                ..Default::default()
            },
            timing(),
        );
        endpoint.connect(&login()).unwrap();
        let result = endpoint.run("uptime", &RunOptions::new()).unwrap();
        assert!(result.success());
        assert_eq!(result.out, "uptime");
        assert_eq!(endpoint.transport.failed_opens.load(Ordering::SeqCst), 4);
        assert_eq!(endpoint.generation(), 5);
    }

    #[test]
    fn test_run_before_connect_fails() {
        let endpoint = RemoteEndpoint::new("h1", Flaky::default(), timing());
        assert!(endpoint.run("true", &RunOptions::new()).is_err());
    }

    #[test]
    fn test_concurrent_failures_reconnect_once() {
        let endpoint = Arc::new(RemoteEndpoint::new(
            "h1",
            Flaky {
                healthy_from: 2,
                ..Default::default()
            },
            timing(),
        ));
        endpoint.connect(&login()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let endpoint = Arc::clone(&endpoint);
                std::thread::spawn(move || {
                    endpoint
                        .run(&format!("echo {}", i), &RunOptions::new())
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().success());
        }

        assert_eq!(endpoint.transport.logins.load(Ordering::SeqCst), 2);
        assert_eq!(endpoint.generation(), 2);
    }
}
