//! SSH transport over libssh2
//!
//! Sessions are switched to non-blocking mode once authenticated so several
//! channels can be driven over one session from different threads; every
//! libssh2 call that can return `EAGAIN` goes through [`retry_eagain`].

use secrecy::ExposeSecret;
use ssh2::{Channel, ErrorCode, Session};
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::thread;
use std::time::Duration;

use super::capture::OutputSource;
use super::connection::Connection;
use super::transport::{Transport, TransportError};

/// libssh2 `LIBSSH2_ERROR_EAGAIN`
const EAGAIN: ErrorCode = ErrorCode::Session(-37);

/// TCP connect and handshake timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const EAGAIN_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct SshTransport {
    pub port: u16,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self { port: 22 }
    }
}

impl SshTransport {
    fn auth(&self, session: &Session, username: &str, connection: &Connection) -> Result<(), TransportError> {
        let auth_err = |e: ssh2::Error| TransportError::Auth(e.to_string());
        match connection {
            Connection::Password(password) => session
                .userauth_password(username, password.expose_secret())
                .map_err(auth_err)?,
            Connection::KeyFile(key_path) => session
                .userauth_pubkey_file(username, None, key_path, None)
                .map_err(auth_err)?,
            Connection::Agent => {
                let mut agent = session.agent().map_err(auth_err)?;
                agent.connect().map_err(auth_err)?;
                agent.list_identities().map_err(auth_err)?;
                let identities = agent.identities().map_err(auth_err)?;
                if !identities
                    .iter()
                    .any(|identity| agent.userauth(username, identity).is_ok())
                {
                    return Err(TransportError::Auth(
                        "no agent identity was accepted".to_string(),
                    ));
                }
            }
        }

        if !session.authenticated() {
            return Err(TransportError::Auth("authentication incomplete".to_string()));
        }
        Ok(())
    }
}

impl Transport for SshTransport {
    type Session = Session;
    type Channel = SshChannel;

    fn login(&self, host: &str, username: &str, connection: &Connection) -> Result<Session, TransportError> {
        let addr = (host, self.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Network(format!("{}: {}", host, e)))?
            .next()
            .ok_or_else(|| TransportError::Network(format!("{}: no address", host)))?;

        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| TransportError::Network(format!("{}: {}", addr, e)))?;

        let mut session = Session::new().map_err(|e| TransportError::Fatal(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(CONNECT_TIMEOUT.as_millis() as u32);
        session
            .handshake()
            .map_err(|e| TransportError::Network(format!("handshake with {}: {}", addr, e)))?;

        self.auth(&session, username, connection)?;

        session.set_timeout(0);
        session.set_blocking(false);
        Ok(session)
    }

    fn open(&self, session: &Session, command: &str) -> Result<SshChannel, TransportError> {
        let mut channel = retry_eagain(|| session.channel_session())
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        retry_eagain(|| channel.exec(command)).map_err(|e| TransportError::Channel(e.to_string()))?;
        Ok(SshChannel { channel })
    }

    fn upload(&self, session: &Session, src: &Path, dst: &str) -> Result<(), TransportError> {
        let mut data = Vec::new();
        File::open(src)
            .and_then(|mut f| f.read_to_end(&mut data))
            .map_err(|e| TransportError::Fatal(format!("reading {}: {}", src.display(), e)))?;

        let mut remote = retry_eagain(|| session.scp_send(Path::new(dst), 0o644, data.len() as u64, None))
            .map_err(|e| TransportError::Channel(e.to_string()))?;

        let io_err = |e: io::Error| TransportError::Network(format!("scp to {}: {}", dst, e));
        let mut written = 0;
        while written < data.len() {
            match remote.write(&data[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(EAGAIN_SLEEP),
                Err(e) => return Err(io_err(e)),
            }
        }

        let close = |f: &mut Channel| -> Result<(), ssh2::Error> {
            retry_eagain(|| f.send_eof())?;
            retry_eagain(|| f.wait_eof())?;
            retry_eagain(|| f.close())?;
            retry_eagain(|| f.wait_close())
        };
        close(&mut remote).map_err(|e| TransportError::Network(e.to_string()))
    }
}

/// Repeat a libssh2 call while it reports `EAGAIN`
fn retry_eagain<T, F>(mut f: F) -> Result<T, ssh2::Error>
where
    F: FnMut() -> Result<T, ssh2::Error>,
{
    loop {
        match f() {
            Err(e) if e.code() == EAGAIN => thread::sleep(EAGAIN_SLEEP),
            other => return other,
        }
    }
}

/// A running remote command
pub struct SshChannel {
    channel: Channel,
}

impl SshChannel {
    /// Ok(0) from libssh2 is only end-of-stream once the peer sent EOF
    fn settle(&self, read: io::Result<usize>) -> io::Result<usize> {
        match read {
            Ok(0) if !self.channel.eof() => Err(io::Error::new(ErrorKind::WouldBlock, "no data")),
            other => other,
        }
    }
}

impl OutputSource for SshChannel {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.channel.read(buf);
        self.settle(read)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.channel.stderr().read(buf);
        self.settle(read)
    }

    fn exit_status(&mut self) -> io::Result<Option<i32>> {
        if !self.channel.eof() {
            return Ok(None);
        }
        match self.channel.wait_close() {
            Ok(()) => Ok(Some(self.channel.exit_status()?)),
            Err(e) if e.code() == EAGAIN => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
