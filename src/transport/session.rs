// ============================================================================
// File: src/transport/session.rs
// ----------------------------------------------------------------------------
// One authenticated libssh2 session to a (hostname, port) pair.
//
// Every method here blocks; callers run them inside `spawn_blocking`.
// ============================================================================

use std::fs::File;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info, warn};
use ssh2::{Channel, Session};
use tokio_util::sync::CancellationToken;

use crate::error::{CloneError, CloneResult};

use super::host_key::{HostKeyPolicy, verify_host_key};
use super::manager::{Connection, Connector};
use super::{CommandOutput, HostEndpoint};

/// How long a blocking read waits before looking at the stop token again
const POLL_INTERVAL: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 32 * 1024;

/// Authentication method for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAuth {
    /// Keys held by a running ssh-agent
    Agent,
    /// Private key file
    Key(PathBuf),
}

/// Handshake parameters shared by every connection a manager opens
#[derive(Debug, Clone)]
pub(crate) struct ConnectSettings {
    pub known_hosts_file: Option<PathBuf>,
    pub host_key_policy: HostKeyPolicy,
    pub connect_timeout: Duration,
}

/// Opens libssh2 sessions for the manager
#[derive(Debug, Clone)]
pub(crate) struct SshConnector {
    pub settings: ConnectSettings,
}

impl Connector for SshConnector {
    type Conn = RemoteSession;

    fn connect(&self, endpoint: &HostEndpoint, auth: &SshAuth) -> CloneResult<RemoteSession> {
        RemoteSession::connect(endpoint, auth, &self.settings)
    }
}

/// Live, authenticated connection
pub struct RemoteSession {
    endpoint: HostEndpoint,
    session: Mutex<Session>,
    open_timeout: Duration,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

fn ssh_error(endpoint: &HostEndpoint, operation: &str, err: impl std::fmt::Display) -> CloneError {
    CloneError::Ssh {
        host: endpoint.hostname.clone(),
        operation: operation.to_string(),
        message: err.to_string(),
    }
}

fn auth_error(endpoint: &HostEndpoint, auth: &SshAuth, err: impl std::fmt::Display) -> CloneError {
    let hint = match auth {
        SshAuth::Agent => "Make sure ssh-agent is running and holds a key (ssh-add -l)".to_string(),
        SshAuth::Key(path) => format!("Check that {} is the right key", path.display()),
    };
    CloneError::Authentication {
        host: endpoint.hostname.clone(),
        message: format!(
            "Authentication failed for {}: {err}. {hint}, and that its public key is in \
             ~{}/.ssh/authorized_keys on {}.",
            endpoint.login(),
            endpoint.username,
            endpoint.hostname,
        ),
    }
}

impl RemoteSession {
    /// Connect, verify the host key, and authenticate
    pub(crate) fn connect(
        endpoint: &HostEndpoint,
        auth: &SshAuth,
        settings: &ConnectSettings,
    ) -> CloneResult<Self> {
        info!(
            "Connecting host={} addr={}:{} user={}",
            endpoint.alias, endpoint.hostname, endpoint.port, endpoint.username
        );

        let connection_error = |message: String| CloneError::Connection {
            host: endpoint.hostname.clone(),
            message,
        };

        let addr = (endpoint.hostname.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|e| connection_error(format!("Failed to resolve address: {e}")))?
            .next()
            .ok_or_else(|| connection_error("Address resolved to nothing".to_string()))?;

        let tcp = TcpStream::connect_timeout(&addr, settings.connect_timeout)
            .map_err(|e| connection_error(format!("Failed to connect to {addr}: {e}")))?;

        let mut session = Session::new().map_err(|e| ssh_error(endpoint, "session", e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(settings.connect_timeout));
        session
            .handshake()
            .map_err(|e| ssh_error(endpoint, "handshake", e))?;

        verify_host_key(
            &session,
            endpoint,
            settings.known_hosts_file.as_deref(),
            settings.host_key_policy,
        )?;

        let result = match auth {
            SshAuth::Agent => session.userauth_agent(&endpoint.username),
            SshAuth::Key(path) => {
                session.userauth_pubkey_file(&endpoint.username, None, path, None)
            }
        };
        result.map_err(|e| auth_error(endpoint, auth, e))?;

        if !session.authenticated() {
            return Err(auth_error(endpoint, auth, "server rejected credentials"));
        }

        Ok(Self {
            endpoint: endpoint.clone(),
            session: Mutex::new(session),
            open_timeout: settings.connect_timeout,
        })
    }

    pub fn endpoint(&self) -> &HostEndpoint {
        &self.endpoint
    }

    fn handle(&self) -> CloneResult<Session> {
        self.session
            .lock()
            .map(|s| s.clone())
            .map_err(|_| CloneError::internal("SSH session lock poisoned"))
    }

    /// Open a channel and start `command` on it
    pub(crate) fn start(&self, command: &str) -> CloneResult<Channel> {
        let session = self.handle()?;
        session.set_timeout(millis(self.open_timeout));

        debug!("Executing on host={}: {}", self.endpoint.alias, command);

        let mut channel = session
            .channel_session()
            .map_err(|e| ssh_error(&self.endpoint, "channel", e))?;
        channel
            .exec(command)
            .map_err(|e| ssh_error(&self.endpoint, "exec", e))?;
        Ok(channel)
    }

    /// Drain a started command and collect its exit status
    ///
    /// Reads wake every [`POLL_INTERVAL`] to look at `stop`; once it is
    /// cancelled the channel is closed and the remote process loses its
    /// stdio.
    pub(crate) fn finish(
        &self,
        mut channel: Channel,
        stop: &CancellationToken,
    ) -> CloneResult<CommandOutput> {
        let session = self.handle()?;
        session.set_timeout(millis(POLL_INTERVAL));

        let mut buf = vec![0u8; READ_CHUNK];
        let mut stdout = Vec::new();
        loop {
            if stop.is_cancelled() {
                return Err(self.abandon(&mut channel));
            }
            if pump(&mut channel, &mut buf, &mut stdout)
                .map_err(|e| ssh_error(&self.endpoint, "read stdout", e))?
            {
                break;
            }
        }

        let mut stderr = Vec::new();
        let mut stream = channel.stderr();
        loop {
            if stop.is_cancelled() {
                drop(stream);
                return Err(self.abandon(&mut channel));
            }
            if pump(&mut stream, &mut buf, &mut stderr)
                .map_err(|e| ssh_error(&self.endpoint, "read stderr", e))?
            {
                break;
            }
        }
        drop(stream);

        loop {
            match channel.wait_close() {
                Ok(()) => break,
                Err(e) => {
                    let e = io::Error::from(e);
                    if !idle(&e) {
                        return Err(ssh_error(&self.endpoint, "close", e));
                    }
                    if stop.is_cancelled() {
                        return Err(self.abandon(&mut channel));
                    }
                }
            }
        }
        let exit_code = channel
            .exit_status()
            .map_err(|e| ssh_error(&self.endpoint, "exit status", e))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    /// Close a channel whose command we no longer want
    fn abandon(&self, channel: &mut Channel) -> CloneError {
        warn!("Closing channel on host={} after cancellation", self.endpoint.alias);
        let _ = channel.send_eof();
        let _ = channel.close();
        CloneError::Cancelled {
            operation_id: format!("command on {}", self.endpoint.alias),
        }
    }

    /// Copy a local file to the host over SCP
    pub(crate) fn upload(&self, local_path: &Path, remote_path: &str) -> CloneResult<u64> {
        let session = self.handle()?;
        session.set_timeout(millis(self.open_timeout));

        let mut local = File::open(local_path).map_err(|e| {
            CloneError::internal(format!("Failed to open {}: {e}", local_path.display()))
        })?;
        let size = local
            .metadata()
            .map_err(|e| CloneError::internal(format!("Failed to stat {}: {e}", local_path.display())))?
            .len();

        let mut remote = session
            .scp_send(Path::new(remote_path), 0o600, size, None)
            .map_err(|e| ssh_error(&self.endpoint, "scp", e))?;

        let sent = io::copy(&mut local, &mut remote)
            .map_err(|e| ssh_error(&self.endpoint, "scp write", e))?;

        remote
            .send_eof()
            .and_then(|_| remote.wait_eof())
            .and_then(|_| remote.close())
            .and_then(|_| remote.wait_close())
            .map_err(|e| ssh_error(&self.endpoint, "scp close", e))?;

        debug!(
            "Uploaded {} bytes to host={} path={}",
            sent, self.endpoint.alias, remote_path
        );
        Ok(sent)
    }

    /// Tell the server we are leaving; errors are irrelevant at this point
    pub(crate) fn disconnect(&self) {
        if let Ok(session) = self.handle() {
            let _ = session.disconnect(None, "closing", None);
        }
    }
}

impl Connection for RemoteSession {
    type Running = Channel;

    fn endpoint(&self) -> &HostEndpoint {
        &self.endpoint
    }

    fn start(&self, command: &str) -> CloneResult<Channel> {
        RemoteSession::start(self, command)
    }

    fn finish(&self, running: Channel, stop: &CancellationToken) -> CloneResult<CommandOutput> {
        RemoteSession::finish(self, running, stop)
    }

    fn upload(&self, local_path: &Path, remote_path: &str) -> CloneResult<u64> {
        RemoteSession::upload(self, local_path, remote_path)
    }

    fn disconnect(&self) {
        RemoteSession::disconnect(self)
    }
}

/// Read one chunk into `sink`; `Ok(true)` at end of stream
fn pump(reader: &mut impl Read, buf: &mut [u8], sink: &mut Vec<u8>) -> io::Result<bool> {
    match reader.read(buf) {
        Ok(0) => Ok(true),
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(false)
        }
        Err(e) if idle(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Errors that only mean the poll interval elapsed
fn idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}
