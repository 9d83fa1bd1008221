// ============================================================================
// File: src/transport/manager.rs
// ----------------------------------------------------------------------------
// Session cache keyed by (hostname, port) and the libssh2 RemoteExecutor.
//
// Channel failures before a command starts are retried on a fresh session;
// nothing is retried once the command may have run. The manager is owned by whoever drives an operation and injected into the
// orchestrator; there is no process-wide connection state.
// ============================================================================

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::async_task::{AsyncTask, AsyncTaskBuilder};
use crate::config::CloneConfig;
use crate::error::{CloneError, CloneResult};
use crate::security::{expand_home, validate_hostname, validate_ssh_key_path, validate_username};

use super::alias::AliasFile;
use super::retry::{RetryPolicy, retry_with_backoff};
use super::session::{ConnectSettings, SshAuth, SshConnector};
use super::{CommandOutput, HostEndpoint, RemoteExecutor};

/// An authenticated connection that runs commands in two blocking halves
pub(crate) trait Connection: Send + Sync + Debug + 'static {
    /// A command that has been handed to the host
    type Running: Send + 'static;

    fn endpoint(&self) -> &HostEndpoint;

    /// Open a channel and start `command`; on error the host never saw it
    fn start(&self, command: &str) -> CloneResult<Self::Running>;

    /// Wait for a started command, tearing it down once `stop` is cancelled
    fn finish(&self, running: Self::Running, stop: &CancellationToken)
    -> CloneResult<CommandOutput>;

    fn upload(&self, local_path: &Path, remote_path: &str) -> CloneResult<u64>;

    fn disconnect(&self);
}

/// Opens [`Connection`]s; blocking, run inside `spawn_blocking`
pub(crate) trait Connector: Clone + Send + Sync + Debug + 'static {
    type Conn: Connection;

    fn connect(&self, endpoint: &HostEndpoint, auth: &SshAuth) -> CloneResult<Self::Conn>;
}

type SessionKey = (String, u16);

/// One slot per endpoint; the async lock serialises connection setup so
/// concurrent callers for the same host share one session
type SessionSlot<C> = Arc<tokio::sync::Mutex<Option<Arc<C>>>>;

/// Pick the login name for a host
///
/// Order: explicit setting, alias entry, `$USER`, the OS account running the
/// process, then `root` as a last resort.
pub fn resolve_username<F>(
    explicit: Option<&str>,
    alias_user: Option<&str>,
    env_user: Option<String>,
    os_user: F,
) -> String
where
    F: FnOnce() -> Option<String>,
{
    if let Some(user) = explicit.or(alias_user) {
        return user.to_string();
    }
    if let Some(user) = env_user.filter(|u| !u.is_empty()) {
        return user;
    }
    if let Some(user) = os_user() {
        return user;
    }
    warn!("Could not determine a username, falling back to root");
    "root".to_string()
}

#[cfg(unix)]
fn current_os_user() -> Option<String> {
    use nix::unistd::{Uid, User};
    User::from_uid(Uid::current()).ok().flatten().map(|u| u.name)
}

#[cfg(not(unix))]
fn current_os_user() -> Option<String> {
    None
}

#[derive(Debug)]
struct ManagerInner<K: Connector> {
    aliases: AliasFile,
    username: Option<String>,
    default_port: u16,
    key_path: Option<PathBuf>,
    connector: K,
    command_timeout: Duration,
    retry: RetryPolicy,
    sessions: Mutex<HashMap<SessionKey, SessionSlot<K::Conn>>>,
}

/// libssh2-backed [`RemoteExecutor`] with a per-endpoint session cache
#[derive(Debug, Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner<SshConnector>>,
}

impl SessionManager {
    /// Build a manager from configuration
    ///
    /// Validates the configured key file and loads the alias file up front
    /// so misconfiguration fails before any connection is attempted.
    pub fn new(config: &CloneConfig) -> CloneResult<Self> {
        config.validate()?;

        let key_path = config
            .ssh_key_path
            .as_deref()
            .map(validate_ssh_key_path)
            .transpose()?;

        let aliases = match &config.alias_file {
            Some(path) => AliasFile::load(path)?,
            None => AliasFile::default(),
        };

        Ok(Self::with_aliases(config, aliases, key_path))
    }

    pub(crate) fn with_aliases(
        config: &CloneConfig,
        aliases: AliasFile,
        key_path: Option<PathBuf>,
    ) -> Self {
        let connector = SshConnector {
            settings: ConnectSettings {
                known_hosts_file: config.known_hosts_file.clone(),
                host_key_policy: config.host_key_policy,
                connect_timeout: config.connect_timeout,
            },
        };
        Self {
            inner: Arc::new(ManagerInner::new(config, aliases, key_path, connector)),
        }
    }

    /// Number of cached sessions
    pub fn cached_sessions(&self) -> usize {
        self.inner.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl<K: Connector> ManagerInner<K> {
    fn new(config: &CloneConfig, aliases: AliasFile, key_path: Option<PathBuf>, connector: K) -> Self {
        Self {
            aliases,
            username: config.username.clone(),
            default_port: config.ssh_port,
            key_path,
            connector,
            command_timeout: config.command_timeout,
            retry: config.retry_policy(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, host: &str) -> CloneResult<HostEndpoint> {
        validate_hostname(host)?;
        let found = self.aliases.lookup(host);

        let hostname = found.hostname.unwrap_or_else(|| host.to_string());
        validate_hostname(&hostname)?;

        let username = resolve_username(
            self.username.as_deref(),
            found.user.as_deref(),
            std::env::var("USER").ok(),
            current_os_user,
        );
        validate_username(&username)?;

        Ok(HostEndpoint {
            alias: host.to_string(),
            hostname,
            port: found.port.unwrap_or(self.default_port),
            username,
            identity_file: found.identity_file.or_else(|| self.key_path.clone()),
        })
    }

    fn slot(&self, endpoint: &HostEndpoint) -> CloneResult<SessionSlot<K::Conn>> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| CloneError::internal("Session cache lock poisoned"))?;
        Ok(sessions
            .entry((endpoint.hostname.clone(), endpoint.port))
            .or_default()
            .clone())
    }

    async fn session(&self, host: &str) -> CloneResult<Arc<K::Conn>> {
        let endpoint = self.resolve(host)?;
        let slot = self.slot(&endpoint)?;
        let mut cached = slot.lock().await;

        if let Some(session) = cached.as_ref() {
            return Ok(session.clone());
        }

        let auth = match &endpoint.identity_file {
            Some(path) => SshAuth::Key(expand_home(path)),
            None => SshAuth::Agent,
        };

        let session = retry_with_backoff(&self.retry, host, |attempt| {
            let endpoint = endpoint.clone();
            let auth = auth.clone();
            let connector = self.connector.clone();
            debug!("Connection attempt {attempt} host={host}");
            async move {
                tokio::task::spawn_blocking(move || connector.connect(&endpoint, &auth)).await?
            }
        })
        .await?;

        info!(
            "Connected host={} addr={}:{}",
            host, endpoint.hostname, endpoint.port
        );
        let session = Arc::new(session);
        *cached = Some(session.clone());
        Ok(session)
    }

    fn evict(&self, endpoint: &HostEndpoint) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if sessions
                .remove(&(endpoint.hostname.clone(), endpoint.port))
                .is_some()
            {
                debug!("Evicted session host={}", endpoint.alias);
            }
        }
    }

    /// Start `command`, reconnecting when the channel cannot be opened
    async fn start(
        &self,
        host: &str,
        command: &str,
    ) -> CloneResult<(Arc<K::Conn>, <K::Conn as Connection>::Running)> {
        let mut attempt = 1;
        loop {
            let session = self.session(host).await?;
            let task_session = session.clone();
            let task_command = command.to_string();
            let started =
                tokio::task::spawn_blocking(move || task_session.start(&task_command)).await?;

            let e = match started {
                Ok(running) => return Ok((session, running)),
                Err(e) => e,
            };
            // A session that cannot open channels is not reused
            self.evict(session.endpoint());
            if !e.is_retryable() {
                return Err(e);
            }
            if attempt >= self.retry.max_attempts {
                error!("Giving up on host={host} after {attempt} attempts: {e}");
                return Err(e);
            }
            let delay = self.retry.delay_for(attempt);
            warn!(
                "Could not start command on host={host} (attempt {attempt}/{}): {e}; reconnecting in {:?}",
                self.retry.max_attempts, delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn execute(
        &self,
        host: &str,
        command: &str,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> CloneResult<CommandOutput> {
        let timeout = timeout.unwrap_or(self.command_timeout);
        let (session, running) = self.start(host, command).await?;

        let stop = cancel.child_token();
        let task_session = session.clone();
        let task_stop = stop.clone();
        let blocking =
            tokio::task::spawn_blocking(move || task_session.finish(running, &task_stop));

        match tokio::time::timeout(timeout, blocking).await {
            Err(_) => {
                // The channel may still be busy; close it and do not hand the
                // session to anyone else
                stop.cancel();
                self.evict(session.endpoint());
                Err(CloneError::Timeout {
                    host: host.to_string(),
                    operation: command.split_whitespace().next().unwrap_or("command").to_string(),
                    seconds: timeout.as_secs(),
                })
            }
            Ok(joined) => {
                let result = joined?;
                match &result {
                    Err(CloneError::Ssh { .. }) => self.evict(session.endpoint()),
                    Err(CloneError::Cancelled { .. }) => {
                        info!("Stopped remote command host={host}");
                    }
                    _ => {}
                }
                result
            }
        }
    }

    async fn upload(&self, host: &str, local_path: PathBuf, remote_path: String) -> CloneResult<u64> {
        let session = self.session(host).await?;
        let task_session = session.clone();
        let result =
            tokio::task::spawn_blocking(move || task_session.upload(&local_path, &remote_path))
                .await?;
        if let Err(CloneError::Ssh { .. }) = &result {
            self.evict(session.endpoint());
        }
        result
    }
}

impl RemoteExecutor for SessionManager {
    fn execute(
        &self,
        host: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> AsyncTask<CloneResult<CommandOutput>> {
        let inner = self.inner.clone();
        let host = host.to_string();
        let command = command.to_string();
        AsyncTaskBuilder::new(async move {
            inner
                .execute(&host, &command, timeout, CancellationToken::new())
                .await
        })
        .spawn()
    }

    fn execute_cancellable(
        &self,
        host: &str,
        command: &str,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> AsyncTask<CloneResult<CommandOutput>> {
        let inner = self.inner.clone();
        let host = host.to_string();
        let command = command.to_string();
        AsyncTaskBuilder::new(async move { inner.execute(&host, &command, timeout, cancel).await })
            .spawn()
    }

    fn upload(
        &self,
        host: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> AsyncTask<CloneResult<u64>> {
        let inner = self.inner.clone();
        let host = host.to_string();
        let local_path = local_path.to_path_buf();
        let remote_path = remote_path.to_string();
        AsyncTaskBuilder::new(async move { inner.upload(&host, local_path, remote_path).await })
            .spawn()
    }

    fn resolve(&self, host: &str) -> CloneResult<HostEndpoint> {
        self.inner.resolve(host)
    }

    fn close_all(&self) {
        let slots: Vec<SessionSlot<_>> = match self.inner.sessions.lock() {
            Ok(mut sessions) => sessions.drain().map(|(_, slot)| slot).collect(),
            Err(_) => return,
        };

        for slot in slots {
            // A slot still locked is mid-connect; dropping our handle is enough
            if let Ok(mut cached) = slot.try_lock() {
                if let Some(session) = cached.take() {
                    session.disconnect();
                }
            }
        }
        info!("Closed all cached sessions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::transport::{AliasFile, HostKeyPolicy};

    #[derive(Debug, Default)]
    struct Script {
        connects: AtomicUsize,
        starts: AtomicUsize,
        failing_starts: AtomicUsize,
        failing_finish: AtomicBool,
        hang: AtomicBool,
        stopped: AtomicBool,
    }

    #[derive(Debug, Clone, Default)]
    struct ScriptedConnector {
        script: Arc<Script>,
    }

    #[derive(Debug)]
    struct ScriptedConnection {
        endpoint: HostEndpoint,
        script: Arc<Script>,
    }

    impl Connector for ScriptedConnector {
        type Conn = ScriptedConnection;

        fn connect(&self, endpoint: &HostEndpoint, _auth: &SshAuth) -> CloneResult<ScriptedConnection> {
            self.script.connects.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedConnection {
                endpoint: endpoint.clone(),
                script: self.script.clone(),
            })
        }
    }

    impl ScriptedConnection {
        fn ssh_failure(&self, operation: &str) -> CloneError {
            CloneError::Ssh {
                host: self.endpoint.hostname.clone(),
                operation: operation.into(),
                message: "channel open failed".into(),
            }
        }
    }

    impl Connection for ScriptedConnection {
        type Running = String;

        fn endpoint(&self) -> &HostEndpoint {
            &self.endpoint
        }

        fn start(&self, command: &str) -> CloneResult<String> {
            let n = self.script.starts.fetch_add(1, Ordering::SeqCst);
            if n < self.script.failing_starts.load(Ordering::SeqCst) {
                return Err(self.ssh_failure("channel"));
            }
            Ok(command.to_string())
        }

        fn finish(&self, running: String, stop: &CancellationToken) -> CloneResult<CommandOutput> {
            if self.script.hang.load(Ordering::SeqCst) {
                while !stop.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                self.script.stopped.store(true, Ordering::SeqCst);
                return Err(CloneError::Cancelled { operation_id: running });
            }
            if self.script.failing_finish.load(Ordering::SeqCst) {
                return Err(self.ssh_failure("read stdout"));
            }
            Ok(CommandOutput {
                stdout: format!("ran {running}"),
                ..CommandOutput::default()
            })
        }

        fn upload(&self, _local_path: &Path, _remote_path: &str) -> CloneResult<u64> {
            Ok(0)
        }

        fn disconnect(&self) {}
    }

    fn scripted() -> (ManagerInner<ScriptedConnector>, Arc<Script>) {
        let connector = ScriptedConnector::default();
        let script = connector.script.clone();
        let config = CloneConfig::default()
            .with_username("deploy")
            .with_retry(3, Duration::from_millis(1));
        let inner = ManagerInner::new(&config, AliasFile::default(), None, connector);
        (inner, script)
    }

    fn manager(aliases: &str) -> SessionManager {
        let config = CloneConfig::default()
            .with_username("deploy")
            .with_host_key_policy(HostKeyPolicy::Accept);
        SessionManager::with_aliases(&config, AliasFile::parse(aliases), None)
    }

    #[test]
    fn username_resolution_order() {
        let none = || None;
        assert_eq!(
            resolve_username(Some("explicit"), Some("alias"), Some("env".into()), none),
            "explicit"
        );
        assert_eq!(
            resolve_username(None, Some("alias"), Some("env".into()), none),
            "alias"
        );
        assert_eq!(resolve_username(None, None, Some("env".into()), none), "env");
        assert_eq!(
            resolve_username(None, None, None, || Some("os".into())),
            "os"
        );
        assert_eq!(resolve_username(None, None, Some(String::new()), none), "root");
    }

    #[test]
    fn resolve_applies_alias_remapping() {
        let mgr = manager("Host web1\n  HostName 10.0.0.5\n  Port 2222\n");
        let endpoint = mgr.resolve("web1").unwrap();
        assert_eq!(endpoint.alias, "web1");
        assert_eq!(endpoint.hostname, "10.0.0.5");
        assert_eq!(endpoint.port, 2222);
        assert_eq!(endpoint.username, "deploy");

        let plain = mgr.resolve("hostB").unwrap();
        assert_eq!(plain.hostname, "hostB");
        assert_eq!(plain.port, 22);
    }

    #[test]
    fn resolve_rejects_unsafe_hosts() {
        let mgr = manager("Host evil\n  HostName bad;host\n");
        assert!(mgr.resolve("host;id").is_err());
        assert!(mgr.resolve("evil").is_err());
    }

    #[tokio::test]
    async fn close_all_empties_cache() {
        let mgr = manager("");
        let endpoint = mgr.resolve("hostA").unwrap();
        mgr.inner.slot(&endpoint).unwrap();
        assert_eq!(mgr.cached_sessions(), 1);
        mgr.close_all();
        assert_eq!(mgr.cached_sessions(), 0);
    }

    #[tokio::test]
    async fn channel_failure_before_start_reconnects_and_retries() {
        let (inner, script) = scripted();
        script.failing_starts.store(1, Ordering::SeqCst);

        let output = inner
            .execute("hostA", "uptime", None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.stdout, "ran uptime");
        assert_eq!(script.connects.load(Ordering::SeqCst), 2);
        assert_eq!(script.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn start_failures_stop_at_the_attempt_budget() {
        let (inner, script) = scripted();
        script.failing_starts.store(10, Ordering::SeqCst);

        let err = inner
            .execute("hostA", "uptime", None, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CloneError::Ssh { .. }));
        assert_eq!(script.starts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failure_after_start_is_not_retried() {
        let (inner, script) = scripted();
        script.failing_finish.store(true, Ordering::SeqCst);

        let err = inner
            .execute("hostA", "rsync -a /a b:/c", None, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CloneError::Ssh { .. }));
        assert_eq!(script.starts.load(Ordering::SeqCst), 1);
        // The broken session was dropped from the cache
        let endpoint = inner.resolve("hostA").unwrap();
        assert!(inner.slot(&endpoint).unwrap().lock().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_reaches_the_running_command() {
        let (inner, script) = scripted();
        script.hang.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = inner
            .execute("hostA", "dd if=/a", Some(Duration::from_secs(30)), cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, CloneError::Cancelled { .. }));
        assert!(script.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn timeout_closes_the_running_command() {
        let (inner, script) = scripted();
        script.hang.store(true, Ordering::SeqCst);

        let err = inner
            .execute("hostA", "dd if=/a", Some(Duration::from_millis(20)), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CloneError::Timeout { .. }));

        for _ in 0..200 {
            if script.stopped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(script.stopped.load(Ordering::SeqCst));
    }
}
