//! Launching and owning a Tor subprocess.
//!
//! The launcher writes a seed torrc from a [`TorConfig`], spawns
//! `tor -f <torrc>`, and watches the child's stdout for its first
//! `Bootstrap` message before attempting the control-port connection
//! (earlier attempts would race Tor opening the port).  Once connected
//! it authenticates with the freshly written cookie, takes ownership of
//! the process, and follows `STATUS_CLIENT` bootstrap events until the
//! daemon reaches 100%.
//!
//! Anything the child writes to stderr is treated as fatal, and a
//! nonzero exit fails the launch.  The generated torrc and (if we
//! created it) the data directory are removal-guarded, so they are
//! cleaned up on every exit path.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use futures::StreamExt;
use futures::channel::mpsc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, warn};

use tor_ctrlproto::ControlConn;
use tor_ctrlproto::msg::{parse_keywords, split_quoted};

use crate::config::TorConfig;
use crate::err::LaunchError;

/// The control port used when the caller does not pick one.
const DEFAULT_CONTROL_PORT: u16 = 9052;

/// A bootstrap progress report: percent, tag, summary.
type Progress = (u8, String, String);

/// Future returned by a [`Connector`].
type ConnectorFuture = Pin<Box<dyn Future<Output = std::io::Result<ControlConn>> + Send>>;

/// Callable that produces a control connection to the new daemon.
///
/// The default dials `127.0.0.1:<control_port>`; tests inject their
/// own.
pub type Connector = Box<dyn FnMut() -> ConnectorFuture + Send>;

/// Callback type for bootstrap progress reports.
pub type ProgressFn = Box<dyn FnMut(u8, &str, &str) + Send>;

/// Options for launching a Tor subprocess.
pub struct LaunchOptions {
    /// The configuration to seed the new daemon with.
    config: TorConfig,
    /// Path of the tor binary.
    tor_binary: PathBuf,
    /// Control port the daemon should listen on.
    control_port: u16,
    /// Data directory; a fresh temporary directory when unset.
    data_directory: Option<PathBuf>,
    /// Progress callback, if the caller wants reports.
    progress: Option<ProgressFn>,
    /// Connection factory override, for tests.
    connector: Option<Connector>,
}

impl LaunchOptions {
    /// Start from a configuration (typically a detached one).
    pub fn new(config: TorConfig) -> LaunchOptions {
        LaunchOptions {
            config,
            tor_binary: PathBuf::from("tor"),
            control_port: DEFAULT_CONTROL_PORT,
            data_directory: None,
            progress: None,
            connector: None,
        }
    }

    /// Use a specific tor binary.
    pub fn tor_binary<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.tor_binary = path.into();
        self
    }

    /// Use a specific control port.
    pub fn control_port(mut self, port: u16) -> Self {
        self.control_port = port;
        self
    }

    /// Use (and keep) a specific data directory instead of a temporary
    /// one.  Caller-provided directories are never deleted.
    pub fn data_directory<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.data_directory = Some(dir.into());
        self
    }

    /// Receive `(percent, tag, summary)` bootstrap reports.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: FnMut(u8, &str, &str) + Send + 'static,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Replace the control-connection factory.
    pub fn connector(mut self, connector: Connector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Launch the daemon; see [`launch`].
    pub async fn launch(self) -> Result<LaunchedTor, LaunchError> {
        launch(self).await
    }
}

/// A launched, bootstrapped, owned Tor daemon.
///
/// Dropping this value kills the child process and removes the
/// temporary artifacts.  Because the daemon was told `TAKEOWNERSHIP`,
/// it also exits on its own if the control connection closes.
#[derive(Debug)]
pub struct LaunchedTor {
    /// The authenticated control connection; `is_owned()` reports the
    /// child's pid.
    conn: ControlConn,
    /// The child's pid.
    pid: u32,
    /// The child process handle (kill-on-drop).
    child: Child,
    /// Where the daemon keeps its state.
    data_directory: PathBuf,
    /// Removal guard for a data directory we created ourselves.
    _data_dir_guard: Option<tempfile::TempDir>,
    /// Removal guard for the generated torrc.
    _torrc_guard: tempfile::NamedTempFile,
}

impl LaunchedTor {
    /// The control connection to the daemon.
    pub fn conn(&self) -> &ControlConn {
        &self.conn
    }

    /// The daemon's process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The daemon's data directory.
    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    /// Shut the daemon down and wait for it to exit.
    pub async fn shutdown(mut self) -> Result<(), LaunchError> {
        self.conn.terminate();
        self.child.kill().await?;
        Ok(())
    }
}

/// Spawn a Tor subprocess seeded from `options.config`, wait for it to
/// reach 100% bootstrap, and return the owned daemon.
pub async fn launch(options: LaunchOptions) -> Result<LaunchedTor, LaunchError> {
    let LaunchOptions {
        mut config,
        tor_binary,
        control_port,
        data_directory,
        mut progress,
        connector,
    } = options;

    let (data_directory, data_dir_guard) = match data_directory {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            (dir, None)
        }
        None => {
            let guard = tempfile::Builder::new().prefix("tortmp").tempdir()?;
            (guard.path().to_path_buf(), Some(guard))
        }
    };

    config.set_unchecked("DataDirectory", data_directory.display().to_string());
    config.set_unchecked("ControlPort", i64::from(control_port));
    config.set_unchecked("CookieAuthentication", 1_i64);
    config.set_unchecked("SocksPort", 0_i64);
    config.set_unchecked("__OwningControllerProcess", i64::from(std::process::id()));

    let mut torrc_guard = tempfile::Builder::new()
        .prefix("tortmp")
        .suffix(".torrc")
        .tempfile()?;
    std::io::Write::write_all(torrc_guard.as_file_mut(), config.create_torrc().as_bytes())?;

    debug!("spawning {:?} -f {:?}", tor_binary, torrc_guard.path());
    let mut child = Command::new(&tor_binary)
        .arg("-f")
        .arg(torrc_guard.path())
        .env("HOME", &data_directory)
        .current_dir(&data_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let pid = child.id().unwrap_or_default();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("child stderr was not captured"))?;
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_done = false;
    let mut stderr_done = false;

    let mut connector: Connector = connector.unwrap_or_else(|| default_connector(control_port));
    let (progress_tx, mut progress_rx) = mpsc::unbounded::<Progress>();

    let mut stdout_log: Vec<String> = Vec::new();
    let mut attempted_connect = false;
    let mut conn: Option<ControlConn> = None;

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status?;
                warn!("tor exited during launch: {:?}", status);
                // Collect whatever stdout is still buffered, for the report.
                while let Ok(Some(line)) = stdout_lines.next_line().await {
                    stdout_log.push(line);
                }
                return Err(LaunchError::SubprocessExit {
                    code: status.code(),
                    stdout: stdout_log,
                });
            }

            line = stderr_lines.next_line(), if !stderr_done => {
                match line? {
                    Some(line) => return Err(LaunchError::SubprocessStderr(line)),
                    None => stderr_done = true,
                }
            }

            line = stdout_lines.next_line(), if !stdout_done => {
                match line? {
                    None => stdout_done = true,
                    Some(line) => {
                        debug!("tor stdout: {}", line);
                        let saw_bootstrap = line.contains("Bootstrap");
                        stdout_log.push(line);
                        // Tor has no "control port open" notification;
                        // its first bootstrap message is the accepted
                        // signal that the port is (probably) up.
                        if saw_bootstrap && !attempted_connect && conn.is_none() {
                            attempted_connect = true;
                            match connector().await {
                                Ok(new_conn) => {
                                    adopt_daemon(&new_conn, pid, &progress_tx).await?;
                                    conn = Some(new_conn);
                                }
                                Err(e) => {
                                    // Not up yet; retry at the next line.
                                    debug!("control port not ready: {}", e);
                                    attempted_connect = false;
                                }
                            }
                        }
                    }
                }
            }

            report = progress_rx.next() => {
                if let Some((percent, tag, summary)) = report {
                    if let Some(callback) = progress.as_mut() {
                        callback(percent, &tag, &summary);
                    }
                    if percent >= 100 {
                        let conn = conn
                            .take()
                            .ok_or_else(|| std::io::Error::other("progress before connect"))?;
                        return Ok(LaunchedTor {
                            conn,
                            pid,
                            child,
                            data_directory,
                            _data_dir_guard: data_dir_guard,
                            _torrc_guard: torrc_guard,
                        });
                    }
                }
            }
        }
    }
}

/// Authenticate to the fresh daemon, take ownership, and wire bootstrap
/// events into the progress channel.
async fn adopt_daemon(
    conn: &ControlConn,
    pid: u32,
    progress_tx: &mpsc::UnboundedSender<Progress>,
) -> Result<(), LaunchError> {
    conn.authenticate(None).await?;
    conn.take_ownership().await?;
    conn.reset_conf(&["__OwningControllerProcess"]).await?;
    conn.set_owned(pid);

    let tx = progress_tx.clone();
    conn.add_event_listener("STATUS_CLIENT", move |ev| {
        if let Some(report) = parse_bootstrap(&ev.payload) {
            let _ = tx.unbounded_send(report);
        }
    })
    .await?;

    // The daemon may have bootstrapped past interesting events before
    // we subscribed; fold in its current phase.
    let phase = conn.get_info(&["status/bootstrap-phase"]).await?;
    if let Some(line) = phase.get("status/bootstrap-phase") {
        if let Some(report) = parse_bootstrap(line) {
            let _ = progress_tx.unbounded_send(report);
        }
    }
    Ok(())
}

/// Parse `<severity> BOOTSTRAP PROGRESS=n TAG=t SUMMARY="s"` into a
/// progress report; None for other STATUS_CLIENT payloads.
fn parse_bootstrap(payload: &str) -> Option<Progress> {
    let tokens = split_quoted(payload);
    if tokens.get(1).map(String::as_str) != Some("BOOTSTRAP") {
        return None;
    }
    let kw = parse_keywords(tokens.iter().map(String::as_str));
    let percent = kw.get("PROGRESS")?.parse().ok()?;
    let tag = kw.get("TAG").copied().unwrap_or_default().to_owned();
    let summary = kw.get("SUMMARY").copied().unwrap_or_default().to_owned();
    Some((percent, tag, summary))
}

/// The default connection factory: dial the control port on loopback
/// and spawn the reactor on the current runtime.
fn default_connector(port: u16) -> Connector {
    Box::new(move || {
        Box::pin(async move {
            let sock = TcpStream::connect(("127.0.0.1", port)).await?;
            sock.set_nodelay(true)?;
            let (conn, reactor) = ControlConn::launch(sock.compat());
            tokio::spawn(reactor.run());
            Ok(conn)
        })
    })
}
