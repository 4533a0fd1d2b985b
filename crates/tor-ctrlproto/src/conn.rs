//! The control connection: a handle for issuing commands, and the
//! reactor that services them.
//!
//! # Design
//!
//! A connection is split into two pieces: a [`ControlConn`] handle that
//! callers clone freely and use to queue commands or register event
//! listeners, and a [`Reactor`] that runs as a task in the background,
//! owning the transport.  The handle talks to the reactor over an
//! unbounded control channel; every operation that crosses the wire
//! resolves through a oneshot reply channel.
//!
//! Replies are matched to commands strictly first-in first-out.  The
//! control protocol is serial apart from asynchronous events, so FIFO
//! matching is correct and needs no request identifiers.  Every
//! 650-coded message is routed to the event dispatcher instead,
//! regardless of the command queue.
//!
//! Cancellation: dropping the future returned by a command operation
//! abandons the reply but does *not* remove the command from the FIFO;
//! the reactor still consumes the matched reply so that later commands
//! stay in sync.

mod reactor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use asynchronous_codec as futures_codec;
use futures::channel::{mpsc, oneshot};
use futures::io::{AsyncRead, AsyncWrite};
use futures::stream::StreamExt;

use crate::auth;
use crate::codec::ControlCodec;
use crate::events::ListenerId;
use crate::msg::{DEFAULT_VALUE, Event, Reply, quote_if_needed};
use crate::{Error, Result};

pub use reactor::Reactor;
use reactor::{BoxedCommandSink, BoxedLineStream, CtrlMsg};

/// The lifecycle state of a control connection.
///
/// ```text
/// Unauthenticated --authenticate ok--> Authenticated --bootstrap--> Ready
///       |                                    |
///       +------------error-----------> Failed (terminal) <---------+
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConnStatus {
    /// Connected, but the authentication handshake has not completed.
    Unauthenticated,
    /// Authenticated; commands are accepted by the daemon.
    Authenticated,
    /// Authenticated, and the client layers above have finished their
    /// bootstrap queries.
    Ready,
    /// The connection has failed; no further commands will succeed.
    Failed,
}

/// A handle to an open control-port connection.
///
/// All clones refer to the same connection.  The connection is one-shot:
/// once it fails or closes there is no reconnect; callers that need
/// resilience open a new one.
#[derive(Clone, Debug)]
pub struct ControlConn {
    /// A channel used to send control messages to the Reactor.
    control: mpsc::UnboundedSender<CtrlMsg>,
    /// If true, the reactor has stopped and this handle is dead.
    closed: Arc<AtomicBool>,
    /// The engine status, shared with the reactor.
    status: Arc<Mutex<ConnStatus>>,
    /// Source of listener identifiers for this connection.
    next_listener: Arc<AtomicU64>,
    /// Pid of the Tor process we own via TAKEOWNERSHIP, if any.
    owned_pid: Arc<Mutex<Option<u32>>>,
}

impl ControlConn {
    /// Wrap an open transport, returning a handle and the reactor that
    /// drives it.
    ///
    /// The caller must spawn a task that runs `reactor.run()`; until
    /// then, nothing is read or written.
    pub fn launch<T>(io: T) -> (Self, Reactor)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let framed = futures_codec::Framed::new(io, ControlCodec::default());
        let (sink, stream) = framed.split::<String>();
        Self::from_parts(Box::new(stream), Box::new(sink))
    }

    /// Build a connection from an already-framed line stream and command
    /// sink.  (Test instrumentation uses this to script the daemon side.)
    pub(crate) fn from_parts(input: BoxedLineStream, output: BoxedCommandSink) -> (Self, Reactor) {
        let (control_tx, control_rx) = mpsc::unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(ConnStatus::Unauthenticated));

        let conn = ControlConn {
            control: control_tx,
            closed: Arc::clone(&closed),
            status: Arc::clone(&status),
            next_listener: Arc::new(AtomicU64::new(1)),
            owned_pid: Arc::new(Mutex::new(None)),
        };
        let reactor = Reactor {
            control: control_rx,
            input: input.fuse(),
            output,
            pending: std::collections::VecDeque::new(),
            current: Vec::new(),
            dispatcher: crate::events::Dispatcher::new(),
            closed,
            status,
        };
        (conn, reactor)
    }

    /// Return true if this connection's reactor has stopped.
    pub fn is_closing(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Return the current lifecycle status of this connection.
    pub fn status(&self) -> ConnStatus {
        *self.status.lock().expect("poisoned lock")
    }

    /// Record a new lifecycle status.
    pub(crate) fn set_status(&self, status: ConnStatus) {
        *self.status.lock().expect("poisoned lock") = status;
    }

    /// Note that the client layers above have finished bootstrapping.
    ///
    /// Called by higher-level components (config and info mirrors) once
    /// their initial queries have completed.
    pub fn mark_ready(&self) {
        let mut status = self.status.lock().expect("poisoned lock");
        if *status == ConnStatus::Authenticated {
            *status = ConnStatus::Ready;
        }
    }

    /// Return the pid of the Tor process this connection owns, if the
    /// launcher has taken ownership of one.
    pub fn is_owned(&self) -> Option<u32> {
        *self.owned_pid.lock().expect("poisoned lock")
    }

    /// Record that we own the Tor process with the given pid.
    pub fn set_owned(&self, pid: u32) {
        *self.owned_pid.lock().expect("poisoned lock") = Some(pid);
    }

    /// Shut down this connection's reactor.
    ///
    /// Pending commands fail with `ConnectionClosed`; the daemon will
    /// see the transport close.
    pub fn terminate(&self) {
        let _ = self.control.unbounded_send(CtrlMsg::Shutdown);
    }

    /// Send a control message to the reactor.
    fn send_ctrl(&self, msg: CtrlMsg) -> Result<()> {
        self.control
            .unbounded_send(msg)
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Send a raw command and wait for its complete reply.
    ///
    /// The text is sent verbatim (the CRLF terminator is added by the
    /// framer).  A non-2xx reply resolves as [`Error::Command`]; that
    /// error affects only this command.
    pub async fn queue_command(&self, text: &str) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.send_ctrl(CtrlMsg::QueueCommand {
            text: text.to_owned(),
            tx,
        })?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Issue `GETINFO` for the given keys, returning a map from key to
    /// value.
    ///
    /// A key answered on a single line contributes its `k=v` value; a
    /// key answered with a multi-line body contributes the body (lines
    /// joined with `\n`, terminator removed).
    pub async fn get_info(&self, keys: &[&str]) -> Result<HashMap<String, String>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let reply = self
            .queue_command(&format!("GETINFO {}", keys.join(" ")))
            .await?;
        let mut map = HashMap::new();
        for line in &reply.lines {
            if line.end && line.payload == "OK" {
                continue;
            }
            match line.kv_value() {
                Some((k, v)) => {
                    map.insert(k.to_owned(), v.to_owned());
                }
                None => {
                    return Err(Error::Proto(format!(
                        "GETINFO reply line without '=': {:?}",
                        line.payload
                    )));
                }
            }
        }
        Ok(map)
    }

    /// Issue `GETCONF` for the given keys.
    ///
    /// Keys may repeat in the reply for list-valued options, so each key
    /// maps to a list.  A key reported without a value (set to its
    /// default) maps to the [`DEFAULT_VALUE`] sentinel.
    pub async fn get_conf(&self, keys: &[&str]) -> Result<HashMap<String, Vec<String>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let reply = self
            .queue_command(&format!("GETCONF {}", keys.join(" ")))
            .await?;
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for line in &reply.lines {
            match line.split_kv() {
                Some((k, v)) => map.entry(k.to_owned()).or_default().push(v.to_owned()),
                None => map
                    .entry(line.payload.clone())
                    .or_default()
                    .push(DEFAULT_VALUE.to_owned()),
            }
        }
        Ok(map)
    }

    /// Issue a single `SETCONF` with all the given pairs.
    ///
    /// The daemon applies the batch atomically: on a non-2xx reply, none
    /// of the pairs have been applied.
    pub async fn set_conf(&self, pairs: &[(&str, &str)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let args: Vec<String> = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, quote_if_needed(v)))
            .collect();
        self.queue_command(&format!("SETCONF {}", args.join(" ")))
            .await?;
        Ok(())
    }

    /// Issue `RESETCONF`, returning the given keys to their defaults.
    pub async fn reset_conf(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.queue_command(&format!("RESETCONF {}", keys.join(" ")))
            .await?;
        Ok(())
    }

    /// Deliver a `SIGNAL` (RELOAD, NEWNYM, DUMP, ...) to the daemon.
    pub async fn signal(&self, name: &str) -> Result<()> {
        self.queue_command(&format!("SIGNAL {}", name)).await?;
        Ok(())
    }

    /// Issue `TAKEOWNERSHIP`: the daemon will exit when this control
    /// connection closes.
    pub async fn take_ownership(&self) -> Result<()> {
        self.queue_command("TAKEOWNERSHIP").await?;
        Ok(())
    }

    /// Register `listener` for events named `name` (case-insensitive).
    ///
    /// If this subscription changes the aggregate event set, a
    /// `SETEVENTS` is sent before this method resolves, so that the
    /// daemon's active subscriptions always equal the union of local
    /// listeners.
    ///
    /// Listeners are called synchronously, in event arrival order, on
    /// the reactor task: they must not block or re-enter the connection
    /// with suspending operations.
    pub async fn add_event_listener<F>(&self, name: &str, listener: F) -> Result<ListenerId>
    where
        F: FnMut(&Event) + Send + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.send_ctrl(CtrlMsg::AddListener {
            name: name.to_owned(),
            id,
            listener: Box::new(listener),
            tx,
        })?;
        rx.await.map_err(|_| Error::ConnectionClosed)??;
        Ok(id)
    }

    /// Remove the listener registered under (`name`, `id`).
    ///
    /// If this leaves the aggregate event set smaller, the change is
    /// announced with a `SETEVENTS` before this method resolves.
    pub async fn remove_event_listener(&self, name: &str, id: ListenerId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_ctrl(CtrlMsg::RemoveListener {
            name: name.to_owned(),
            id,
            tx,
        })?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Authenticate to the daemon.
    ///
    /// Performs `PROTOCOLINFO 1`, picks the strongest mutually supported
    /// method (SAFECOOKIE, then COOKIE, then HASHEDPASSWORD, then NULL),
    /// and executes it.  `secret` is the passphrase for HASHEDPASSWORD;
    /// cookie-based methods read the cookie file named by PROTOCOLINFO.
    ///
    /// On success the connection transitions to
    /// [`ConnStatus::Authenticated`]; on failure it transitions to
    /// [`ConnStatus::Failed`] and should be discarded.
    pub async fn authenticate(&self, secret: Option<&str>) -> Result<()> {
        match auth::authenticate(self, secret).await {
            Ok(()) => {
                self.set_status(ConnStatus::Authenticated);
                Ok(())
            }
            Err(e) => {
                self.set_status(ConnStatus::Failed);
                Err(e)
            }
        }
    }
}
