//! Code to handle traffic on a control connection.
//!
//! The role of this code is to run in a separate asynchronous task,
//! matching replies to queued commands and routing asynchronous events
//! to their listeners.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::Sink;
use futures::channel::{mpsc, oneshot};
use futures::select_biased;
use futures::sink::SinkExt;
use futures::stream::{Fuse, Stream, StreamExt};
use tracing::{debug, trace, warn};

use crate::conn::ConnStatus;
use crate::events::{Dispatcher, EventListener, ListenerId};
use crate::msg::{Event, Reply, ReplyLine};
use crate::{Error, Result};

/// A boxed trait object that can provide decoded reply lines.
pub(crate) type BoxedLineStream =
    Box<dyn Stream<Item = Result<ReplyLine>> + Send + Unpin + 'static>;
/// A boxed trait object that can sink command lines.
pub(crate) type BoxedCommandSink =
    Box<dyn Sink<String, Error = Error> + Send + Unpin + 'static>;

/// A message telling the reactor to do something.
pub(crate) enum CtrlMsg {
    /// Send a command to the daemon, and deliver its reply on `tx`.
    QueueCommand {
        /// The command text, without its CRLF terminator.
        text: String,
        /// Oneshot channel awaiting the matched reply.
        tx: oneshot::Sender<Result<Reply>>,
    },
    /// Register an event listener, updating `SETEVENTS` if needed.
    AddListener {
        /// The event name subscribed to.
        name: String,
        /// Caller-visible identity of the listener.
        id: ListenerId,
        /// The listener callback itself.
        listener: EventListener,
        /// Resolved once the subscription change is on the wire (and
        /// acknowledged, if a `SETEVENTS` had to be sent).
        tx: oneshot::Sender<Result<()>>,
    },
    /// Remove an event listener, updating `SETEVENTS` if needed.
    RemoveListener {
        /// The event name the listener was registered under.
        name: String,
        /// Identity returned at registration time.
        id: ListenerId,
        /// Resolved as for `AddListener`.
        tx: oneshot::Sender<Result<()>>,
    },
    /// Shut down the reactor.
    Shutdown,
}

/// Where one pending command's reply should be delivered.
///
/// Entries live in the FIFO from the moment the command is put on the
/// wire until its reply run completes.
pub(super) enum ReplySink {
    /// An external caller awaiting the full reply.
    Caller(oneshot::Sender<Result<Reply>>),
    /// A `SETEVENTS` we issued ourselves on behalf of a listener change.
    Ack(oneshot::Sender<Result<()>>),
}

/// Object to handle incoming lines and background tasks on a control
/// connection.
///
/// This type is returned when you launch a connection; you need to spawn
/// a new task that calls `run()` on it.
#[must_use = "If you don't call run() on a reactor, the connection won't work."]
pub struct Reactor {
    /// A receiver for control messages from `ControlConn` handles.
    pub(super) control: mpsc::UnboundedReceiver<CtrlMsg>,
    /// A stream of decoded reply lines from the daemon.
    pub(super) input: Fuse<BoxedLineStream>,
    /// A sink for outgoing command lines.
    pub(super) output: BoxedCommandSink,
    /// Commands that have been sent but whose replies have not finished.
    ///
    /// Strict FIFO: the front entry owns the next non-event reply run.
    pub(super) pending: VecDeque<ReplySink>,
    /// Lines of the reply run currently being accumulated.
    pub(super) current: Vec<ReplyLine>,
    /// The event subscription table.
    pub(super) dispatcher: Dispatcher,
    /// Set to true when this reactor stops; shared with the handles.
    pub(super) closed: Arc<AtomicBool>,
    /// Engine status, shared with the handles.
    pub(super) status: Arc<Mutex<ConnStatus>>,
}

/// What a single iteration of the reactor loop observed.
enum IterItem {
    /// A control message (or the end of the control channel).
    Ctrl(Option<CtrlMsg>),
    /// A decoded line (or the end of the input stream).
    Line(Option<Result<ReplyLine>>),
}

impl Reactor {
    /// Launch the reactor, and run until the connection closes or a
    /// fatal error occurs.
    ///
    /// Once this function returns, the connection is dead; every pending
    /// command has been failed and all event listeners dropped.
    pub async fn run(mut self) -> Result<()> {
        debug!("control-port reactor started");
        let result = loop {
            match self.run_once().await {
                Ok(true) => (),
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.finish(&result);
        debug!("control-port reactor stopped: {:?}", result);
        result
    }

    /// Handle one incoming line or control message.
    ///
    /// Returns Ok(false) on clean shutdown.
    async fn run_once(&mut self) -> Result<bool> {
        let item = select_biased! {
            msg = self.control.next() => IterItem::Ctrl(msg),
            line = self.input.next() => IterItem::Line(line),
        };
        match item {
            IterItem::Ctrl(None) | IterItem::Ctrl(Some(CtrlMsg::Shutdown)) => Ok(false),
            IterItem::Ctrl(Some(msg)) => {
                self.handle_control(msg).await?;
                Ok(true)
            }
            IterItem::Line(None) => Err(Error::ConnectionClosed),
            IterItem::Line(Some(Err(e))) => Err(e),
            IterItem::Line(Some(Ok(line))) => {
                self.handle_line(line)?;
                Ok(true)
            }
        }
    }

    /// Handle a control message from one of our handles.
    async fn handle_control(&mut self, msg: CtrlMsg) -> Result<()> {
        match msg {
            CtrlMsg::QueueCommand { text, tx } => {
                self.send_command(text, ReplySink::Caller(tx)).await?;
            }
            CtrlMsg::AddListener {
                name,
                id,
                listener,
                tx,
            } => {
                let setevents = self.dispatcher.add(&name, id, listener);
                self.sync_subscription(setevents, tx).await?;
            }
            CtrlMsg::RemoveListener { name, id, tx } => {
                let setevents = self.dispatcher.remove(&name, id);
                self.sync_subscription(setevents, tx).await?;
            }
            CtrlMsg::Shutdown => {
                // Handled in run_once; kept here so the match is total.
            }
        }
        Ok(())
    }

    /// After a listener change: send the new `SETEVENTS` if there is
    /// one, or acknowledge immediately if the aggregate set is
    /// unchanged.
    async fn sync_subscription(
        &mut self,
        setevents: Option<String>,
        tx: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        match setevents {
            Some(cmd) => self.send_command(cmd, ReplySink::Ack(tx)).await,
            None => {
                let _ = tx.send(Ok(()));
                Ok(())
            }
        }
    }

    /// Put `text` on the wire and enqueue its reply sink.
    ///
    /// A write failure is fatal to the connection; the entry is pushed
    /// first so that `finish` fails it along with everything else.
    async fn send_command(&mut self, text: String, sink: ReplySink) -> Result<()> {
        trace!(
            "sending {} command",
            text.split(' ').next().unwrap_or_default()
        );
        self.pending.push_back(sink);
        self.output.send(text).await?;
        Ok(())
    }

    /// Accumulate one decoded line, completing a reply run or event when
    /// its final line arrives.
    fn handle_line(&mut self, line: ReplyLine) -> Result<()> {
        let end = line.end;
        self.current.push(line);
        if !end {
            return Ok(());
        }
        let lines = std::mem::take(&mut self.current);
        let is_event = lines.first().map(ReplyLine::is_event).unwrap_or(false);
        if is_event {
            match Event::from_lines(lines) {
                Some(ev) => self.dispatcher.dispatch(&ev),
                None => warn!("ignoring unparseable event message"),
            }
            return Ok(());
        }

        let reply = Reply { lines };
        match self.pending.pop_front() {
            Some(ReplySink::Caller(tx)) => {
                if tx.send(reply.into_result()).is_err() {
                    trace!("reply arrived for a cancelled command; discarding");
                }
            }
            Some(ReplySink::Ack(tx)) => {
                let result = reply.into_result().map(|_| ());
                if let Err(e) = &result {
                    warn!("SETEVENTS rejected by the daemon: {}", e);
                }
                let _ = tx.send(result);
            }
            None => {
                // A reply with no matching command means we have lost
                // track of the protocol; nothing after this point can be
                // matched reliably.
                return Err(Error::Proto(format!(
                    "unsolicited reply with status {}",
                    reply.status()
                )));
            }
        }
        Ok(())
    }

    /// Tear down: mark the connection closed, fail every pending
    /// command, and drop all listeners.
    fn finish(&mut self, result: &Result<()>) {
        self.closed.store(true, Ordering::SeqCst);
        if result.is_err() {
            *self.status.lock().expect("poisoned lock") = ConnStatus::Failed;
        }
        let err = match result {
            Ok(()) => Error::ConnectionClosed,
            Err(e) => e.clone(),
        };
        for sink in self.pending.drain(..) {
            match sink {
                ReplySink::Caller(tx) => {
                    let _ = tx.send(Err(err.clone()));
                }
                ReplySink::Ack(tx) => {
                    let _ = tx.send(Err(err.clone()));
                }
            }
        }
        self.current.clear();
        self.dispatcher.clear();
    }
}
