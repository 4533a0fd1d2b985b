//! Event subscription bookkeeping for the control connection.
//!
//! The dispatcher keeps the daemon's `SETEVENTS` subscription equal, at
//! all times, to the union of event names with at least one locally
//! registered listener.  Subscription changes are coalesced: a change
//! only produces a `SETEVENTS` command when the aggregate set actually
//! differs from the one last sent.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, trace, warn};

use crate::msg::Event;

/// Identifier for one registered event listener.
///
/// Returned by [`add_event_listener`](crate::ControlConn::add_event_listener)
/// and used to remove the listener again.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ListenerId(pub(crate) u64);

/// A callback invoked for each matching event.
///
/// Listeners run synchronously on the reactor task, in event arrival
/// order; they must not block, and must not re-enter the connection with
/// suspending operations.
pub type EventListener = Box<dyn FnMut(&Event) + Send>;

/// The subscription table, owned by the reactor.
pub(crate) struct Dispatcher {
    /// Map from (uppercase) event name to the listeners for it.
    ///
    /// A BTreeMap so that the aggregate set we send is deterministic.
    table: BTreeMap<String, Vec<(ListenerId, EventListener)>>,
    /// The aggregate event set we most recently told the daemon about.
    last_sent: Vec<String>,
}

impl Dispatcher {
    /// Return a new empty dispatcher.
    ///
    /// A fresh control connection starts with no server-side
    /// subscriptions, so `last_sent` starts empty.
    pub(crate) fn new() -> Self {
        Dispatcher {
            table: BTreeMap::new(),
            last_sent: Vec::new(),
        }
    }

    /// Register `listener` for events named `name`.
    ///
    /// Returns the `SETEVENTS` command to send if the aggregate
    /// subscription changed, or None if it is unchanged.
    pub(crate) fn add(
        &mut self,
        name: &str,
        id: ListenerId,
        listener: EventListener,
    ) -> Option<String> {
        let name = name.to_ascii_uppercase();
        self.table.entry(name).or_default().push((id, listener));
        self.setevents_if_changed()
    }

    /// Remove the listener registered under (`name`, `id`), if any.
    ///
    /// Returns the `SETEVENTS` command to send if the aggregate
    /// subscription changed.  Removing an unknown listener is a no-op.
    pub(crate) fn remove(&mut self, name: &str, id: ListenerId) -> Option<String> {
        let name = name.to_ascii_uppercase();
        if let Some(listeners) = self.table.get_mut(&name) {
            listeners.retain(|(lid, _)| *lid != id);
            if listeners.is_empty() {
                self.table.remove(&name);
            }
        }
        self.setevents_if_changed()
    }

    /// The union of event names that currently have listeners.
    pub(crate) fn aggregate(&self) -> Vec<String> {
        self.table.keys().cloned().collect()
    }

    /// If the aggregate set differs from the one last sent, record the
    /// new set and return the `SETEVENTS` command that announces it.
    fn setevents_if_changed(&mut self) -> Option<String> {
        let agg = self.aggregate();
        if agg == self.last_sent {
            return None;
        }
        self.last_sent = agg;
        if self.last_sent.is_empty() {
            Some("SETEVENTS".to_owned())
        } else {
            Some(format!("SETEVENTS {}", self.last_sent.join(" ")))
        }
    }

    /// Deliver `event` to every listener registered for its name.
    ///
    /// An event with no listeners is dropped.  A panicking listener is
    /// logged and does not stop delivery to the remaining listeners.
    pub(crate) fn dispatch(&mut self, event: &Event) {
        let Some(listeners) = self.table.get_mut(&event.name) else {
            trace!("dropping {} event with no listeners", event.name);
            return;
        };
        debug!(
            "dispatching {} event to {} listener(s)",
            event.name,
            listeners.len()
        );
        for (id, listener) in listeners.iter_mut() {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(
                    "listener {:?} for {} event panicked; continuing",
                    id, event.name
                );
            }
        }
    }

    /// Drop every listener.  Used when the connection dies.
    pub(crate) fn clear(&mut self) {
        self.table.clear();
    }
}
