//! Stream records, kept current from `STREAM` events.

use strum::{Display, EnumString};

use crate::state::circuit::CircId;

/// A stream identifier, as assigned by the daemon.
pub type StreamId = u64;

/// The lifecycle state of a stream (control-spec 4.1.2).
#[derive(Copy, Clone, Debug, Default, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "UPPERCASE")]
#[non_exhaustive]
pub enum StreamState {
    /// Not yet reported, or reported with a state we don't recognize.
    #[default]
    Unknown,
    /// New request to connect.
    New,
    /// New request to resolve an address.
    NewResolve,
    /// Address re-mapped to another.
    Remap,
    /// Sent a connect cell along a circuit.
    SentConnect,
    /// Sent a resolve cell along a circuit.
    SentResolve,
    /// Received a reply; stream established.
    Succeeded,
    /// Stream failed and not retriable.
    Failed,
    /// Stream closed.
    Closed,
    /// Detached from circuit; still retriable.
    Detached,
}

impl StreamState {
    /// True for the states in which a stream holds no circuit.
    pub fn is_detached(self) -> bool {
        matches!(
            self,
            StreamState::Failed | StreamState::Closed | StreamState::Detached
        )
    }
}

/// One of the daemon's application streams.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Stream {
    /// The daemon-assigned stream ID.
    pub id: StreamId,
    /// Current lifecycle state.
    pub state: StreamState,
    /// The circuit this stream is attached to, if any.
    ///
    /// Invariant: when this is Some(c), the stream's ID is in circuit
    /// c's stream set.
    pub circuit: Option<CircId>,
    /// The target host this stream wants to reach.
    pub target_host: String,
    /// The target port.
    pub target_port: u16,
}

impl Stream {
    /// A new stream record with the given ID and target.
    pub(crate) fn new(id: StreamId, target: &str) -> Stream {
        let (host, port) = split_target(target);
        Stream {
            id,
            state: StreamState::Unknown,
            circuit: None,
            target_host: host,
            target_port: port,
        }
    }
}

/// Split a `host:port` target; the port defaults to 0 when absent or
/// unparseable.
fn split_target(target: &str) -> (String, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) => (host.to_owned(), port.parse().unwrap_or(0)),
        None => (target.to_owned(), 0),
    }
}
