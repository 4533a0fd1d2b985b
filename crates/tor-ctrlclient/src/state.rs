//! Live tracking of the daemon's circuits, streams, routers, and
//! address map.
//!
//! A [`TorState`] registers listeners for the relevant asynchronous
//! events, primes itself from `GETINFO`, and from then on mirrors the
//! daemon: every `CIRC` or `STREAM` event updates the corresponding
//! record and notifies the registered observers, synchronously and in
//! arrival order.
//!
//! Inconsistencies reported by the daemon (a closed circuit that still
//! claims streams, a path naming a relay we have never heard of) are
//! logged and repaired where safe; they are never fatal.

mod addrmap;
mod circuit;
mod router;
mod stream;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use tor_ctrlproto::msg::{parse_keywords, split_quoted};
use tor_ctrlproto::{ControlConn, Event};

use crate::err::StateError;

pub use addrmap::{AddrMap, AddrMapEntry};
pub use circuit::{CircId, Circuit, CircuitState};
pub use router::{Router, RouterContainer};
pub use stream::{Stream, StreamId, StreamState};

use circuit::fingerprint_from_token;
use router::parse_ns_body;

/// The event names the tracker subscribes to.
const STATE_EVENTS: [&str; 6] = ["CIRC", "STREAM", "ADDRMAP", "NEWDESC", "NS", "NEWCONSENSUS"];

/// Observer interface for circuit changes.
///
/// Implement the methods you care about; the rest default to no-ops.
/// Callbacks run synchronously on the connection's reactor task and
/// must not block.
#[allow(unused_variables)]
pub trait CircuitListener: Send {
    /// A circuit we had not seen before has appeared.
    fn circuit_new(&mut self, circ: &Circuit) {}
    /// The circuit entered LAUNCHED; its path starts empty.
    fn circuit_launched(&mut self, circ: &Circuit) {}
    /// The circuit's path grew by `router`.
    fn circuit_extend(&mut self, circ: &Circuit, router: &Router) {}
    /// The circuit is BUILT and can carry streams.
    fn circuit_built(&mut self, circ: &Circuit) {}
    /// The circuit closed cleanly.
    fn circuit_closed(&mut self, circ: &Circuit) {}
    /// The circuit failed; `reason` is the daemon's REASON, or
    /// `"unknown"`.
    fn circuit_failed(&mut self, circ: &Circuit, reason: &str) {}
}

/// Observer interface for stream changes; see [`CircuitListener`].
#[allow(unused_variables)]
pub trait StreamListener: Send {
    /// A stream we had not seen before has appeared.
    fn stream_new(&mut self, stream: &Stream) {}
    /// The stream was established.
    fn stream_succeeded(&mut self, stream: &Stream) {}
    /// The stream was attached to `circ`.
    fn stream_attach(&mut self, stream: &Stream, circ: &Circuit) {}
    /// The stream was detached from its circuit but may be retried.
    fn stream_detach(&mut self, stream: &Stream) {}
    /// The stream closed.
    fn stream_closed(&mut self, stream: &Stream) {}
    /// The stream failed; `reason` as for circuits.
    fn stream_failed(&mut self, stream: &Stream, reason: &str) {}
}

/// A circuit change being delivered to listeners.
enum CircNotice<'a> {
    /// See [`CircuitListener::circuit_new`].
    New,
    /// See [`CircuitListener::circuit_launched`].
    Launched,
    /// See [`CircuitListener::circuit_extend`].
    Extend(&'a Router),
    /// See [`CircuitListener::circuit_built`].
    Built,
    /// See [`CircuitListener::circuit_closed`].
    Closed,
    /// See [`CircuitListener::circuit_failed`].
    Failed(&'a str),
}

/// A stream change being delivered to listeners.
enum StreamNotice<'a> {
    /// See [`StreamListener::stream_new`].
    New,
    /// See [`StreamListener::stream_succeeded`].
    Succeeded,
    /// See [`StreamListener::stream_attach`].
    Attach(&'a Circuit),
    /// See [`StreamListener::stream_detach`].
    Detach,
    /// See [`StreamListener::stream_closed`].
    Closed,
    /// See [`StreamListener::stream_failed`].
    Failed(&'a str),
}

/// Everything the tracker knows, behind one lock.
#[derive(Default)]
struct StateInner {
    /// Live circuits by ID.  Terminal circuits are dropped after their
    /// final notification.
    circuits: HashMap<CircId, Circuit>,
    /// Live streams by ID, dropped like circuits.
    streams: HashMap<StreamId, Stream>,
    /// Known relays by uppercase hex fingerprint.
    routers: HashMap<String, Router>,
    /// The mirrored address map.
    addrmap: AddrMap,
    /// Observers of every circuit.
    circuit_listeners: Vec<Box<dyn CircuitListener>>,
    /// Observers of every stream.
    stream_listeners: Vec<Box<dyn StreamListener>>,
    /// Per-circuit observers; pre-registration for unseen IDs is fine.
    per_circuit: HashMap<CircId, Vec<Box<dyn CircuitListener>>>,
    /// Per-stream observers.
    per_stream: HashMap<StreamId, Vec<Box<dyn StreamListener>>>,
}

/// A live mirror of the daemon's circuit and stream state.
#[derive(Clone)]
pub struct TorState {
    /// The connection whose events feed this tracker.
    conn: ControlConn,
    /// The tracked state, shared with the event listeners.
    inner: Arc<Mutex<StateInner>>,
}

impl TorState {
    /// Subscribe to the state events on `conn` and prime the tracker
    /// with the daemon's current circuits, streams, routers, and
    /// address mappings.
    pub async fn bootstrap(conn: &ControlConn) -> Result<TorState, StateError> {
        let inner: Arc<Mutex<StateInner>> = Arc::new(Mutex::new(StateInner::default()));

        for name in STATE_EVENTS {
            let inner2 = Arc::clone(&inner);
            conn.add_event_listener(name, move |ev| {
                inner2.lock().expect("poisoned lock").handle_event(ev);
            })
            .await
            .map_err(StateError::Proto)?;
        }

        let primed = conn
            .get_info(&[
                "ns/all",
                "circuit-status",
                "stream-status",
                "address-mappings/all",
            ])
            .await
            .map_err(StateError::Proto)?;
        {
            let mut state = inner.lock().expect("poisoned lock");
            if let Some(body) = primed.get("ns/all") {
                state.ingest_routers(parse_ns_body(body));
            }
            if let Some(body) = primed.get("circuit-status") {
                for line in body.lines().filter(|l| !l.trim().is_empty()) {
                    state.handle_circ(line);
                }
            }
            if let Some(body) = primed.get("stream-status") {
                for line in body.lines().filter(|l| !l.trim().is_empty()) {
                    state.handle_stream(line);
                }
            }
            if let Some(body) = primed.get("address-mappings/all") {
                for line in body.lines().filter(|l| !l.trim().is_empty()) {
                    state.addrmap.update(line);
                }
            }
            debug!(
                "state tracker primed: {} circuits, {} streams, {} routers",
                state.circuits.len(),
                state.streams.len(),
                state.routers.len()
            );
        }

        Ok(TorState {
            conn: conn.clone(),
            inner,
        })
    }

    /// The connection this tracker listens on.
    pub fn conn(&self) -> &ControlConn {
        &self.conn
    }

    /// Snapshot of every live circuit.
    pub fn circuits(&self) -> Vec<Circuit> {
        self.inner
            .lock()
            .expect("poisoned lock")
            .circuits
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of one circuit.
    pub fn circuit(&self, id: CircId) -> Option<Circuit> {
        self.inner
            .lock()
            .expect("poisoned lock")
            .circuits
            .get(&id)
            .cloned()
    }

    /// Snapshot of every live stream.
    pub fn streams(&self) -> Vec<Stream> {
        self.inner
            .lock()
            .expect("poisoned lock")
            .streams
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of one stream.
    pub fn stream(&self, id: StreamId) -> Option<Stream> {
        self.inner
            .lock()
            .expect("poisoned lock")
            .streams
            .get(&id)
            .cloned()
    }

    /// Snapshot of every known router.
    pub fn routers(&self) -> Vec<Router> {
        self.inner
            .lock()
            .expect("poisoned lock")
            .routers
            .values()
            .cloned()
            .collect()
    }

    /// Resolve an address through the mirrored address map.
    pub fn addrmap_lookup(&self, src: &str) -> Option<String> {
        self.inner.lock().expect("poisoned lock").addrmap.lookup(src)
    }

    /// Snapshot of the whole mirrored address map.
    pub fn addrmap(&self) -> AddrMap {
        self.inner.lock().expect("poisoned lock").addrmap.clone()
    }

    /// Observe every circuit.
    pub fn add_circuit_listener(&self, listener: Box<dyn CircuitListener>) {
        self.inner
            .lock()
            .expect("poisoned lock")
            .circuit_listeners
            .push(listener);
    }

    /// Observe every stream.
    pub fn add_stream_listener(&self, listener: Box<dyn StreamListener>) {
        self.inner
            .lock()
            .expect("poisoned lock")
            .stream_listeners
            .push(listener);
    }

    /// Observe one circuit.  The ID does not have to exist yet; the
    /// listener fires as soon as the daemon names it.
    pub fn listen_circuit(&self, id: CircId, listener: Box<dyn CircuitListener>) {
        self.inner
            .lock()
            .expect("poisoned lock")
            .per_circuit
            .entry(id)
            .or_default()
            .push(listener);
    }

    /// Observe one stream; pre-registration allowed as for circuits.
    pub fn listen_stream(&self, id: StreamId, listener: Box<dyn StreamListener>) {
        self.inner
            .lock()
            .expect("poisoned lock")
            .per_stream
            .entry(id)
            .or_default()
            .push(listener);
    }
}

impl RouterContainer for TorState {
    fn router_from_id(&self, id: &str) -> Option<Router> {
        let key = id.strip_prefix('$').unwrap_or(id).to_ascii_uppercase();
        self.inner
            .lock()
            .expect("poisoned lock")
            .routers
            .get(&key)
            .cloned()
    }
}

impl StateInner {
    /// Route one asynchronous event to its handler.
    fn handle_event(&mut self, ev: &Event) {
        match ev.name.as_str() {
            "CIRC" => self.handle_circ(&ev.payload),
            "STREAM" => self.handle_stream(&ev.payload),
            "ADDRMAP" => self.addrmap.update(&ev.payload),
            "NEWDESC" => self.handle_newdesc(&ev.payload),
            "NS" | "NEWCONSENSUS" => {
                for line in &ev.lines {
                    if let Some(body) = &line.data {
                        self.ingest_routers(parse_ns_body(body));
                    }
                }
            }
            other => debug!("state tracker ignoring {} event", other),
        }
    }

    /// Merge freshly parsed router records.
    fn ingest_routers(&mut self, routers: Vec<Router>) {
        for router in routers {
            self.routers.insert(router.fingerprint.clone(), router);
        }
    }

    /// `NEWDESC` names relays; remember the ones we don't know yet.
    fn handle_newdesc(&mut self, payload: &str) {
        for token in payload.split_ascii_whitespace() {
            let Some(fp) = fingerprint_from_token(token) else {
                debug!("bad NEWDESC token {:?}", token);
                continue;
            };
            let nickname = token.split_once('~').map(|(_, n)| n.to_owned());
            self.routers
                .entry(fp.clone())
                .or_insert_with(|| Router::placeholder(fp, nickname));
        }
    }

    /// Apply one `CIRC` event payload (also used verbatim for
    /// `circuit-status` priming lines).
    fn handle_circ(&mut self, payload: &str) {
        let tokens = split_quoted(payload);
        if tokens.len() < 2 {
            warn!("malformed CIRC data: {:?}", payload);
            return;
        }
        let Ok(id) = tokens[0].parse::<CircId>() else {
            warn!("bad circuit id in {:?}", payload);
            return;
        };
        let kw = parse_keywords(tokens.iter().map(String::as_str));
        let state = match tokens[1].parse::<CircuitState>() {
            Ok(s) => s,
            Err(_) => {
                debug!("unrecognized circuit state {:?}", tokens[1]);
                CircuitState::Unknown
            }
        };

        let is_new = !self.circuits.contains_key(&id);
        if is_new {
            self.circuits.insert(id, Circuit::new(id));
        }
        {
            let circ = self.circuits.get_mut(&id).expect("just inserted");
            circ.state = state;
            if let Some(purpose) = kw.get("PURPOSE") {
                circ.purpose = Some((*purpose).to_owned());
            }
        }
        if is_new {
            self.notify_circuit(id, &CircNotice::New);
        }

        if state == CircuitState::Launched {
            self.circuits
                .get_mut(&id)
                .expect("circuit vanished")
                .path
                .clear();
            self.notify_circuit(id, &CircNotice::Launched);
        } else if !state.is_terminal() {
            if let Some(path) = tokens.get(2).filter(|t| t.starts_with('$')) {
                self.update_path(id, path);
            }
        }

        match state {
            CircuitState::Built => self.notify_circuit(id, &CircNotice::Built),
            CircuitState::Closed => {
                self.detach_streams_of(id);
                self.notify_circuit(id, &CircNotice::Closed);
                self.drop_circuit(id);
            }
            CircuitState::Failed => {
                self.detach_streams_of(id);
                let reason = kw.get("REASON").copied().unwrap_or("unknown");
                self.notify_circuit(id, &CircNotice::Failed(reason));
                self.drop_circuit(id);
            }
            _ => (),
        }
    }

    /// Replace a circuit's path from a comma-separated token list,
    /// firing `circuit_extend` for each new hop.
    ///
    /// If any token names a relay the router container cannot resolve,
    /// the whole update is abandoned.
    fn update_path(&mut self, id: CircId, path_token: &str) {
        let mut new_path = Vec::new();
        for token in path_token.split(',') {
            match fingerprint_from_token(token.trim()) {
                Some(fp) if self.routers.contains_key(&fp) => new_path.push(fp),
                Some(fp) => {
                    warn!(
                        "skipping path update for circuit {}: unknown router {}",
                        id, fp
                    );
                    return;
                }
                None => {
                    warn!(
                        "skipping path update for circuit {}: bad token {:?}",
                        id, token
                    );
                    return;
                }
            }
        }

        let old_len = match self.circuits.get_mut(&id) {
            Some(circ) => {
                let old_len = circ.path.len();
                if new_path.len() < old_len {
                    warn!(
                        "circuit {} path shrank from {} to {} hops before BUILT",
                        id,
                        old_len,
                        new_path.len()
                    );
                }
                circ.path = new_path.clone();
                old_len
            }
            None => return,
        };

        for fp in new_path.iter().skip(old_len) {
            let Some(router) = self.routers.get(fp).cloned() else {
                continue;
            };
            self.notify_circuit(id, &CircNotice::Extend(&router));
        }
    }

    /// Enforce the terminal-circuit invariant: detach any streams the
    /// daemon left attached, loudly.
    fn detach_streams_of(&mut self, id: CircId) {
        let Some(circ) = self.circuits.get_mut(&id) else {
            return;
        };
        let attached: Vec<StreamId> = circ.streams.drain().collect();
        if !attached.is_empty() {
            warn!(
                "circuit {} is {} but still had {} stream(s); detaching",
                id,
                circ.state,
                attached.len()
            );
            for sid in attached {
                if let Some(stream) = self.streams.get_mut(&sid) {
                    stream.circuit = None;
                }
            }
        }
    }

    /// Forget a terminal circuit and its per-object listeners.
    fn drop_circuit(&mut self, id: CircId) {
        self.circuits.remove(&id);
        self.per_circuit.remove(&id);
    }

    /// Apply one `STREAM` event payload (also used for `stream-status`
    /// priming lines).
    fn handle_stream(&mut self, payload: &str) {
        let tokens = split_quoted(payload);
        if tokens.len() < 3 {
            warn!("malformed STREAM data: {:?}", payload);
            return;
        }
        let Ok(id) = tokens[0].parse::<StreamId>() else {
            warn!("bad stream id in {:?}", payload);
            return;
        };
        let kw = parse_keywords(tokens.iter().map(String::as_str));
        let state = match tokens[1].parse::<StreamState>() {
            Ok(s) => s,
            Err(_) => {
                debug!("unrecognized stream state {:?}", tokens[1]);
                StreamState::Unknown
            }
        };
        // Zero is the protocol's "not attached"; anything unparseable
        // is a malformed event, not a detachment.
        let Ok(circ_id) = tokens[2].parse::<CircId>() else {
            warn!("bad circuit id in {:?}", payload);
            return;
        };

        let is_new = !self.streams.contains_key(&id);
        if is_new {
            let target = tokens.get(3).map(String::as_str).unwrap_or("");
            self.streams.insert(id, Stream::new(id, target));
        }
        self.streams
            .get_mut(&id)
            .expect("just inserted")
            .state = state;
        if is_new {
            self.notify_stream(id, &StreamNotice::New);
        }

        if circ_id != 0 && !state.is_detached() {
            self.attach_stream(id, circ_id);
        }

        match state {
            StreamState::Succeeded => self.notify_stream(id, &StreamNotice::Succeeded),
            StreamState::Detached => {
                self.detach_stream(id);
                self.notify_stream(id, &StreamNotice::Detach);
            }
            StreamState::Closed => {
                self.detach_stream(id);
                self.notify_stream(id, &StreamNotice::Closed);
                self.drop_stream(id);
            }
            StreamState::Failed => {
                self.detach_stream(id);
                let reason = kw.get("REASON").copied().unwrap_or("unknown");
                self.notify_stream(id, &StreamNotice::Failed(reason));
                self.drop_stream(id);
            }
            _ => (),
        }
    }

    /// Point a stream at a circuit, maintaining both back-references.
    ///
    /// Nothing is mutated until the target circuit is known to exist, so
    /// an unresolvable attachment leaves the old one intact.
    fn attach_stream(&mut self, id: StreamId, circ_id: CircId) {
        let old = match self.streams.get(&id) {
            Some(stream) if stream.circuit == Some(circ_id) => return,
            Some(stream) => stream.circuit,
            None => return,
        };
        if !self.circuits.contains_key(&circ_id) {
            warn!(
                "stream {} names circuit {} which we have never seen",
                id, circ_id
            );
            return;
        }
        if let Some(old_id) = old {
            if let Some(old_circ) = self.circuits.get_mut(&old_id) {
                old_circ.streams.remove(&id);
            }
        }
        self.circuits
            .get_mut(&circ_id)
            .expect("checked above")
            .streams
            .insert(id);
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.circuit = Some(circ_id);
        }
        let circ = self
            .circuits
            .get(&circ_id)
            .cloned()
            .expect("checked above");
        self.notify_stream(id, &StreamNotice::Attach(&circ));
    }

    /// Remove a stream's circuit back-reference (and the forward one).
    fn detach_stream(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        if let Some(circ_id) = stream.circuit.take() {
            if let Some(circ) = self.circuits.get_mut(&circ_id) {
                circ.streams.remove(&id);
            }
        }
    }

    /// Forget a terminal stream and its per-object listeners.
    fn drop_stream(&mut self, id: StreamId) {
        self.streams.remove(&id);
        self.per_stream.remove(&id);
    }

    /// Deliver a circuit notice to the global and per-circuit listeners.
    fn notify_circuit(&mut self, id: CircId, notice: &CircNotice<'_>) {
        let Some(circ) = self.circuits.get(&id).cloned() else {
            return;
        };
        for listener in self.circuit_listeners.iter_mut() {
            deliver_circ(listener.as_mut(), &circ, notice);
        }
        if let Some(listeners) = self.per_circuit.get_mut(&id) {
            for listener in listeners.iter_mut() {
                deliver_circ(listener.as_mut(), &circ, notice);
            }
        }
    }

    /// Deliver a stream notice to the global and per-stream listeners.
    fn notify_stream(&mut self, id: StreamId, notice: &StreamNotice<'_>) {
        let Some(stream) = self.streams.get(&id).cloned() else {
            return;
        };
        for listener in self.stream_listeners.iter_mut() {
            deliver_stream(listener.as_mut(), &stream, notice);
        }
        if let Some(listeners) = self.per_stream.get_mut(&id) {
            for listener in listeners.iter_mut() {
                deliver_stream(listener.as_mut(), &stream, notice);
            }
        }
    }
}

/// Invoke the right [`CircuitListener`] method for a notice.
fn deliver_circ(listener: &mut dyn CircuitListener, circ: &Circuit, notice: &CircNotice<'_>) {
    match notice {
        CircNotice::New => listener.circuit_new(circ),
        CircNotice::Launched => listener.circuit_launched(circ),
        CircNotice::Extend(router) => listener.circuit_extend(circ, router),
        CircNotice::Built => listener.circuit_built(circ),
        CircNotice::Closed => listener.circuit_closed(circ),
        CircNotice::Failed(reason) => listener.circuit_failed(circ, reason),
    }
}

/// Invoke the right [`StreamListener`] method for a notice.
fn deliver_stream(listener: &mut dyn StreamListener, stream: &Stream, notice: &StreamNotice<'_>) {
    match notice {
        StreamNotice::New => listener.stream_new(stream),
        StreamNotice::Succeeded => listener.stream_succeeded(stream),
        StreamNotice::Attach(circ) => listener.stream_attach(stream, circ),
        StreamNotice::Detach => listener.stream_detach(stream),
        StreamNotice::Closed => listener.stream_closed(stream),
        StreamNotice::Failed(reason) => listener.stream_failed(stream, reason),
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use crate::testutil::TestServer;
    use std::sync::Mutex as StdMutex;
    use tokio::test as async_test;

    /// Fingerprints used throughout; all known to the container.
    const FP1: &str = "1111111111111111111111111111111111111111";
    const FP2: &str = "2222222222222222222222222222222222222222";
    const FP3: &str = "3333333333333333333333333333333333333333";

    fn inner_with_routers() -> StateInner {
        let mut inner = StateInner::default();
        for fp in [FP1, FP2, FP3] {
            inner
                .routers
                .insert(fp.to_owned(), Router::placeholder(fp.to_owned(), None));
        }
        inner
    }

    /// A listener that records which notifications fired.
    #[derive(Default)]
    struct Recorder(Arc<StdMutex<Vec<String>>>);
    impl CircuitListener for Recorder {
        fn circuit_new(&mut self, c: &Circuit) {
            self.0.lock().unwrap().push(format!("new:{}", c.id));
        }
        fn circuit_launched(&mut self, c: &Circuit) {
            self.0.lock().unwrap().push(format!("launched:{}", c.id));
        }
        fn circuit_extend(&mut self, c: &Circuit, r: &Router) {
            self.0
                .lock()
                .unwrap()
                .push(format!("extend:{}:{}", c.id, &r.fingerprint[..4]));
        }
        fn circuit_built(&mut self, c: &Circuit) {
            self.0.lock().unwrap().push(format!("built:{}", c.id));
        }
        fn circuit_closed(&mut self, c: &Circuit) {
            self.0.lock().unwrap().push(format!("closed:{}", c.id));
        }
        fn circuit_failed(&mut self, c: &Circuit, reason: &str) {
            self.0
                .lock()
                .unwrap()
                .push(format!("failed:{}:{}", c.id, reason));
        }
    }

    #[test]
    fn circuit_lifecycle_notifications() {
        let mut inner = inner_with_routers();
        let log = Arc::new(StdMutex::new(Vec::new()));
        inner
            .circuit_listeners
            .push(Box::new(Recorder(Arc::clone(&log))));

        inner.handle_circ("1 LAUNCHED PURPOSE=GENERAL");
        inner.handle_circ(&format!("1 EXTENDED ${}~a", FP1));
        inner.handle_circ(&format!("1 EXTENDED ${}~a,${}~b", FP1, FP2));
        inner.handle_circ(&format!("1 BUILT ${}~a,${}~b,${}~c", FP1, FP2, FP3));
        inner.handle_circ(&format!("1 CLOSED ${}~a,${}~b,${}~c", FP1, FP2, FP3));

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "new:1",
                "launched:1",
                "extend:1:1111",
                "extend:1:2222",
                "extend:1:3333",
                "built:1",
                "closed:1",
            ]
        );
        // Terminal circuits are forgotten.
        assert!(inner.circuits.is_empty());
    }

    #[test]
    fn purpose_adopted_and_failed_reason() {
        let mut inner = inner_with_routers();
        let log = Arc::new(StdMutex::new(Vec::new()));
        inner
            .circuit_listeners
            .push(Box::new(Recorder(Arc::clone(&log))));

        inner.handle_circ("7 LAUNCHED PURPOSE=HS_CLIENT_REND");
        assert_eq!(
            inner.circuits[&7].purpose.as_deref(),
            Some("HS_CLIENT_REND")
        );
        inner.handle_circ("7 FAILED REASON=TIMEOUT");
        assert_eq!(*log.lock().unwrap().last().unwrap(), "failed:7:TIMEOUT");

        inner.handle_circ("8 LAUNCHED");
        inner.handle_circ("8 FAILED");
        assert_eq!(*log.lock().unwrap().last().unwrap(), "failed:8:unknown");
    }

    #[test]
    fn unknown_router_aborts_path_update() {
        let mut inner = inner_with_routers();
        inner.handle_circ(&format!("1 EXTENDED ${}", FP1));
        assert_eq!(inner.circuits[&1].path, vec![FP1.to_owned()]);

        // Second hop is a fingerprint not in the container: the whole
        // update is dropped, leaving the old path in place.
        inner.handle_circ(&format!(
            "1 EXTENDED ${},$4444444444444444444444444444444444444444",
            FP1
        ));
        assert_eq!(inner.circuits[&1].path, vec![FP1.to_owned()]);
    }

    #[test]
    fn path_monotonic_until_built() {
        let mut inner = inner_with_routers();
        let events = [
            "5 LAUNCHED".to_owned(),
            format!("5 EXTENDED ${}", FP1),
            format!("5 EXTENDED ${},${}", FP1, FP2),
            format!("5 EXTENDED ${},${},${}", FP1, FP2, FP3),
            format!("5 BUILT ${},${},${}", FP1, FP2, FP3),
        ];
        let mut last_len = 0;
        for ev in &events {
            inner.handle_circ(ev);
            let circ = &inner.circuits[&5];
            assert!(circ.path.len() >= last_len, "path shrank at {:?}", ev);
            last_len = circ.path.len();
        }
        assert_eq!(last_len, 3);
    }

    #[test]
    fn stream_attachment_invariants() {
        let mut inner = inner_with_routers();
        inner.handle_circ(&format!("1 BUILT ${}", FP1));
        inner.handle_circ(&format!("2 BUILT ${}", FP2));

        inner.handle_stream("10 NEW 0 www.example.com:80 PURPOSE=USER");
        assert_eq!(inner.streams[&10].circuit, None);

        inner.handle_stream("10 SENTCONNECT 1 www.example.com:80");
        assert_eq!(inner.streams[&10].circuit, Some(1));
        assert!(inner.circuits[&1].streams.contains(&10));

        // Reattach to another circuit: both back-references move.
        inner.handle_stream("10 SENTCONNECT 2 www.example.com:80");
        assert_eq!(inner.streams[&10].circuit, Some(2));
        assert!(!inner.circuits[&1].streams.contains(&10));
        assert!(inner.circuits[&2].streams.contains(&10));

        // Every stream with a circuit is in that circuit's stream set.
        for stream in inner.streams.values() {
            if let Some(cid) = stream.circuit {
                assert!(inner.circuits[&cid].streams.contains(&stream.id));
            }
        }

        inner.handle_stream("10 CLOSED 2 www.example.com:80 REASON=DONE");
        assert!(!inner.circuits[&2].streams.contains(&10));
        assert!(inner.streams.is_empty());
    }

    #[test]
    fn unknown_circuit_leaves_old_attachment_intact() {
        let mut inner = inner_with_routers();
        inner.handle_circ(&format!("1 BUILT ${}", FP1));
        inner.handle_stream("10 SENTCONNECT 1 www.example.com:80");
        assert_eq!(inner.streams[&10].circuit, Some(1));

        // The daemon names a circuit we have never seen: the attachment
        // is refused and the old one stays mutual.
        inner.handle_stream("10 SENTCONNECT 99 www.example.com:80");
        assert_eq!(inner.streams[&10].circuit, Some(1));
        assert!(inner.circuits[&1].streams.contains(&10));
    }

    #[test]
    fn malformed_stream_circuit_id_is_skipped() {
        let mut inner = inner_with_routers();
        inner.handle_circ(&format!("1 BUILT ${}", FP1));
        inner.handle_stream("10 SENTCONNECT 1 www.example.com:80");

        // A garbage circuit-id token is not the same as "0, detach";
        // the whole event is dropped.
        inner.handle_stream("10 SUCCEEDED bogus www.example.com:80");
        assert_eq!(inner.streams[&10].state, StreamState::SentConnect);
        assert_eq!(inner.streams[&10].circuit, Some(1));
        assert!(inner.circuits[&1].streams.contains(&10));
    }

    #[test]
    fn closed_circuit_detaches_leftover_streams() {
        let mut inner = inner_with_routers();
        inner.handle_circ(&format!("1 BUILT ${}", FP1));
        inner.handle_stream("10 SUCCEEDED 1 www.example.com:80");
        assert!(inner.circuits[&1].streams.contains(&10));

        // The daemon closes the circuit without closing the stream
        // first: the tracker repairs the invariant.
        inner.handle_circ("1 CLOSED");
        assert!(inner.circuits.get(&1).is_none());
        assert_eq!(inner.streams[&10].circuit, None);
    }

    #[test]
    fn replayed_event_log_preserves_invariants() {
        let mut inner = inner_with_routers();
        let log = [
            "1 LAUNCHED".to_owned(),
            format!("1 EXTENDED ${}", FP1),
            "2 LAUNCHED".to_owned(),
            format!("1 EXTENDED ${},${}", FP1, FP2),
            format!("2 EXTENDED ${}", FP3),
            format!("1 BUILT ${},${}", FP1, FP2),
            "2 FAILED REASON=DESTROYED".to_owned(),
        ];
        let streams = [
            "10 NEW 0 a.example.com:80",
            "10 SENTCONNECT 1 a.example.com:80",
            "11 NEW 0 b.example.com:443",
            "11 SENTCONNECT 1 b.example.com:443",
            "10 SUCCEEDED 1 a.example.com:80",
            "11 DETACHED 0 b.example.com:443 REASON=END",
        ];
        for ev in &log {
            inner.handle_circ(ev);
        }
        for ev in &streams {
            inner.handle_stream(ev);
        }

        // No terminal circuit holds streams, and every attachment is
        // mutual.
        for circ in inner.circuits.values() {
            if circ.state.is_terminal() {
                assert!(circ.streams.is_empty());
            }
            for sid in &circ.streams {
                assert_eq!(inner.streams[sid].circuit, Some(circ.id));
            }
        }
        for stream in inner.streams.values() {
            if let Some(cid) = stream.circuit {
                assert!(inner.circuits[&cid].streams.contains(&stream.id));
            }
        }
        assert_eq!(inner.streams[&11].circuit, None);
    }

    #[test]
    fn per_circuit_listeners_preregister() {
        let mut inner = inner_with_routers();
        let log = Arc::new(StdMutex::new(Vec::new()));
        inner
            .per_circuit
            .entry(9)
            .or_default()
            .push(Box::new(Recorder(Arc::clone(&log))));

        inner.handle_circ("8 LAUNCHED");
        assert!(log.lock().unwrap().is_empty());
        inner.handle_circ("9 LAUNCHED");
        assert_eq!(*log.lock().unwrap(), vec!["new:9", "launched:9"]);
    }

    #[async_test]
    async fn bootstrap_subscribes_and_primes() {
        let server = TestServer::spawn();
        server.respond(
            "GETINFO ns/all circuit-status stream-status address-mappings/all",
            &[
                "250+ns/all=",
                "r moria1 AAECAwQFBgcICQoLDA0ODxAREhM ABCDEFGHIJKLMNOPQRSTUVWXYZab 2038-01-01 00:00:00 128.31.0.34 9101 9131",
                "s Fast Guard Running",
                ".",
                "250+circuit-status=",
                "1 BUILT $000102030405060708090A0B0C0D0E0F10111213~moria1 PURPOSE=GENERAL",
                ".",
                "250+stream-status=",
                "10 SUCCEEDED 1 www.example.com:80",
                ".",
                "250+address-mappings/all=",
                "www.example.com 93.184.216.34 NEVER",
                ".",
                "250 OK",
            ],
        );
        let state = TorState::bootstrap(server.conn()).await.unwrap();

        // One SETEVENTS per aggregate change, ending with every event.
        let setevents: Vec<String> = server
            .requests()
            .into_iter()
            .filter(|r| r.starts_with("SETEVENTS"))
            .collect();
        assert_eq!(setevents.len(), STATE_EVENTS.len());
        assert_eq!(
            setevents.last().unwrap(),
            "SETEVENTS ADDRMAP CIRC NEWCONSENSUS NEWDESC NS STREAM"
        );

        assert_eq!(state.circuits().len(), 1);
        assert_eq!(state.circuit(1).unwrap().state, CircuitState::Built);
        assert_eq!(
            state.circuit(1).unwrap().path,
            vec!["000102030405060708090A0B0C0D0E0F10111213".to_owned()]
        );
        assert_eq!(state.stream(10).unwrap().circuit, Some(1));
        assert_eq!(
            state.addrmap_lookup("www.example.com").as_deref(),
            Some("93.184.216.34")
        );
        assert_eq!(
            state
                .router_from_id("$000102030405060708090A0B0C0D0E0F10111213")
                .unwrap()
                .nickname
                .as_deref(),
            Some("moria1")
        );

        // A live event keeps the mirror current.
        server
            .send_event(&["650 CIRC 2 LAUNCHED PURPOSE=GENERAL"])
            .await;
        // Round-trip a command to make sure the event got processed.
        server.conn().queue_command("PING").await.unwrap();
        assert_eq!(state.circuit(2).unwrap().state, CircuitState::Launched);
    }
}
