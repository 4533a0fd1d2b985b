//! In-memory scripted control-port server, for tests.
//!
//! Each incoming command line is matched against a table of canned
//! replies (default `250 OK`), and every request is logged so tests can
//! assert on exactly what went over the wire.  Events can be injected
//! at any time.

#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_docs_in_private_items)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio_util::compat::TokioAsyncReadCompatExt;

use tor_ctrlproto::ControlConn;

/// The scripting half of an in-memory control-port daemon.
#[derive(Clone)]
pub(crate) struct ServerHandle {
    /// Every command line received, in order.
    requests: Arc<Mutex<Vec<String>>>,
    /// Canned replies, keyed by the exact command line.
    responses: Arc<Mutex<HashMap<String, Vec<String>>>>,
    /// The write side of the wire, shared with the serving task so
    /// tests can inject event lines.
    writer: Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>,
}

impl ServerHandle {
    /// Start the serving task; returns the handle and the client end of
    /// the wire.
    pub(crate) fn start() -> (ServerHandle, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(server);
        let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let responses: Arc<Mutex<HashMap<String, Vec<String>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let writer = Arc::new(tokio::sync::Mutex::new(write));

        let req2 = Arc::clone(&requests);
        let resp2 = Arc::clone(&responses);
        let writer2 = Arc::clone(&writer);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                req2.lock().unwrap().push(line.clone());
                let reply = resp2
                    .lock()
                    .unwrap()
                    .get(&line)
                    .cloned()
                    .unwrap_or_else(|| vec!["250 OK".to_owned()]);
                let mut w = writer2.lock().await;
                for reply_line in reply {
                    w.write_all(reply_line.as_bytes()).await.unwrap();
                    w.write_all(b"\r\n").await.unwrap();
                }
                w.flush().await.unwrap();
            }
        });

        (
            ServerHandle {
                requests,
                responses,
                writer,
            },
            client,
        )
    }

    /// Register the reply lines for one exact command line.
    pub(crate) fn respond(&self, command: &str, lines: &[&str]) {
        self.responses.lock().unwrap().insert(
            command.to_owned(),
            lines.iter().map(|l| (*l).to_owned()).collect(),
        );
    }

    /// All command lines received so far.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Forget the requests recorded so far.
    pub(crate) fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }

    /// Write raw lines (normally `650 ...` events) to the client.
    pub(crate) async fn send_event(&self, lines: &[&str]) {
        let mut w = self.writer.lock().await;
        for line in lines {
            w.write_all(line.as_bytes()).await.unwrap();
            w.write_all(b"\r\n").await.unwrap();
        }
        w.flush().await.unwrap();
    }
}

/// A scripted server with a live [`ControlConn`] attached to it.
pub(crate) struct TestServer {
    /// The scripting handle.
    handle: ServerHandle,
    /// The connection under test.
    conn: ControlConn,
}

impl TestServer {
    /// Start a server and connect a `ControlConn` to it, spawning the
    /// reactor on the current runtime.
    pub(crate) fn spawn() -> TestServer {
        let (handle, client) = ServerHandle::start();
        let (conn, reactor) = ControlConn::launch(client.compat());
        tokio::spawn(reactor.run());
        TestServer { handle, conn }
    }

    /// The connection under test.
    pub(crate) fn conn(&self) -> &ControlConn {
        &self.conn
    }

    /// See [`ServerHandle::respond`].
    pub(crate) fn respond(&self, command: &str, lines: &[&str]) {
        self.handle.respond(command, lines);
    }

    /// See [`ServerHandle::requests`].
    pub(crate) fn requests(&self) -> Vec<String> {
        self.handle.requests()
    }

    /// See [`ServerHandle::clear_requests`].
    pub(crate) fn clear_requests(&self) {
        self.handle.clear_requests();
    }

    /// See [`ServerHandle::send_event`].
    pub(crate) async fn send_event(&self, lines: &[&str]) {
        self.handle.send_event(lines).await;
    }
}
