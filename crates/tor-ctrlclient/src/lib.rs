#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list maintained by maint/add_warning @@
#![allow(renamed_and_removed_lints)] // @@REMOVE_WHEN(ci_arti_stable)
#![allow(unknown_lints)] // @@REMOVE_WHEN(ci_arti_nightly)
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)] // arti/-/merge_requests/588/#note_2812945
#![allow(clippy::result_large_err)] // temporary workaround for arti#587
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

pub mod config;
pub mod info;
pub mod launch;
pub mod state;

mod err;
#[cfg(test)]
mod testutil;

pub use config::{ConfList, ConfType, ConfValue, HiddenService, TorConfig};
pub use err::{BootstrapError, ConfigError, InfoError, LaunchError, StateError};
pub use info::{InfoLeaf, TorInfo};
pub use launch::{LaunchOptions, LaunchedTor, launch};
pub use state::{
    AddrMap, AddrMapEntry, CircId, Circuit, CircuitListener, CircuitState, Router,
    RouterContainer, Stream, StreamId, StreamListener, StreamState, TorState,
};

// Re-export the protocol layer: callers need ControlConn everywhere.
pub use tor_ctrlproto::{ConnStatus, ControlConn, Event, ListenerId, Reactor};

use tokio_util::compat::TokioAsyncReadCompatExt;

/// Open a control-port connection to an already-running daemon.
///
/// The reactor is spawned on the current tokio runtime; the returned
/// connection is not yet authenticated.
pub async fn connect<A: tokio::net::ToSocketAddrs>(
    addr: A,
) -> Result<ControlConn, tor_ctrlproto::Error> {
    let sock = tokio::net::TcpStream::connect(addr).await?;
    sock.set_nodelay(true)?;
    let (conn, reactor) = ControlConn::launch(sock.compat());
    tokio::spawn(reactor.run());
    Ok(conn)
}

/// Bring up the full client layer over an authenticated connection:
/// configuration mirror, state tracker, and info tree.
///
/// Marks the connection [`Ready`](ConnStatus::Ready) once all three
/// have finished their initial queries.
pub async fn bootstrap(
    conn: &ControlConn,
) -> Result<(TorConfig, TorState, TorInfo), BootstrapError> {
    let config = TorConfig::bootstrap(conn).await?;
    let state = TorState::bootstrap(conn).await?;
    let info = TorInfo::bootstrap(conn).await?;
    conn.mark_ready();
    Ok((config, state, info))
}
