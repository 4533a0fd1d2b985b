//! Circuit records, kept current from `CIRC` events.

use std::collections::HashSet;

use strum::{Display, EnumString};

use crate::state::stream::StreamId;

/// A circuit identifier, as assigned by the daemon.
pub type CircId = u64;

/// The lifecycle state of a circuit (control-spec 4.1.1).
#[derive(Copy, Clone, Debug, Default, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "UPPERCASE")]
#[non_exhaustive]
pub enum CircuitState {
    /// Not yet reported, or reported with a state we don't recognize.
    #[default]
    Unknown,
    /// Circuit ID assigned to a new circuit.
    Launched,
    /// All hops finished, can now accept streams.
    Built,
    /// One more hop has been completed.
    Extended,
    /// Circuit closed (was not built).
    Failed,
    /// Circuit closed (was built).
    Closed,
}

impl CircuitState {
    /// True for the states after which a circuit carries no streams.
    pub fn is_terminal(self) -> bool {
        matches!(self, CircuitState::Failed | CircuitState::Closed)
    }
}

/// One of the daemon's circuits.
///
/// These are owned by the state tracker; accessors hand out snapshot
/// clones.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Circuit {
    /// The daemon-assigned circuit ID.
    pub id: CircId,
    /// Current lifecycle state.
    pub state: CircuitState,
    /// Why the circuit was built (`PURPOSE=` keyword), once reported.
    pub purpose: Option<String>,
    /// The relay fingerprints of the circuit's path, in hop order.
    ///
    /// Grows hop by hop until the circuit is built, then stays constant
    /// for the circuit's remaining lifetime.
    pub path: Vec<String>,
    /// The streams currently attached to this circuit.
    ///
    /// Empty whenever `state` is terminal.
    pub streams: HashSet<StreamId>,
}

impl Circuit {
    /// A new, not-yet-reported circuit with the given ID.
    pub(crate) fn new(id: CircId) -> Circuit {
        Circuit {
            id,
            state: CircuitState::Unknown,
            purpose: None,
            path: Vec::new(),
            streams: HashSet::new(),
        }
    }
}

/// Extract the fingerprint from one path token (`$fp` or `$fp~nick` or
/// `$fp=nick`), normalized to uppercase without the `$`.
pub(crate) fn fingerprint_from_token(token: &str) -> Option<String> {
    let rest = token.strip_prefix('$')?;
    let fp: String = rest.chars().take(40).collect();
    (fp.len() == 40 && fp.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| fp.to_ascii_uppercase())
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

    #[test]
    fn state_parsing() {
        assert_eq!("LAUNCHED".parse::<CircuitState>().unwrap(), CircuitState::Launched);
        assert_eq!("BUILT".parse::<CircuitState>().unwrap(), CircuitState::Built);
        assert!("GUARD_WAIT".parse::<CircuitState>().is_err());
        assert!(CircuitState::Closed.is_terminal());
        assert!(CircuitState::Failed.is_terminal());
        assert!(!CircuitState::Built.is_terminal());
    }

    #[test]
    fn path_tokens() {
        let fp = "00af02c8e7dbc9b12b4cbf19ce425eb0bdb2708c";
        assert_eq!(
            fingerprint_from_token(&format!("${}", fp)).unwrap(),
            fp.to_ascii_uppercase()
        );
        assert_eq!(
            fingerprint_from_token(&format!("${}~moria1", fp)).unwrap(),
            fp.to_ascii_uppercase()
        );
        assert!(fingerprint_from_token("moria1").is_none());
        assert!(fingerprint_from_token("$tooshort").is_none());
    }
}
