//! Router records, learned from network-status events.

use base64ct::{Base64Unpadded, Encoding};
use tracing::debug;

/// A relay, identified by its 40-character hex fingerprint.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Router {
    /// Uppercase hex fingerprint, without a leading `$`.
    pub fingerprint: String,
    /// The relay's self-chosen nickname, if known.
    pub nickname: Option<String>,
    /// The relay's advertised IP address, if known.
    pub address: Option<String>,
    /// The relay's OR port.
    pub or_port: u16,
    /// Consensus flags (`Fast`, `Guard`, `Exit`, ...).
    pub flags: Vec<String>,
}

impl Router {
    /// A record holding nothing but an identity, for relays we have
    /// heard named but not yet described.
    pub(crate) fn placeholder(fingerprint: String, nickname: Option<String>) -> Router {
        Router {
            fingerprint,
            nickname,
            address: None,
            or_port: 0,
            flags: Vec::new(),
        }
    }
}

/// Anything that can resolve a relay identity to a [`Router`].
///
/// Path tokens in `CIRC` events are resolved through this contract; an
/// unknown identity aborts the path update.
pub trait RouterContainer {
    /// Look up a router by fingerprint (with or without a leading `$`).
    fn router_from_id(&self, id: &str) -> Option<Router>;
}

/// Parse the router-status entries of a network-status document body
/// (`r` and `s` lines; everything else is ignored).
pub(crate) fn parse_ns_body(body: &str) -> Vec<Router> {
    let mut out: Vec<Router> = Vec::new();
    for line in body.lines() {
        let mut tokens = line.split_ascii_whitespace();
        match tokens.next() {
            Some("r") => {
                let fields: Vec<&str> = tokens.collect();
                // r <nick> <identity> <digest> <date> <time> <ip> <orport> <dirport>
                if fields.len() < 8 {
                    debug!("short ns 'r' line: {:?}", line);
                    continue;
                }
                let Some(fingerprint) = decode_identity(fields[1]) else {
                    debug!("undecodable ns identity: {:?}", fields[1]);
                    continue;
                };
                out.push(Router {
                    fingerprint,
                    nickname: Some(fields[0].to_owned()),
                    address: Some(fields[5].to_owned()),
                    or_port: fields[6].parse().unwrap_or(0),
                    flags: Vec::new(),
                });
            }
            Some("s") => {
                if let Some(last) = out.last_mut() {
                    last.flags = tokens.map(str::to_owned).collect();
                }
            }
            _ => (),
        }
    }
    out
}

/// Decode a base64 (unpadded) relay identity into uppercase hex.
fn decode_identity(b64: &str) -> Option<String> {
    let bytes = Base64Unpadded::decode_vec(b64).ok()?;
    if bytes.len() != 20 {
        return None;
    }
    Some(hex::encode_upper(bytes))
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

    /// A consensus entry for a relay with identity bytes 0x00..0x13.
    const NS_BODY: &str = "r moria1 AAECAwQFBgcICQoLDA0ODxAREhM ABCDEFGHIJKLMNOPQRSTUVWXYZab 2038-01-01 00:00:00 128.31.0.34 9101 9131\n\
                           s Authority Fast Guard Running Stable V2Dir Valid\n";

    #[test]
    fn parse_r_and_s_lines() {
        let routers = parse_ns_body(NS_BODY);
        assert_eq!(routers.len(), 1);
        let r = &routers[0];
        assert_eq!(r.fingerprint, "000102030405060708090A0B0C0D0E0F10111213");
        assert_eq!(r.nickname.as_deref(), Some("moria1"));
        assert_eq!(r.address.as_deref(), Some("128.31.0.34"));
        assert_eq!(r.or_port, 9101);
        assert!(r.flags.iter().any(|f| f == "Guard"));
    }

    #[test]
    fn garbage_is_skipped() {
        assert!(parse_ns_body("x yz\nr too short\n").is_empty());
    }
}
