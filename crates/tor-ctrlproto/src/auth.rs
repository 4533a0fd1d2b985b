//! The control-port authentication handshake.
//!
//! Which handshake to use is negotiated via `PROTOCOLINFO`: we take the
//! strongest method both sides support, in the order SAFECOOKIE, COOKIE,
//! HASHEDPASSWORD, NULL.  SAFECOOKIE proves knowledge of the cookie
//! without putting its bytes on the wire, so it beats COOKIE; both beat
//! a static passphrase.

use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use strum::{Display, EnumString};
use tracing::debug;

use crate::conn::ControlConn;
use crate::msg::{Reply, parse_keywords, split_quoted};
use crate::{Error, Result};

/// HMAC-SHA256, as used by the SAFECOOKIE handshake.
type HmacSha256 = Hmac<Sha256>;

/// Key for the hash the server sends us during SAFECOOKIE.
const SAFECOOKIE_SERVER_KEY: &[u8] = b"Tor safe cookie authentication server-to-controller hash";
/// Key for the hash we send the server during SAFECOOKIE.
const SAFECOOKIE_CLIENT_KEY: &[u8] = b"Tor safe cookie authentication controller-to-server hash";

/// The number of bytes in an authentication cookie file.
const COOKIE_LEN: usize = 32;

/// An authentication method, as advertised in `PROTOCOLINFO`.
///
/// The derived ordering is the preference order: later variants are
/// stronger.
#[derive(Copy, Clone, Debug, Display, EnumString, Eq, PartialEq, Ord, PartialOrd)]
#[non_exhaustive]
pub enum AuthMethod {
    /// No authentication required.
    #[strum(serialize = "NULL")]
    Null,
    /// A passphrase, checked against Tor's `HashedControlPassword`.
    #[strum(serialize = "HASHEDPASSWORD")]
    HashedPassword,
    /// The contents of the cookie file, sent in the clear.
    #[strum(serialize = "COOKIE")]
    Cookie,
    /// Challenge/response proof of the cookie file contents.
    #[strum(serialize = "SAFECOOKIE")]
    SafeCookie,
}

/// The parts of a `PROTOCOLINFO` reply that the handshake needs.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ProtocolInfo {
    /// Methods the daemon will accept, in the order it listed them.
    pub auth_methods: Vec<AuthMethod>,
    /// Path of the authentication cookie file, if cookie auth is on.
    pub cookie_file: Option<PathBuf>,
    /// The daemon's version string, if it reported one.
    pub tor_version: Option<String>,
}

impl ProtocolInfo {
    /// Extract a ProtocolInfo from a `PROTOCOLINFO 1` reply.
    pub(crate) fn parse(reply: &Reply) -> Result<ProtocolInfo> {
        let mut auth_methods = Vec::new();
        let mut cookie_file = None;
        let mut tor_version = None;
        for line in &reply.lines {
            let toks = split_quoted(&line.payload);
            match toks.first().map(String::as_str) {
                Some("AUTH") => {
                    for tok in &toks[1..] {
                        if let Some(methods) = tok.strip_prefix("METHODS=") {
                            for m in methods.split(',') {
                                match m.parse::<AuthMethod>() {
                                    Ok(m) => auth_methods.push(m),
                                    Err(_) => debug!("ignoring unknown auth method {:?}", m),
                                }
                            }
                        } else if let Some(path) = tok.strip_prefix("COOKIEFILE=") {
                            cookie_file = Some(PathBuf::from(path));
                        }
                    }
                }
                Some("VERSION") => {
                    for tok in &toks[1..] {
                        if let Some(v) = tok.strip_prefix("Tor=") {
                            tor_version = Some(v.to_owned());
                        }
                    }
                }
                _ => (),
            }
        }
        if auth_methods.is_empty() {
            return Err(Error::Auth(
                "PROTOCOLINFO listed no authentication methods".into(),
            ));
        }
        Ok(ProtocolInfo {
            auth_methods,
            cookie_file,
            tor_version,
        })
    }

    /// Choose the strongest advertised method we can actually perform.
    ///
    /// HASHEDPASSWORD needs a secret from the caller; the cookie methods
    /// need a cookie file path from the daemon.
    pub(crate) fn pick_method(&self, have_secret: bool) -> Result<AuthMethod> {
        self.auth_methods
            .iter()
            .copied()
            .filter(|m| match m {
                AuthMethod::Null => true,
                AuthMethod::HashedPassword => have_secret,
                AuthMethod::Cookie | AuthMethod::SafeCookie => self.cookie_file.is_some(),
            })
            .max()
            .ok_or_else(|| {
                Error::Auth(format!(
                    "no usable authentication method among {:?}",
                    self.auth_methods
                ))
            })
    }
}

/// Run the whole authentication handshake on `conn`.
pub(crate) async fn authenticate(conn: &ControlConn, secret: Option<&str>) -> Result<()> {
    let reply = conn.queue_command("PROTOCOLINFO 1").await.map_err(auth_err)?;
    let info = ProtocolInfo::parse(&reply)?;
    let method = info.pick_method(secret.is_some())?;
    debug!("authenticating via {}", method);
    match method {
        AuthMethod::Null => {
            conn.queue_command("AUTHENTICATE").await.map_err(auth_err)?;
        }
        AuthMethod::HashedPassword => {
            let secret = secret.ok_or(Error::Internal("picked HASHEDPASSWORD with no secret"))?;
            let quoted = secret.replace('\\', "\\\\").replace('"', "\\\"");
            conn.queue_command(&format!("AUTHENTICATE \"{}\"", quoted))
                .await
                .map_err(auth_err)?;
        }
        AuthMethod::Cookie => {
            let path = info
                .cookie_file
                .as_deref()
                .ok_or(Error::Internal("picked COOKIE with no cookie file"))?;
            let cookie = read_cookie(path)?;
            conn.queue_command(&format!("AUTHENTICATE {}", hex::encode(cookie)))
                .await
                .map_err(auth_err)?;
        }
        AuthMethod::SafeCookie => {
            let path = info
                .cookie_file
                .as_deref()
                .ok_or(Error::Internal("picked SAFECOOKIE with no cookie file"))?;
            let cookie = read_cookie(path)?;
            safecookie_handshake(conn, &cookie).await?;
        }
    }
    Ok(())
}

/// Read and sanity-check an authentication cookie file.
fn read_cookie(path: &Path) -> Result<Vec<u8>> {
    let cookie = std::fs::read(path)
        .map_err(|e| Error::Auth(format!("cannot read cookie file {:?}: {}", path, e)))?;
    if cookie.len() != COOKIE_LEN {
        return Err(Error::Auth(format!(
            "cookie file {:?} is {} bytes, not {}",
            path,
            cookie.len(),
            COOKIE_LEN
        )));
    }
    Ok(cookie)
}

/// Perform the SAFECOOKIE challenge/response exchange.
async fn safecookie_handshake(conn: &ControlConn, cookie: &[u8]) -> Result<()> {
    let mut client_nonce = [0_u8; 32];
    rand::rng().fill_bytes(&mut client_nonce);

    let reply = conn
        .queue_command(&format!(
            "AUTHCHALLENGE SAFECOOKIE {}",
            hex::encode(client_nonce)
        ))
        .await
        .map_err(auth_err)?;
    let first = reply
        .lines
        .first()
        .ok_or_else(|| Error::Proto("empty AUTHCHALLENGE reply".into()))?;
    let toks = split_quoted(&first.payload);
    let kw = parse_keywords(toks.iter().map(String::as_str));
    let server_hash = hex_kw(&kw, "SERVERHASH")?;
    let server_nonce = hex_kw(&kw, "SERVERNONCE")?;

    // The server proves cookie knowledge first; a mismatch here means
    // we are talking to something that doesn't have the cookie.
    let mut mac = HmacSha256::new_from_slice(SAFECOOKIE_SERVER_KEY)
        .map_err(|_| Error::Internal("bad HMAC key length"))?;
    mac.update(cookie);
    mac.update(&client_nonce);
    mac.update(&server_nonce);
    mac.verify_slice(&server_hash)
        .map_err(|_| Error::Auth("SAFECOOKIE server hash mismatch".into()))?;

    let mut mac = HmacSha256::new_from_slice(SAFECOOKIE_CLIENT_KEY)
        .map_err(|_| Error::Internal("bad HMAC key length"))?;
    mac.update(cookie);
    mac.update(&client_nonce);
    mac.update(&server_nonce);
    let client_hash = mac.finalize().into_bytes();

    conn.queue_command(&format!("AUTHENTICATE {}", hex::encode(client_hash)))
        .await
        .map_err(auth_err)?;
    Ok(())
}

/// Fetch a required hex-encoded keyword from an AUTHCHALLENGE reply.
fn hex_kw(kw: &std::collections::HashMap<&str, &str>, key: &str) -> Result<Vec<u8>> {
    let value = kw
        .get(key)
        .ok_or_else(|| Error::Proto(format!("AUTHCHALLENGE reply missing {}", key)))?;
    hex::decode(value).map_err(|_| Error::Proto(format!("AUTHCHALLENGE {} is not hex", key)))
}

/// Rewrite a command failure during the handshake as an AuthError.
fn auth_err(e: Error) -> Error {
    match e {
        Error::Command { code, text } => Error::Auth(format!("{} {}", code, text)),
        other => other,
    }
}
