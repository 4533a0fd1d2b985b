//! The local mirror of the daemon's address map.
//!
//! `ADDRMAP` events carry a source address, a replacement address, and
//! an expiry.  The daemon expires entries on its own schedule; we
//! mirror that by pruning on lookup.

use std::collections::HashMap;
use std::time::SystemTime;

use chrono::NaiveDateTime;
use tracing::debug;

use tor_ctrlproto::msg::{parse_keywords, split_quoted};

/// One address mapping.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct AddrMapEntry {
    /// The address the source maps to.
    pub dest: String,
    /// When the mapping lapses; None means it never does.
    pub expires: Option<SystemTime>,
}

/// The address map: source address to replacement, with expiry.
#[derive(Clone, Debug, Default)]
pub struct AddrMap {
    /// Current mappings by source address.
    map: HashMap<String, AddrMapEntry>,
}

impl AddrMap {
    /// Apply one `ADDRMAP` payload:
    /// `<src> <dest> <expiry> [error=...] [EXPIRES="..."]`.
    pub(crate) fn update(&mut self, payload: &str) {
        let tokens = split_quoted(payload);
        if tokens.len() < 3 {
            debug!("malformed ADDRMAP payload: {:?}", payload);
            return;
        }
        let src = &tokens[0];
        let dest = &tokens[1];
        if dest == "<error>" {
            // A failed resolve; the daemon maps nothing.
            return;
        }
        let kw = parse_keywords(tokens.iter().map(String::as_str));
        // The EXPIRES keyword is in UTC; the positional expiry is in
        // local time, so prefer the keyword when both are present.
        let expires = match kw.get("EXPIRES").copied().or(Some(tokens[2].as_str())) {
            Some("NEVER") => None,
            Some(stamp) => parse_expiry(stamp),
            None => None,
        };
        self.map
            .insert(src.clone(), AddrMapEntry { dest: dest.clone(), expires });
    }

    /// Look up the current mapping for `src`, pruning it if expired.
    pub fn lookup(&mut self, src: &str) -> Option<String> {
        let now = SystemTime::now();
        if let Some(entry) = self.map.get(src) {
            if let Some(expires) = entry.expires {
                if expires <= now {
                    self.map.remove(src);
                    return None;
                }
            }
        }
        self.map.get(src).map(|e| e.dest.clone())
    }

    /// The number of (possibly expired) entries held.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if no entries are held.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Parse a `"YYYY-MM-DD HH:MM:SS"` expiry stamp as UTC.
fn parse_expiry(stamp: &str) -> Option<SystemTime> {
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S").ok()?;
    Some(SystemTime::from(naive.and_utc()))
}
