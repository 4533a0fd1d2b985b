//! Types for decoded control-protocol messages.
//!
//! The framer ([`crate::codec`]) turns bytes into [`ReplyLine`]s; the
//! reactor groups contiguous runs of lines into [`Reply`]s and, for
//! 650-coded runs, [`Event`]s.

use std::collections::HashMap;

use crate::{Error, Result};

/// The status code Tor uses for asynchronous event messages.
pub const EVENT_STATUS: u16 = 650;

/// The sentinel value reported by [`get_conf`](crate::ControlConn::get_conf)
/// for a configuration key that is set to its default.
pub const DEFAULT_VALUE: &str = "DEFAULT";

/// A single decoded line of a control-port reply.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct ReplyLine {
    /// The 3-digit numeric status of this line.
    pub status: u16,
    /// True if this line ends its reply (its separator was a space).
    pub end: bool,
    /// The text payload of the line, after the separator.
    pub payload: String,
    /// For a `+`-separated line, the multi-line body that followed it:
    /// every data line up to (but not including) the terminating `.`,
    /// joined with `\n`.
    pub data: Option<String>,
}

impl ReplyLine {
    /// Return true if this line belongs to an asynchronous event.
    pub fn is_event(&self) -> bool {
        self.status == EVENT_STATUS
    }

    /// Split this line's payload at its first `=`, if it has one.
    pub fn split_kv(&self) -> Option<(&str, &str)> {
        self.payload.split_once('=')
    }

    /// Return the value this line carries for a `GETINFO`-style reply:
    /// the multi-line body if there was one, otherwise everything after
    /// the `=`.
    pub fn kv_value(&self) -> Option<(&str, &str)> {
        let (k, v) = self.split_kv()?;
        match &self.data {
            Some(body) => Some((k, body.as_str())),
            None => Some((k, v)),
        }
    }
}

/// A complete reply to one command: a contiguous run of lines ended by a
/// space-separated line.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Reply {
    /// Every line of the run, in arrival order.  Never empty.
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// The status of this reply, taken from its final line.
    pub fn status(&self) -> u16 {
        self.lines.last().map(|l| l.status).unwrap_or(0)
    }

    /// Return true if this reply reports success (2xx).
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status())
    }

    /// All payloads of this reply, joined with newlines.
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self.lines.iter().map(|l| l.payload.as_str()).collect();
        parts.join("\n")
    }

    /// Convert a failed reply into the error it represents, or return
    /// the reply itself if it was successful.
    pub fn into_result(self) -> Result<Reply> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(Error::Command {
                code: self.status(),
                text: self.text(),
            })
        }
    }
}

/// An asynchronous event message from the daemon.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Event {
    /// The event's name: the first token of its first line, uppercased
    /// by the daemon (`CIRC`, `STREAM`, `STATUS_CLIENT`, ...).
    pub name: String,
    /// The rest of the first line, after the name.
    pub payload: String,
    /// Every line of the event run, for multi-line events such as `NS`.
    pub lines: Vec<ReplyLine>,
}

impl Event {
    /// Build an Event from a completed 650-coded run.
    ///
    /// Returns None for an empty run or an empty first payload, which the
    /// protocol does not allow.
    pub(crate) fn from_lines(lines: Vec<ReplyLine>) -> Option<Event> {
        let first = lines.first()?;
        let mut parts = first.payload.splitn(2, ' ');
        let name = parts.next()?;
        if name.is_empty() {
            return None;
        }
        let name = name.to_owned();
        let payload = parts.next().unwrap_or("").to_owned();
        Some(Event {
            name,
            payload,
            lines,
        })
    }
}

/// Extract the `KEY=VAL` keyword arguments from a sequence of tokens.
///
/// Tokens without an `=` are skipped; this matches how the daemon mixes
/// positional and keyword arguments in event payloads.
pub fn parse_keywords<'a, I>(tokens: I) -> HashMap<&'a str, &'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    tokens
        .into_iter()
        .filter_map(|tok| tok.split_once('='))
        .collect()
}

/// Split a payload into whitespace-separated tokens, honoring
/// double-quoted sections (which may contain spaces and `\"` escapes).
pub fn split_quoted(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut seen_any = false;
    for ch in s.chars() {
        if escaped {
            cur.push(ch);
            escaped = false;
        } else if in_quotes {
            match ch {
                '\\' => escaped = true,
                '"' => in_quotes = false,
                _ => cur.push(ch),
            }
        } else {
            match ch {
                '"' => {
                    in_quotes = true;
                    seen_any = true;
                }
                c if c.is_whitespace() => {
                    if seen_any || !cur.is_empty() {
                        out.push(std::mem::take(&mut cur));
                        seen_any = false;
                    }
                }
                _ => {
                    cur.push(ch);
                    seen_any = true;
                }
            }
        }
    }
    if seen_any || !cur.is_empty() {
        out.push(cur);
    }
    out
}

/// Quote a value for use in a `SETCONF`-style key=value pair.
///
/// Values containing spaces or quotes are wrapped in double quotes with
/// backslash escapes; anything else passes through unchanged.
pub fn quote_if_needed(v: &str) -> String {
    if v.is_empty() || v.contains(' ') || v.contains('"') {
        let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{}\"", escaped)
    } else {
        v.to_owned()
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

    fn line(status: u16, end: bool, payload: &str) -> ReplyLine {
        ReplyLine {
            status,
            end,
            payload: payload.into(),
            data: None,
        }
    }

    #[test]
    fn reply_status_and_text() {
        let r = Reply {
            lines: vec![line(250, false, "version=0.2.3.25"), line(250, true, "OK")],
        };
        assert_eq!(r.status(), 250);
        assert!(r.is_ok());
        assert_eq!(r.text(), "version=0.2.3.25\nOK");
    }

    #[test]
    fn reply_error() {
        let r = Reply {
            lines: vec![line(513, true, "Unacceptable option value")],
        };
        assert!(!r.is_ok());
        let e = r.into_result().unwrap_err();
        match e {
            Error::Command { code, text } => {
                assert_eq!(code, 513);
                assert_eq!(text, "Unacceptable option value");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn event_from_lines() {
        let ev = Event::from_lines(vec![line(650, true, "CIRC 42 LAUNCHED")]).unwrap();
        assert_eq!(ev.name, "CIRC");
        assert_eq!(ev.payload, "42 LAUNCHED");

        let ev = Event::from_lines(vec![line(650, true, "NEWNYM")]).unwrap();
        assert_eq!(ev.name, "NEWNYM");
        assert_eq!(ev.payload, "");

        assert!(Event::from_lines(vec![]).is_none());
    }

    #[test]
    fn keywords() {
        let toks = ["42", "BUILT", "PURPOSE=GENERAL", "REASON=DESTROYED"];
        let kw = parse_keywords(toks);
        assert_eq!(kw.get("PURPOSE"), Some(&"GENERAL"));
        assert_eq!(kw.get("REASON"), Some(&"DESTROYED"));
        assert_eq!(kw.get("42"), None);
    }

    #[test]
    fn quoted_split() {
        let toks = split_quoted(r#"BOOTSTRAP PROGRESS=5 SUMMARY="Connecting to relay""#);
        assert_eq!(
            toks,
            vec![
                "BOOTSTRAP".to_owned(),
                "PROGRESS=5".to_owned(),
                "SUMMARY=Connecting to relay".to_owned(),
            ]
        );
        let toks = split_quoted(r#"a "b \" c" d"#);
        assert_eq!(toks, vec!["a".to_owned(), "b \" c".to_owned(), "d".to_owned()]);
    }

    #[test]
    fn quoting() {
        assert_eq!(quote_if_needed("9050"), "9050");
        assert_eq!(quote_if_needed("80 127.0.0.1:80"), "\"80 127.0.0.1:80\"");
        assert_eq!(quote_if_needed(""), "\"\"");
        assert_eq!(quote_if_needed("a\"b"), "\"a\\\"b\"");
    }
}
