//! Typed parsing and unparsing of configuration values.
//!
//! The daemon reports a type tag for every configuration key in
//! `GETINFO config/names`; values cross the wire as strings.  Parsers
//! are resolved from the tag through [`ConfType`]'s string conversion, a
//! plain table rather than any kind of reflection.
//!
//! Round-trip contract: for every tag `t` and in-domain value `v`,
//! `parse(t, unparse(v)) == v`.

use std::fmt;
use std::str::FromStr;

use strum::{Display, EnumString};

use crate::err::ConfigError;

/// The type tag of a configuration key, as named by `config/names`.
#[derive(Copy, Clone, Debug, Display, EnumString, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfType {
    /// `0` is false; any other integer is true.
    Boolean,
    /// A base-10 integer.
    Integer,
    /// A TCP port number (parsed as an integer).
    Port,
    /// A duration in seconds (parsed as an integer).
    TimeInterval,
    /// A duration in milliseconds (parsed as an integer).
    TimeMsecInterval,
    /// A size in bytes (parsed as an integer).
    DataSize,
    /// An IEEE-754 floating point number.
    Float,
    /// A wall-clock time; kept as its string form.
    Time,
    /// A comma-separated list.
    CommaList,
    /// A comma-separated list of router names or fingerprints.
    RouterList,
    /// A list with one element per configuration line.
    LineList,
    /// An arbitrary string.
    String,
    /// A filesystem path.
    Filename,
    /// Computed by Tor from other options; read-only for controllers.
    Dependant,
}

impl ConfType {
    /// Return true for the tags whose values are lists.
    pub fn is_list(self) -> bool {
        matches!(
            self,
            ConfType::CommaList | ConfType::RouterList | ConfType::LineList
        )
    }

    /// Look up a tag from its wire name.
    pub(crate) fn from_tag(tag: &str) -> Result<Self, ConfigError> {
        ConfType::from_str(tag).map_err(|_| ConfigError::NoSuchParser(tag.to_owned()))
    }
}

/// A parsed configuration value.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ConfValue {
    /// A boolean.
    Bool(bool),
    /// An integer (Integer, Port, intervals, DataSize).
    Int(i64),
    /// A float.
    Float(f64),
    /// A string (String, Filename, Time).
    Str(String),
    /// A list (CommaList, RouterList, LineList).
    List(Vec<String>),
}

impl ConfValue {
    /// Parse one wire string according to `kind`.
    pub fn parse(kind: ConfType, s: &str) -> Result<ConfValue, ConfigError> {
        let invalid = |reason: String| ConfigError::Validation {
            key: String::new(),
            reason,
        };
        Ok(match kind {
            ConfType::Boolean => {
                let n: i64 = s
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("{:?} is not a boolean", s)))?;
                ConfValue::Bool(n != 0)
            }
            ConfType::Integer
            | ConfType::Port
            | ConfType::TimeInterval
            | ConfType::TimeMsecInterval
            | ConfType::DataSize => ConfValue::Int(
                s.trim()
                    .parse()
                    .map_err(|_| invalid(format!("{:?} is not an integer", s)))?,
            ),
            ConfType::Float => ConfValue::Float(
                s.trim()
                    .parse()
                    .map_err(|_| invalid(format!("{:?} is not a float", s)))?,
            ),
            ConfType::Time | ConfType::String | ConfType::Filename => ConfValue::Str(s.to_owned()),
            ConfType::CommaList | ConfType::RouterList => {
                if s.is_empty() {
                    ConfValue::List(Vec::new())
                } else {
                    ConfValue::List(s.split(',').map(|p| p.trim().to_owned()).collect())
                }
            }
            ConfType::LineList => {
                if s.is_empty() {
                    ConfValue::List(Vec::new())
                } else {
                    ConfValue::List(s.split('\n').map(|p| p.trim().to_owned()).collect())
                }
            }
            ConfType::Dependant => {
                return Err(invalid("Dependant keys cannot be parsed".to_owned()));
            }
        })
    }

    /// Parse the full `GETCONF` answer for one key: one string per
    /// reply line.  LineList keys arrive one element per line; everything
    /// else answers with a single line.
    pub(crate) fn parse_wire(kind: ConfType, values: &[String]) -> Result<ConfValue, ConfigError> {
        match kind {
            ConfType::LineList => Ok(ConfValue::List(
                values.iter().map(|v| v.trim().to_owned()).collect(),
            )),
            _ => match values.last() {
                Some(v) => ConfValue::parse(kind, v),
                None => Ok(ConfValue::default_for(kind)),
            },
        }
    }

    /// The value a key holds when the daemon reports it as defaulted
    /// with no default text available.
    pub(crate) fn default_for(kind: ConfType) -> ConfValue {
        match kind {
            ConfType::Boolean => ConfValue::Bool(false),
            ConfType::Integer
            | ConfType::Port
            | ConfType::TimeInterval
            | ConfType::TimeMsecInterval
            | ConfType::DataSize => ConfValue::Int(0),
            ConfType::Float => ConfValue::Float(0.0),
            _ if kind.is_list() => ConfValue::List(Vec::new()),
            _ => ConfValue::Str(String::new()),
        }
    }

    /// Return true if this value is acceptable for a key of type `kind`.
    pub(crate) fn matches_kind(&self, kind: ConfType) -> bool {
        match self {
            ConfValue::Bool(_) => kind == ConfType::Boolean,
            ConfValue::Int(_) => matches!(
                kind,
                ConfType::Integer
                    | ConfType::Port
                    | ConfType::TimeInterval
                    | ConfType::TimeMsecInterval
                    | ConfType::DataSize
            ),
            ConfValue::Float(_) => kind == ConfType::Float,
            ConfValue::Str(_) => matches!(
                kind,
                ConfType::String | ConfType::Filename | ConfType::Time
            ),
            ConfValue::List(_) => kind.is_list(),
        }
    }

    /// Unparse into wire strings: one entry per `key value` repetition.
    ///
    /// CommaList-shaped values join into a single string; LineList
    /// values repeat the key.  `kind` is None for values stored without
    /// a schema (a detached config), which unparse naturally.
    pub(crate) fn unparse(&self, kind: Option<ConfType>) -> Vec<String> {
        match self {
            ConfValue::Bool(b) => vec![if *b { "1".into() } else { "0".into() }],
            ConfValue::Int(n) => vec![n.to_string()],
            ConfValue::Float(f) => vec![f.to_string()],
            ConfValue::Str(s) => vec![s.clone()],
            ConfValue::List(items) => match kind {
                Some(ConfType::CommaList) | Some(ConfType::RouterList) => {
                    vec![items.join(",")]
                }
                _ => items.clone(),
            },
        }
    }

    /// Borrow this value as a list, if it is one.
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ConfValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow this value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Return this value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Return this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for ConfValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfValue::Bool(b) => write!(f, "{}", if *b { 1 } else { 0 }),
            ConfValue::Int(n) => write!(f, "{}", n),
            ConfValue::Float(x) => write!(f, "{}", x),
            ConfValue::Str(s) => write!(f, "{}", s),
            ConfValue::List(items) => write!(f, "{}", items.join(",")),
        }
    }
}

impl From<&str> for ConfValue {
    fn from(s: &str) -> Self {
        ConfValue::Str(s.to_owned())
    }
}
impl From<String> for ConfValue {
    fn from(s: String) -> Self {
        ConfValue::Str(s)
    }
}
impl From<i64> for ConfValue {
    fn from(n: i64) -> Self {
        ConfValue::Int(n)
    }
}
impl From<u16> for ConfValue {
    fn from(n: u16) -> Self {
        ConfValue::Int(n.into())
    }
}
impl From<bool> for ConfValue {
    fn from(b: bool) -> Self {
        ConfValue::Bool(b)
    }
}
impl From<Vec<String>> for ConfValue {
    fn from(items: Vec<String>) -> Self {
        ConfValue::List(items)
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

    #[test]
    fn tags_resolve() {
        for (tag, kind) in [
            ("Boolean", ConfType::Boolean),
            ("Integer", ConfType::Integer),
            ("Port", ConfType::Port),
            ("TimeInterval", ConfType::TimeInterval),
            ("TimeMsecInterval", ConfType::TimeMsecInterval),
            ("DataSize", ConfType::DataSize),
            ("Float", ConfType::Float),
            ("Time", ConfType::Time),
            ("CommaList", ConfType::CommaList),
            ("RouterList", ConfType::RouterList),
            ("LineList", ConfType::LineList),
            ("String", ConfType::String),
            ("Filename", ConfType::Filename),
            ("Dependant", ConfType::Dependant),
        ] {
            assert_eq!(ConfType::from_tag(tag).unwrap(), kind);
        }
        assert!(matches!(
            ConfType::from_tag("Frobnicator"),
            Err(ConfigError::NoSuchParser(_))
        ));
    }

    #[test]
    fn parse_booleans() {
        assert_eq!(
            ConfValue::parse(ConfType::Boolean, "0").unwrap(),
            ConfValue::Bool(false)
        );
        assert_eq!(
            ConfValue::parse(ConfType::Boolean, "1").unwrap(),
            ConfValue::Bool(true)
        );
        assert_eq!(
            ConfValue::parse(ConfType::Boolean, "5").unwrap(),
            ConfValue::Bool(true)
        );
        assert!(ConfValue::parse(ConfType::Boolean, "maybe").is_err());
    }

    #[test]
    fn parse_lists() {
        assert_eq!(
            ConfValue::parse(ConfType::CommaList, "a, b ,c").unwrap(),
            ConfValue::List(vec!["a".into(), "b".into(), "c".into()])
        );
        assert_eq!(
            ConfValue::parse(ConfType::CommaList, "").unwrap(),
            ConfValue::List(Vec::new())
        );
        assert_eq!(
            ConfValue::parse_wire(
                ConfType::LineList,
                &["reject *:25".to_owned(), "accept *:80".to_owned()]
            )
            .unwrap(),
            ConfValue::List(vec!["reject *:25".into(), "accept *:80".into()])
        );
    }

    #[test]
    fn round_trip_every_type() {
        let cases: Vec<(ConfType, ConfValue)> = vec![
            (ConfType::Boolean, ConfValue::Bool(true)),
            (ConfType::Boolean, ConfValue::Bool(false)),
            (ConfType::Integer, ConfValue::Int(-42)),
            (ConfType::Port, ConfValue::Int(9050)),
            (ConfType::TimeInterval, ConfValue::Int(86400)),
            (ConfType::TimeMsecInterval, ConfValue::Int(250)),
            (ConfType::DataSize, ConfValue::Int(1073741824)),
            (ConfType::Float, ConfValue::Float(0.25)),
            (ConfType::Float, ConfValue::Float(-1234.5)),
            (ConfType::Time, ConfValue::Str("2011-11-11 11:11:11".into())),
            (
                ConfType::CommaList,
                ConfValue::List(vec!["moria1".into(), "tor26".into()]),
            ),
            (
                ConfType::RouterList,
                ConfValue::List(vec!["$ABCD".into()]),
            ),
            (
                ConfType::LineList,
                ConfValue::List(vec!["reject *:25".into(), "accept *:80".into()]),
            ),
            (ConfType::String, ConfValue::Str("hello world".into())),
            (ConfType::Filename, ConfValue::Str("/var/lib/tor".into())),
        ];
        for (kind, value) in cases {
            let wire = value.unparse(Some(kind));
            let back = ConfValue::parse_wire(kind, &wire).unwrap();
            assert_eq!(back, value, "round trip failed for {:?}", kind);
        }
    }

    #[test]
    fn kind_matching() {
        assert!(ConfValue::Int(1).matches_kind(ConfType::Port));
        assert!(!ConfValue::Int(1).matches_kind(ConfType::Boolean));
        assert!(ConfValue::Str("x".into()).matches_kind(ConfType::Filename));
        assert!(ConfValue::List(vec![]).matches_kind(ConfType::LineList));
        assert!(!ConfValue::List(vec![]).matches_kind(ConfType::String));
    }

    #[test]
    fn defaults() {
        assert_eq!(
            ConfValue::default_for(ConfType::LineList),
            ConfValue::List(Vec::new())
        );
        assert_eq!(
            ConfValue::default_for(ConfType::Boolean),
            ConfValue::Bool(false)
        );
        assert_eq!(ConfValue::default_for(ConfType::Port), ConfValue::Int(0));
    }
}
