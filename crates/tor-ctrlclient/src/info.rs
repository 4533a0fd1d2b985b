//! A typed, documented view of the daemon's `GETINFO` keys.
//!
//! The daemon enumerates every key it supports (with a one-line doc
//! string) in `GETINFO info/names`.  We build a trie from those names:
//! interior nodes are namespaces, leaves are queries.  A name ending in
//! `/*` is a query family taking one argument.  Dashes in wire names
//! are normalized to underscores for lookup, and lookups accept dotted
//! paths (`info.get("traffic.read")`).

use std::collections::BTreeMap;

use tracing::{debug, warn};

use tor_ctrlproto::ControlConn;

use crate::err::InfoError;

/// One queryable `GETINFO` leaf.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct InfoLeaf {
    /// The canonical wire path (without any trailing `/*`).
    pub path: String,
    /// The daemon's documentation line for this key.
    pub doc: String,
    /// True if this is a `/*` family that takes one argument.
    pub takes_arg: bool,
}

/// A node in the info trie.
#[derive(Clone, Debug)]
enum InfoNode {
    /// A namespace mapping child names to nodes.
    Namespace(BTreeMap<String, InfoNode>),
    /// A queryable leaf.
    Leaf(InfoLeaf),
}

/// The daemon's `GETINFO` surface, learned at bootstrap.
#[derive(Clone, Debug)]
pub struct TorInfo {
    /// The connection queries go out on.
    conn: ControlConn,
    /// Top-level names.
    root: BTreeMap<String, InfoNode>,
}

impl TorInfo {
    /// Learn the info tree from the daemon.
    pub async fn bootstrap(conn: &ControlConn) -> Result<TorInfo, InfoError> {
        let names = conn.get_info(&["info/names"]).await?;
        let body = names
            .get("info/names")
            .ok_or_else(|| InfoError::MissingValue("info/names".to_owned()))?;

        let mut root: BTreeMap<String, InfoNode> = BTreeMap::new();
        let mut entries = 0_usize;
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (name, doc) = match line.split_once(' ') {
                Some((name, doc)) => (name, doc.trim()),
                None => (line, ""),
            };
            let (name, takes_arg) = match name.strip_suffix("/*") {
                Some(stem) => (stem, true),
                None => (name, false),
            };
            let leaf = InfoLeaf {
                path: name.to_owned(),
                doc: doc.to_owned(),
                takes_arg,
            };
            if insert_leaf(&mut root, leaf) {
                entries += 1;
            }
        }
        debug!("info tree ready: {} queries", entries);
        Ok(TorInfo {
            conn: conn.clone(),
            root,
        })
    }

    /// Find the leaf at a dotted (or slashed) path.
    fn leaf(&self, path: &str) -> Result<&InfoLeaf, InfoError> {
        let segments: Vec<String> = path.split(['.', '/']).map(normalize).collect();
        let mut children = &self.root;
        let mut node: Option<&InfoNode> = None;
        for (i, segment) in segments.iter().enumerate() {
            let found = children
                .get(segment)
                .ok_or_else(|| InfoError::UnknownPath(path.to_owned()))?;
            match found {
                InfoNode::Namespace(map) => children = map,
                // A leaf is only valid as the final segment.
                InfoNode::Leaf(_) if i + 1 == segments.len() => (),
                InfoNode::Leaf(_) => return Err(InfoError::UnknownPath(path.to_owned())),
            }
            node = Some(found);
        }
        match node {
            Some(InfoNode::Leaf(leaf)) => Ok(leaf),
            Some(InfoNode::Namespace(_)) => Err(InfoError::NotAQuery(path.to_owned())),
            None => Err(InfoError::UnknownPath(path.to_owned())),
        }
    }

    /// Query a no-argument leaf.
    pub async fn get(&self, path: &str) -> Result<String, InfoError> {
        let leaf = self.leaf(path)?;
        if leaf.takes_arg {
            return Err(InfoError::Arity {
                path: leaf.path.clone(),
                takes_arg: true,
            });
        }
        self.fetch(leaf.path.clone()).await
    }

    /// Query a one-argument (`/*`) leaf.
    pub async fn get_with_arg(&self, path: &str, arg: &str) -> Result<String, InfoError> {
        let leaf = self.leaf(path)?;
        if !leaf.takes_arg {
            return Err(InfoError::Arity {
                path: leaf.path.clone(),
                takes_arg: false,
            });
        }
        self.fetch(format!("{}/{}", leaf.path, arg)).await
    }

    /// The daemon's documentation for a leaf.
    pub fn doc(&self, path: &str) -> Result<&str, InfoError> {
        Ok(&self.leaf(path)?.doc)
    }

    /// Whether the leaf at `path` takes an argument.
    pub fn takes_arg(&self, path: &str) -> Result<bool, InfoError> {
        Ok(self.leaf(path)?.takes_arg)
    }

    /// Every query in the tree, as `path` or `path(arg)`, sorted.
    pub fn dump(&self) -> Vec<String> {
        let mut out = Vec::new();
        dump_into(&self.root, &mut out);
        out
    }

    /// Issue the underlying GETINFO and unwrap the value.
    async fn fetch(&self, wire_path: String) -> Result<String, InfoError> {
        let reply = self.conn.get_info(&[wire_path.as_str()]).await?;
        reply
            .get(&wire_path)
            .cloned()
            .ok_or(InfoError::MissingValue(wire_path))
    }
}

/// Normalize one wire path segment for lookup.
fn normalize(segment: &str) -> String {
    segment.replace('-', "_")
}

/// Insert a leaf into the trie; on conflict, skip it and keep whatever
/// is already there.  Returns true if the leaf went in.
fn insert_leaf(root: &mut BTreeMap<String, InfoNode>, leaf: InfoLeaf) -> bool {
    let segments: Vec<String> = leaf.path.split('/').map(normalize).collect();
    let mut children = root;
    for segment in &segments[..segments.len() - 1] {
        let entry = children
            .entry(segment.clone())
            .or_insert_with(|| InfoNode::Namespace(BTreeMap::new()));
        children = match entry {
            InfoNode::Namespace(map) => map,
            InfoNode::Leaf(existing) => {
                // Something like config/* already claimed this name as
                // a query; it cannot also be a namespace.
                warn!(
                    "info entry {:?} conflicts with query {:?}; skipping",
                    leaf.path, existing.path
                );
                return false;
            }
        };
    }
    let last = segments.last().expect("split never yields nothing");
    if children.contains_key(last) {
        warn!(
            "info entry {:?} is both a namespace and a query; skipping",
            leaf.path
        );
        return false;
    }
    children.insert(last.clone(), InfoNode::Leaf(leaf));
    true
}

/// Walk the trie, collecting `path` / `path(arg)` lines.
fn dump_into(children: &BTreeMap<String, InfoNode>, out: &mut Vec<String>) {
    for node in children.values() {
        match node {
            InfoNode::Namespace(map) => dump_into(map, out),
            InfoNode::Leaf(leaf) => {
                if leaf.takes_arg {
                    out.push(format!("{}(arg)", leaf.path));
                } else {
                    out.push(leaf.path.clone());
                }
            }
        }
    }
}
