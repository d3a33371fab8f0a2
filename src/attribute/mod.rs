//! Path-addressed attribute namespace.
//!
//! An [`AttributeTree`] maps hierarchical paths such as `Threads/42/Status`
//! to dense integer quarks. Quarks are handed out in creation order, never
//! reused, and stay valid for the lifetime of the tree.

pub mod lookup;
pub mod mapping;

use crate::error::{Result, StateSystemError};
use lookup::{AlphaNumericLookup, ChildLookup, LookupKind};
use parking_lot::RwLock;
use smallvec::SmallVec;
use statehist_types::{Quark, ROOT_QUARK};
use std::fmt;

/// Pattern segment matching every child.
pub const WILDCARD: &str = "*";
/// Pattern segment moving to the parent.
pub const PARENT: &str = "..";

struct Node {
    name: String,
    parent: Quark,
    lookup: Option<Box<dyn ChildLookup>>,
    children: SmallVec<[Quark; 4]>,
}

impl Node {
    fn new(name: String, parent: Quark) -> Self {
        Self {
            name,
            parent,
            lookup: None,
            children: SmallVec::new(),
        }
    }

    fn child(&self, name: &str) -> Option<Quark> {
        self.lookup.as_ref().and_then(|lookup| lookup.get(name))
    }
}

#[derive(Default)]
struct Nodes {
    root: Option<Node>,
    attributes: Vec<Node>,
}

impl Nodes {
    fn node(&self, quark: Quark) -> Option<&Node> {
        if quark == ROOT_QUARK {
            return self.root.as_ref();
        }
        usize::try_from(quark)
            .ok()
            .and_then(|index| self.attributes.get(index))
    }

    fn node_mut(&mut self, quark: Quark) -> Option<&mut Node> {
        if quark == ROOT_QUARK {
            return self.root.as_mut();
        }
        usize::try_from(quark)
            .ok()
            .and_then(|index| self.attributes.get_mut(index))
    }

    fn require(&self, quark: Quark) -> Result<&Node> {
        self.node(quark)
            .ok_or_else(|| StateSystemError::quark_not_found(quark))
    }

    fn resolve<S: AsRef<str>>(&self, start: Quark, path: &[S]) -> Result<Option<Quark>> {
        let mut current = start;
        for segment in path {
            match self.require(current)?.child(segment.as_ref()) {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn add_child(&mut self, parent: Quark, name: &str) -> Quark {
        let quark = self.attributes.len() as Quark;

        let upgraded = match self.node(parent) {
            Some(node)
                if node.lookup.as_ref().map(|l| l.kind()) == Some(LookupKind::Numeric)
                    && lookup::numeric_name(name).is_none() =>
            {
                let mut upgraded = AlphaNumericLookup::default();
                for &child in &node.children {
                    upgraded.try_insert(&self.attributes[child as usize].name, child);
                }
                log::debug!(
                    "Attribute {} switched to hashed child lookup at {} children",
                    parent,
                    node.children.len()
                );
                Some(upgraded)
            }
            _ => None,
        };

        if let Some(node) = self.node_mut(parent) {
            if let Some(upgraded) = upgraded {
                node.lookup = Some(Box::new(upgraded));
            }
            node.lookup
                .get_or_insert_with(|| lookup::for_first_child(name))
                .try_insert(name, quark);
            node.children.push(quark);
        }
        self.attributes.push(Node::new(name.to_string(), parent));
        quark
    }

    fn collect_sub_attributes(&self, quark: Quark, recursive: bool, out: &mut Vec<Quark>) {
        if let Some(node) = self.node(quark) {
            for &child in &node.children {
                out.push(child);
                if recursive {
                    self.collect_sub_attributes(child, true, out);
                }
            }
        }
    }

    fn segments(&self, quark: Quark) -> Result<Vec<&str>> {
        let mut segments = Vec::new();
        let mut current = quark;
        while current != ROOT_QUARK {
            let node = self.require(current)?;
            segments.push(node.name.as_str());
            current = node.parent;
        }
        segments.reverse();
        Ok(segments)
    }
}

/// Concurrent attribute namespace.
///
/// Creation takes a write lock only when a path is actually missing, so
/// readers resolving existing paths never wait on each other.
///
/// # Examples
///
/// ```rust
/// use statehist::AttributeTree;
///
/// let tree = AttributeTree::new();
/// let status = tree.quark_or_add(-1, &["Threads", "42", "Status"]).unwrap();
/// assert_eq!(tree.quark(-1, &["Threads", "42", "Status"]).unwrap(), status);
/// assert_eq!(tree.full_path(status).unwrap(), "Threads/42/Status");
/// assert!(tree.quark(-1, &["Threads", "7"]).is_err());
/// ```
pub struct AttributeTree {
    nodes: RwLock<Nodes>,
}

impl AttributeTree {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Nodes {
                root: Some(Node::new(String::new(), ROOT_QUARK)),
                attributes: Vec::new(),
            }),
        }
    }

    /// Rebuild a tree from its flat form, one escaped path per quark.
    pub fn from_paths<S: AsRef<str>>(paths: &[S]) -> Result<Self> {
        let tree = Self::new();
        for (expected, path) in paths.iter().enumerate() {
            let segments = mapping::split_path(path.as_ref());
            let quark = tree.quark_or_add(ROOT_QUARK, &segments)?;
            if quark as usize != expected {
                return Err(StateSystemError::CorruptPersistedState(format!(
                    "attribute '{}' replayed as quark {} instead of {}",
                    path.as_ref(),
                    quark,
                    expected
                )));
            }
        }
        Ok(tree)
    }

    /// Flatten the tree: the full path of every quark, in quark order.
    pub fn to_paths(&self) -> Vec<String> {
        let nodes = self.nodes.read();
        (0..nodes.attributes.len())
            .map(|quark| {
                nodes
                    .segments(quark as Quark)
                    .map(|segments| mapping::join_path(&segments))
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Resolve `path` below `start`, creating missing segments.
    ///
    /// Fails only when `start` itself is not an attribute of this tree.
    pub fn quark_or_add<S: AsRef<str>>(&self, start: Quark, path: &[S]) -> Result<Quark> {
        if let Some(quark) = self.nodes.read().resolve(start, path)? {
            return Ok(quark);
        }

        let mut nodes = self.nodes.write();
        let mut current = start;
        for segment in path {
            let segment = segment.as_ref();
            let existing = nodes.require(current)?.child(segment);
            current = match existing {
                Some(child) => child,
                None => nodes.add_child(current, segment),
            };
        }
        Ok(current)
    }

    /// Resolve `path` below `start` without creating anything.
    pub fn quark<S: AsRef<str>>(&self, start: Quark, path: &[S]) -> Result<Quark> {
        self.nodes.read().resolve(start, path)?.ok_or_else(|| {
            let segments: Vec<&str> = path.iter().map(AsRef::as_ref).collect();
            StateSystemError::AttributeNotFound(mapping::join_path(&segments))
        })
    }

    /// Like [`AttributeTree::quark`], with a missing path reported as `None`.
    pub fn optional_quark<S: AsRef<str>>(&self, start: Quark, path: &[S]) -> Option<Quark> {
        self.nodes.read().resolve(start, path).ok().flatten()
    }

    /// Children of `quark` in creation order; with `recursive`, the whole
    /// subtree depth-first.
    pub fn sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        let nodes = self.nodes.read();
        nodes.require(quark)?;
        let mut out = Vec::new();
        nodes.collect_sub_attributes(quark, recursive, &mut out);
        Ok(out)
    }

    /// Direct children of `quark` whose name matches a `*` glob.
    pub fn sub_attributes_matching(&self, quark: Quark, pattern: &str) -> Result<Vec<Quark>> {
        let nodes = self.nodes.read();
        let node = nodes.require(quark)?;
        Ok(node
            .children
            .iter()
            .copied()
            .filter(|&child| glob_match(pattern, &nodes.attributes[child as usize].name))
            .collect())
    }

    /// Expand a path pattern below `start`.
    ///
    /// A `*` segment stands for every child, `..` for the parent. Branches
    /// that run into a missing attribute are dropped rather than failing.
    pub fn quarks<S: AsRef<str>>(&self, start: Quark, pattern: &[S]) -> Result<Vec<Quark>> {
        let nodes = self.nodes.read();
        nodes.require(start)?;

        let mut frontier = vec![start];
        for segment in pattern {
            let segment = segment.as_ref();
            let mut next = Vec::new();
            for quark in frontier {
                let Some(node) = nodes.node(quark) else {
                    continue;
                };
                match segment {
                    WILDCARD => next.extend(node.children.iter().copied()),
                    PARENT => {
                        if quark != ROOT_QUARK {
                            next.push(node.parent);
                        }
                    }
                    name => next.extend(node.child(name)),
                }
            }
            next.dedup();
            frontier = next;
        }
        Ok(frontier)
    }

    pub fn parent_quark(&self, quark: Quark) -> Result<Quark> {
        if quark == ROOT_QUARK {
            return Ok(ROOT_QUARK);
        }
        Ok(self.nodes.read().require(quark)?.parent)
    }

    pub fn attribute_name(&self, quark: Quark) -> Result<String> {
        Ok(self.nodes.read().require(quark)?.name.clone())
    }

    /// Path segments from the root to `quark`.
    pub fn path_segments(&self, quark: Quark) -> Result<Vec<String>> {
        let nodes = self.nodes.read();
        Ok(nodes
            .segments(quark)?
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    /// Escaped `/`-joined path of `quark`.
    pub fn full_path(&self, quark: Quark) -> Result<String> {
        let nodes = self.nodes.read();
        Ok(mapping::join_path(&nodes.segments(quark)?))
    }

    pub fn contains(&self, quark: Quark) -> bool {
        quark != ROOT_QUARK && self.nodes.read().node(quark).is_some()
    }

    /// Number of attributes, the root excluded.
    pub fn len(&self) -> usize {
        self.nodes.read().attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every attribute.
    pub(crate) fn clear(&self) {
        *self.nodes.write() = Nodes {
            root: Some(Node::new(String::new(), ROOT_QUARK)),
            attributes: Vec::new(),
        };
    }
}

impl Default for AttributeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AttributeTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeTree")
            .field("attributes", &self.len())
            .finish()
    }
}

fn glob_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !name.starts_with(first) || name.len() < first.len() + last.len() {
        return false;
    }

    let mut rest = &name[first.len()..];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}
