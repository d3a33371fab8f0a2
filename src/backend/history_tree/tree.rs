//! Paginated history tree.
//!
//! Only the latest branch (root to newest leaf) lives in memory while the
//! tree is built. An interval goes into the deepest node of that branch
//! whose start precedes its own. When a node runs out of room, it and every
//! node below it are closed at the current tree end and replaced by fresh
//! siblings starting right after it. When the root is full the tree grows a
//! level.

use super::io::{HEADER_SIZE, HtIo, TreeHeader};
use super::node::{HtNode, NodeKind, interval_size, node_capacity};
use crate::attribute::AttributeTree;
use crate::error::{Result, StateSystemError, TimeRangeError};
use statehist_types::{Quark, StateInterval, StateValue, Timestamp};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

/// A node borrowed from the live branch or loaded from disk.
pub(crate) enum NodeRef<'a> {
    Live(&'a HtNode),
    Stored(Arc<HtNode>),
}

impl Deref for NodeRef<'_> {
    type Target = HtNode;

    fn deref(&self) -> &HtNode {
        match self {
            Self::Live(node) => node,
            Self::Stored(node) => node,
        }
    }
}

pub(crate) struct HistoryTree {
    io: HtIo,
    block_size: usize,
    max_children: usize,
    provider_version: u32,
    partial: bool,
    checkpoint_interval: i64,
    start: Timestamp,
    end: Timestamp,
    node_count: u32,
    root_seq: u32,
    interval_count: u64,
    attribute_bytes: u64,
    latest_branch: Vec<HtNode>,
    closed: bool,
}

impl HistoryTree {
    pub fn create(
        path: &Path,
        start: Timestamp,
        config: &crate::Config,
        partial: bool,
    ) -> Result<Self> {
        let io = HtIo::create(
            path,
            config.block_size,
            config.max_children,
            config.node_cache_size,
        )?;
        let root = HtNode::new(
            NodeKind::Leaf,
            0,
            None,
            start,
            config.block_size,
            config.max_children,
        );
        log::debug!(
            "Created history tree {} (block size {}, fan-out {})",
            path.display(),
            config.block_size,
            config.max_children
        );

        Ok(Self {
            io,
            block_size: config.block_size,
            max_children: config.max_children,
            provider_version: config.provider_version,
            partial,
            checkpoint_interval: if partial { config.checkpoint_interval } else { 0 },
            start,
            end: start,
            node_count: 1,
            root_seq: 0,
            interval_count: 0,
            attribute_bytes: 0,
            latest_branch: vec![root],
            closed: false,
        })
    }

    /// Reopen a finished tree. Returns it with its flattened attribute tree.
    pub fn open(path: &Path, config: &crate::Config) -> Result<(Self, Vec<String>)> {
        let (io, header) = HtIo::open(path, config.node_cache_size)?;
        if header.provider_version != config.provider_version {
            return Err(StateSystemError::CorruptPersistedState(format!(
                "file written by provider version {}, expected {}",
                header.provider_version, config.provider_version
            )));
        }
        let paths = io.read_attributes(&header)?;
        // The root must decode before the tree is handed out.
        io.read_node(header.root_seq)?;

        log::info!(
            "Opened history tree {} covering [{}, {}] with {} attributes",
            path.display(),
            header.start,
            header.end,
            paths.len()
        );
        let attribute_bytes = std::fs::metadata(path)?.len() - header.attribute_offset;
        let tree = Self {
            io,
            block_size: header.block_size,
            max_children: header.max_children,
            provider_version: header.provider_version,
            partial: header.partial,
            checkpoint_interval: header.checkpoint_interval,
            start: header.start,
            end: header.end,
            node_count: header.node_count,
            root_seq: header.root_seq,
            interval_count: header.interval_count,
            attribute_bytes,
            latest_branch: Vec::new(),
            closed: true,
        };
        Ok((tree, paths))
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn checkpoint_interval(&self) -> i64 {
        self.checkpoint_interval
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn interval_count(&self) -> u64 {
        self.interval_count
    }

    pub fn path(&self) -> &Path {
        self.io.path()
    }

    pub fn size_bytes(&self) -> u64 {
        HEADER_SIZE + u64::from(self.node_count) * self.block_size as u64 + self.attribute_bytes
    }

    /// Depth of the tree, counting the root.
    #[cfg(test)]
    pub fn depth(&self) -> Result<usize> {
        if !self.latest_branch.is_empty() {
            return Ok(self.latest_branch.len());
        }
        let mut depth = 1;
        let mut node = self.node(self.root_seq)?;
        while let Some(child) = node.children.last().map(|c| c.seq) {
            node = self.node(child)?;
            depth += 1;
        }
        Ok(depth)
    }

    fn root(&self) -> u32 {
        self.latest_branch
            .first()
            .map_or(self.root_seq, |root| root.seq)
    }

    fn node(&self, seq: u32) -> Result<NodeRef<'_>> {
        if let Some(node) = self.latest_branch.iter().find(|node| node.seq == seq) {
            return Ok(NodeRef::Live(node));
        }
        if seq >= self.node_count {
            return Err(StateSystemError::CorruptPersistedState(format!(
                "reference to missing node {}",
                seq
            )));
        }
        Ok(NodeRef::Stored(self.io.read_node(seq)?))
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.node_count;
        self.node_count += 1;
        seq
    }

    fn new_node(&self, kind: NodeKind, seq: u32, parent: Option<u32>, start: Timestamp) -> HtNode {
        HtNode::new(kind, seq, parent, start, self.block_size, self.max_children)
    }

    pub fn insert(&mut self, interval: StateInterval) -> Result<()> {
        if self.closed {
            return Err(StateSystemError::AlreadyBuilt);
        }
        if interval.start < self.start {
            return Err(TimeRangeError::BeforeStart {
                start: interval.start,
                history_start: self.start,
            }
            .into());
        }

        // Core nodes have the least room; anything that fits there fits anywhere.
        let size = interval_size(&interval);
        let capacity = node_capacity(NodeKind::Core, self.block_size, self.max_children);
        let oversized_string = matches!(&interval.value, StateValue::String(s) if s.len() > u16::MAX as usize);
        if size > capacity || oversized_string {
            return Err(StateSystemError::IntervalTooLarge { size, capacity });
        }

        let mut index = self.latest_branch.len() - 1;
        loop {
            let node = &self.latest_branch[index];
            if interval.start < node.start {
                index = index.checked_sub(1).ok_or(TimeRangeError::BeforeStart {
                    start: interval.start,
                    history_start: node.start,
                })?;
                continue;
            }
            if size > node.free_space() {
                self.add_sibling_node(index)?;
                index = self.latest_branch.len() - 1;
                continue;
            }

            self.end = self.end.max(interval.end);
            self.interval_count += 1;
            self.latest_branch[index].add(interval);
            return Ok(());
        }
    }

    fn add_sibling_node(&mut self, index: usize) -> Result<()> {
        if index == 0 {
            return self.add_new_root_node();
        }
        if self.latest_branch[index - 1].children.len() >= self.max_children {
            return self.add_sibling_node(index - 1);
        }

        let split = self.end;
        for node in self.latest_branch[index..].iter_mut() {
            node.close(split);
            self.io.write_node(node)?;
        }

        let depth = self.latest_branch.len();
        for level in index..depth {
            let kind = if level == depth - 1 {
                NodeKind::Leaf
            } else {
                NodeKind::Core
            };
            let seq = self.next_seq();
            let parent = self.latest_branch[level - 1].seq;
            let node = self.new_node(kind, seq, Some(parent), split + 1);
            self.latest_branch[level - 1].link_child(seq, split + 1);
            self.latest_branch[level] = node;
        }
        Ok(())
    }

    fn add_new_root_node(&mut self) -> Result<()> {
        let split = self.end;
        let new_root_seq = self.next_seq();
        let depth = self.latest_branch.len();

        self.latest_branch[0].parent = Some(new_root_seq);
        for node in self.latest_branch.iter_mut() {
            node.close(split);
            self.io.write_node(node)?;
        }

        let old_root = &self.latest_branch[0];
        let mut new_root = self.new_node(NodeKind::Core, new_root_seq, None, self.start);
        new_root.link_child(old_root.seq, old_root.start);

        let mut branch = Vec::with_capacity(depth + 1);
        branch.push(new_root);
        for level in 1..=depth {
            let kind = if level == depth {
                NodeKind::Leaf
            } else {
                NodeKind::Core
            };
            let seq = self.next_seq();
            let parent = &mut branch[level - 1];
            parent.link_child(seq, split + 1);
            let parent_seq = parent.seq;
            branch.push(self.new_node(kind, seq, Some(parent_seq), split + 1));
        }

        self.latest_branch = branch;
        self.root_seq = new_root_seq;
        log::debug!(
            "History tree {} grew to depth {} at {}",
            self.io.path().display(),
            depth + 1,
            split
        );
        Ok(())
    }

    /// Close every open node, then write the attribute section and header.
    pub fn close(&mut self, end: Timestamp, attributes: &AttributeTree) -> Result<()> {
        if self.closed {
            return Err(StateSystemError::AlreadyBuilt);
        }
        self.end = self.end.max(end);
        let tree_end = self.end;
        for node in self.latest_branch.iter_mut() {
            node.close(tree_end);
            self.io.write_node(node)?;
        }
        self.root_seq = self.root();
        self.latest_branch.clear();

        let paths = attributes.to_paths();
        let attribute_offset =
            HEADER_SIZE + u64::from(self.node_count) * self.block_size as u64;
        self.attribute_bytes = self.io.write_attributes(attribute_offset, &paths)?;

        let header = TreeHeader {
            provider_version: self.provider_version,
            block_size: self.block_size,
            max_children: self.max_children,
            node_count: self.node_count,
            root_seq: self.root_seq,
            start: self.start,
            end: self.end,
            interval_count: self.interval_count,
            attribute_offset,
            quark_count: paths.len() as u32,
            partial: self.partial,
            checkpoint_interval: self.checkpoint_interval,
        };
        self.io.write_header(&header)?;
        self.closed = true;

        log::info!(
            "History tree {} closed at {}: {} intervals in {} nodes",
            self.io.path().display(),
            self.end,
            self.interval_count,
            self.node_count
        );
        Ok(())
    }

    /// Visit the node path covering `t`, root first, until `visit` returns `false`.
    fn walk_at<F>(&self, t: Timestamp, mut visit: F) -> Result<()>
    where
        F: FnMut(&HtNode) -> bool,
    {
        let mut seq = self.root();
        loop {
            let node = self.node(seq)?;
            if !node.covers(t) || !visit(&*node) {
                return Ok(());
            }
            match node.kind {
                NodeKind::Leaf => return Ok(()),
                NodeKind::Core => match node.child_at(t) {
                    Some(child) => seq = child,
                    None => return Ok(()),
                },
            }
        }
    }

    pub fn query_full(&self, t: Timestamp, states: &mut [Option<StateInterval>]) -> Result<()> {
        self.walk_at(t, |node| {
            for interval in node.intervals_at(t) {
                if let Some(slot) = usize::try_from(interval.quark)
                    .ok()
                    .and_then(|index| states.get_mut(index))
                {
                    *slot = Some(interval.clone());
                }
            }
            true
        })
    }

    pub fn query_single(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>> {
        let mut found = None;
        self.walk_at(t, |node| {
            found = node
                .intervals_at(t)
                .find(|interval| interval.quark == quark)
                .cloned();
            found.is_none()
        })?;
        Ok(found)
    }

    pub fn query_range(
        &self,
        quark: Quark,
        t1: Timestamp,
        t2: Timestamp,
    ) -> Result<Vec<StateInterval>> {
        let mut intervals = Vec::new();
        let mut pending = vec![self.root()];
        while let Some(seq) = pending.pop() {
            let node = self.node(seq)?;
            if !node.intersects(t1, t2) {
                continue;
            }
            intervals.extend(
                node.intervals
                    .iter()
                    .filter(|interval| interval.quark == quark && interval.intersects(t1, t2))
                    .cloned(),
            );
            if node.kind == NodeKind::Core {
                pending.extend(node.children_in(t1, t2));
            }
        }
        intervals.sort_by_key(|interval| interval.start);
        Ok(intervals)
    }

    pub fn release(&mut self) {
        self.latest_branch.clear();
        self.io.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use tempfile::tempdir;

    fn small_config() -> Config {
        Config::default()
            .with_block_size(Config::MIN_BLOCK_SIZE)
            .with_max_children(3)
            .with_node_cache_size(8)
    }

    /// Two quarks alternating values every 10 time units.
    fn fill(tree: &mut HistoryTree, steps: i64) {
        for step in 0..steps {
            for quark in 0..2 {
                let start = step * 10;
                tree.insert(StateInterval::new(
                    start,
                    start + 9,
                    quark,
                    StateValue::Long(step * 2 + i64::from(quark)),
                ))
                .unwrap();
            }
        }
    }

    #[test]
    fn test_tree_grows_and_answers_queries() {
        let dir = tempdir().unwrap();
        let mut tree = HistoryTree::create(&dir.path().join("ht"), 0, &small_config(), false).unwrap();
        fill(&mut tree, 2000);
        assert!(tree.node_count() > 10);
        assert!(tree.depth().unwrap() >= 3);

        for t in [0, 9, 10, 5_555, 19_999] {
            let step = t / 10;
            let found = tree.query_single(t, 1).unwrap().unwrap();
            assert_eq!(found.value, StateValue::Long(step * 2 + 1));
            assert!(found.contains(t));
        }

        let mut states = vec![None; 2];
        tree.query_full(12_345, &mut states).unwrap();
        assert_eq!(states[0].as_ref().unwrap().value, StateValue::Long(2468));
        assert_eq!(states[1].as_ref().unwrap().value, StateValue::Long(2469));
    }

    #[test]
    fn test_range_query_spans_nodes() {
        let dir = tempdir().unwrap();
        let mut tree = HistoryTree::create(&dir.path().join("ht"), 0, &small_config(), false).unwrap();
        fill(&mut tree, 1000);
        let range = tree.query_range(0, 995, 3_004).unwrap();
        assert_eq!(range.len(), 202);
        assert_eq!(range.first().unwrap().start, 990);
        assert_eq!(range.last().unwrap().start, 3_000);
        assert!(range.windows(2).all(|w| w[0].end + 1 == w[1].start));
    }

    #[test]
    fn test_close_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ht");
        let attributes = AttributeTree::new();
        attributes.quark_or_add(-1, &["a"]).unwrap();
        attributes.quark_or_add(-1, &["b"]).unwrap();

        let mut tree = HistoryTree::create(&path, 0, &small_config(), false).unwrap();
        fill(&mut tree, 500);
        let before = tree.query_range(1, 0, 4_999).unwrap();
        tree.close(6_000, &attributes).unwrap();
        assert_eq!(tree.end(), 6_000);
        assert!(tree.insert(StateInterval::null_at(7_000, 0)).is_err());

        let (reopened, paths) = HistoryTree::open(&path, &small_config()).unwrap();
        assert_eq!(paths, vec!["a", "b"]);
        assert_eq!((reopened.start(), reopened.end()), (0, 6_000));
        assert_eq!(reopened.interval_count(), 1000);
        assert_eq!(reopened.query_range(1, 0, 4_999).unwrap(), before);
        assert!(reopened.query_single(5_500, 0).unwrap().is_none());
    }

    #[test]
    fn test_provider_version_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ht");
        let mut tree = HistoryTree::create(&path, 0, &small_config(), false).unwrap();
        fill(&mut tree, 10);
        tree.close(100, &AttributeTree::new()).unwrap();

        let config = small_config().with_provider_version(4);
        let err = HistoryTree::open(&path, &config).err().unwrap();
        assert!(matches!(err, StateSystemError::CorruptPersistedState(_)));
    }

    #[test]
    fn test_interval_too_large() {
        let dir = tempdir().unwrap();
        let mut tree = HistoryTree::create(&dir.path().join("ht"), 0, &small_config(), false).unwrap();
        let huge = StateValue::String("x".repeat(Config::MIN_BLOCK_SIZE));
        let err = tree.insert(StateInterval::new(0, 1, 0, huge)).unwrap_err();
        assert!(matches!(err, StateSystemError::IntervalTooLarge { .. }));
    }

    #[test]
    fn test_late_start_goes_to_ancestor() {
        let dir = tempdir().unwrap();
        let mut tree = HistoryTree::create(&dir.path().join("ht"), 0, &small_config(), false).unwrap();
        // A long interval on quark 2 closing only at the end.
        fill(&mut tree, 800);
        tree.insert(StateInterval::new(0, 7_999, 2, StateValue::Int(1))).unwrap();
        let found = tree.query_single(4_321, 2).unwrap().unwrap();
        assert_eq!((found.start, found.end), (0, 7_999));
    }
}
