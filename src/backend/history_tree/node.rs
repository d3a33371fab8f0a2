//! History tree nodes and their on-disk block layout.
//!
//! ```text
//! kind: u8 | start: i64 | end: i64 | seq: u32 | parent: i32 | closed: u8 | count: u32
//! core only: children: u32 | max_children x { seq: i32, start: i64 }
//! count x interval { start: i64, end: i64, quark: i32, tag: u8, payload }
//! ```
//!
//! Intervals are kept sorted by end time, so a point lookup can skip every
//! interval that ends before the query.

use super::CHILD_ENTRY_SIZE;
use crate::error::{Result, StateSystemError};
use bytes::{Buf, BufMut, BytesMut};
use statehist_types::{Quark, StateInterval, StateValue, StateValueType, Timestamp};

const NODE_HEADER_SIZE: usize = 1 + 8 + 8 + 4 + 4 + 1 + 4;
const INTERVAL_HEADER_SIZE: usize = 8 + 8 + 4 + 1;
const NO_PARENT: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Leaf,
    Core,
}

impl NodeKind {
    fn tag(self) -> u8 {
        match self {
            Self::Leaf => 1,
            Self::Core => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Leaf),
            2 => Some(Self::Core),
            _ => None,
        }
    }
}

/// Bytes an interval takes in a node block.
pub(crate) fn interval_size(interval: &StateInterval) -> usize {
    INTERVAL_HEADER_SIZE
        + match &interval.value {
            StateValue::Null => 0,
            StateValue::Int(_) => 4,
            StateValue::Long(_) | StateValue::Double(_) => 8,
            StateValue::String(s) => 2 + s.len(),
        }
}

/// Interval room of an empty node.
pub(crate) fn node_capacity(kind: NodeKind, block_size: usize, max_children: usize) -> usize {
    let header = match kind {
        NodeKind::Leaf => NODE_HEADER_SIZE,
        NodeKind::Core => NODE_HEADER_SIZE + 4 + max_children * CHILD_ENTRY_SIZE,
    };
    block_size.saturating_sub(header)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildEntry {
    pub seq: u32,
    pub start: Timestamp,
}

#[derive(Debug, Clone)]
pub(crate) struct HtNode {
    pub kind: NodeKind,
    pub seq: u32,
    pub parent: Option<u32>,
    pub start: Timestamp,
    pub end: Timestamp,
    pub closed: bool,
    pub intervals: Vec<StateInterval>,
    pub children: Vec<ChildEntry>,
    capacity: usize,
    used: usize,
}

impl HtNode {
    pub fn new(
        kind: NodeKind,
        seq: u32,
        parent: Option<u32>,
        start: Timestamp,
        block_size: usize,
        max_children: usize,
    ) -> Self {
        Self {
            kind,
            seq,
            parent,
            start,
            end: start,
            closed: false,
            intervals: Vec::new(),
            children: Vec::new(),
            capacity: node_capacity(kind, block_size, max_children),
            used: 0,
        }
    }

    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.used)
    }

    /// Add an interval, keeping the list ordered by end time.
    pub fn add(&mut self, interval: StateInterval) {
        self.used += interval_size(&interval);
        let pos = self.intervals.partition_point(|i| i.end <= interval.end);
        self.intervals.insert(pos, interval);
    }

    pub fn link_child(&mut self, seq: u32, start: Timestamp) {
        self.children.push(ChildEntry { seq, start });
    }

    pub fn close(&mut self, end: Timestamp) {
        self.end = end.max(self.start);
        self.closed = true;
    }

    /// Whether the node's time range reaches `t`. Open nodes reach any
    /// time after their start.
    pub fn covers(&self, t: Timestamp) -> bool {
        self.start <= t && (!self.closed || t <= self.end)
    }

    pub fn intersects(&self, t1: Timestamp, t2: Timestamp) -> bool {
        self.start <= t2 && (!self.closed || t1 <= self.end)
    }

    /// Stored intervals containing `t`.
    pub fn intervals_at(&self, t: Timestamp) -> impl Iterator<Item = &StateInterval> {
        let first = self.intervals.partition_point(|i| i.end < t);
        self.intervals[first..]
            .iter()
            .filter(move |interval| interval.start <= t)
    }

    /// Child whose time range holds `t`: the last one starting at or before it.
    pub fn child_at(&self, t: Timestamp) -> Option<u32> {
        let pos = self.children.partition_point(|c| c.start <= t);
        pos.checked_sub(1).map(|index| self.children[index].seq)
    }

    /// Children whose time range intersects `[t1, t2]`.
    pub fn children_in(&self, t1: Timestamp, t2: Timestamp) -> impl Iterator<Item = u32> + '_ {
        self.children
            .iter()
            .enumerate()
            .filter(move |(index, child)| {
                let next_start = self.children.get(index + 1).map(|next| next.start);
                child.start <= t2 && next_start.is_none_or(|next| next > t1)
            })
            .map(|(_, child)| child.seq)
    }

    pub fn encode(&self, block_size: usize, max_children: usize, buf: &mut BytesMut) {
        buf.clear();
        buf.reserve(block_size);
        buf.put_u8(self.kind.tag());
        buf.put_i64(self.start);
        buf.put_i64(self.end);
        buf.put_u32(self.seq);
        buf.put_i32(self.parent.map_or(NO_PARENT, |p| p as i32));
        buf.put_u8(u8::from(self.closed));
        buf.put_u32(self.intervals.len() as u32);

        if self.kind == NodeKind::Core {
            buf.put_u32(self.children.len() as u32);
            for slot in 0..max_children {
                match self.children.get(slot) {
                    Some(child) => {
                        buf.put_i32(child.seq as i32);
                        buf.put_i64(child.start);
                    }
                    None => {
                        buf.put_i32(-1);
                        buf.put_i64(0);
                    }
                }
            }
        }

        for interval in &self.intervals {
            buf.put_i64(interval.start);
            buf.put_i64(interval.end);
            buf.put_i32(interval.quark);
            buf.put_u8(interval.value.value_type().tag());
            match &interval.value {
                StateValue::Null => {}
                StateValue::Int(v) => buf.put_i32(*v),
                StateValue::Long(v) => buf.put_i64(*v),
                StateValue::Double(v) => buf.put_f64(*v),
                StateValue::String(s) => {
                    buf.put_u16(s.len() as u16);
                    buf.put_slice(s.as_bytes());
                }
            }
        }

        buf.resize(block_size, 0);
    }

    pub fn decode(mut block: &[u8], block_size: usize, max_children: usize) -> Result<Self> {
        need(block, NODE_HEADER_SIZE)?;
        let kind = NodeKind::from_tag(block.get_u8())
            .ok_or_else(|| corrupt("unknown node type"))?;
        let start = block.get_i64();
        let end = block.get_i64();
        let seq = block.get_u32();
        let parent = block.get_i32();
        let closed = block.get_u8() != 0;
        let count = block.get_u32() as usize;

        let mut node = Self::new(
            kind,
            seq,
            u32::try_from(parent).ok(),
            start,
            block_size,
            max_children,
        );
        node.end = end;
        node.closed = closed;

        if kind == NodeKind::Core {
            need(block, 4 + max_children * CHILD_ENTRY_SIZE)?;
            let children = block.get_u32() as usize;
            if children > max_children {
                return Err(corrupt(format!("node {} lists {} children", seq, children)));
            }
            for slot in 0..max_children {
                let child_seq = block.get_i32();
                let child_start = block.get_i64();
                if slot < children {
                    let child_seq = u32::try_from(child_seq)
                        .map_err(|_| corrupt(format!("node {} has a bad child", seq)))?;
                    node.link_child(child_seq, child_start);
                }
            }
        }

        node.intervals.reserve(count.min(block.remaining() / INTERVAL_HEADER_SIZE));
        for _ in 0..count {
            need(block, INTERVAL_HEADER_SIZE)?;
            let start = block.get_i64();
            let end = block.get_i64();
            let quark: Quark = block.get_i32();
            let value = match StateValueType::from_tag(block.get_u8()) {
                Some(StateValueType::Null) => StateValue::Null,
                Some(StateValueType::Int) => {
                    need(block, 4)?;
                    StateValue::Int(block.get_i32())
                }
                Some(StateValueType::Long) => {
                    need(block, 8)?;
                    StateValue::Long(block.get_i64())
                }
                Some(StateValueType::Double) => {
                    need(block, 8)?;
                    StateValue::Double(block.get_f64())
                }
                Some(StateValueType::String) => {
                    need(block, 2)?;
                    let len = block.get_u16() as usize;
                    need(block, len)?;
                    let text = std::str::from_utf8(&block[..len])
                        .map_err(|_| corrupt(format!("node {} holds invalid UTF-8", seq)))?
                        .to_string();
                    block.advance(len);
                    StateValue::String(text)
                }
                None => return Err(corrupt(format!("node {} holds an unknown value type", seq))),
            };
            let interval = StateInterval::new(start, end, quark, value);
            node.used += interval_size(&interval);
            node.intervals.push(interval);
        }

        Ok(node)
    }
}

fn need(buf: &[u8], len: usize) -> Result<()> {
    if buf.len() < len {
        return Err(corrupt("truncated history tree node"));
    }
    Ok(())
}

fn corrupt(message: impl Into<String>) -> StateSystemError {
    StateSystemError::CorruptPersistedState(message.into())
}
