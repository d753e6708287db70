//! Arena B-tree over segments
//!
//! Segments are leaves of a tree of blocks with at most `capacity` children.
//! Each block caches two aggregates of its subtree:
//!
//! - `len`: visible length in the local view (everything applied so far)
//! - `max_seq`: highest acknowledged insert/removal sequence number
//!
//! A perspective `(ref_seq, client)` agrees with the local view on every
//! segment whose events are all at or below `ref_seq`, so perspective queries
//! reuse the cached length of such blocks and only descend into the rest.
//! Pending local events never appear in a tree queried from another client's
//! perspective: the replica rolls them back before applying remote ops.
//!
//! Segment keys stay stable for the lifetime of a segment, across splits of
//! its neighbours and rebalancing.

use super::segment::Segment;
use super::stamp::Perspective;

/// Stable handle of a segment in the tree
pub(crate) type SegKey = usize;

type BlockId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Child {
    Block(BlockId),
    Leaf(SegKey),
}

#[derive(Debug, Clone)]
struct Block {
    parent: Option<BlockId>,
    children: Vec<Child>,
    len: usize,
    max_seq: u64,
}

impl Block {
    fn new(parent: Option<BlockId>) -> Self {
        Self {
            parent,
            children: Vec::new(),
            len: 0,
            max_seq: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Leaf {
    segment: Option<Segment>,
    parent: BlockId,
}

/// Which view lengths are measured in
#[derive(Debug, Clone, Copy)]
pub(crate) enum View<'a> {
    /// Everything applied so far, pending local ops included
    Local,
    /// What an op issued from this perspective saw
    At(&'a Perspective),
}

#[derive(Debug, Clone)]
pub(crate) struct SegmentTree {
    leaves: Vec<Leaf>,
    free_leaves: Vec<SegKey>,
    blocks: Vec<Block>,
    free_blocks: Vec<BlockId>,
    root: BlockId,
    capacity: usize,
    count: usize,
}

impl SegmentTree {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            leaves: Vec::new(),
            free_leaves: Vec::new(),
            blocks: vec![Block::new(None)],
            free_blocks: Vec::new(),
            root: 0,
            capacity: capacity.max(4),
            count: 0,
        }
    }

    /// Visible length in the local view
    pub(crate) fn len(&self) -> usize {
        self.blocks[self.root].len
    }

    /// Visible length in the given view
    pub(crate) fn visible_len(&self, view: View<'_>) -> usize {
        self.child_len(Child::Block(self.root), view)
    }

    /// Number of stored segments, tombstones included
    pub(crate) fn segment_count(&self) -> usize {
        self.count
    }

    pub(crate) fn get(&self, key: SegKey) -> Option<&Segment> {
        self.leaves.get(key)?.segment.as_ref()
    }

    /// Mutate a segment in place and refresh the cached aggregates above it
    pub(crate) fn update<R>(&mut self, key: SegKey, f: impl FnOnce(&mut Segment) -> R) -> Option<R> {
        let leaf = self.leaves.get_mut(key)?;
        let result = f(leaf.segment.as_mut()?);
        let parent = leaf.parent;
        self.refresh_path(parent);
        Some(result)
    }

    pub(crate) fn first(&self) -> Option<SegKey> {
        self.leftmost(Child::Block(self.root))
    }

    pub(crate) fn last(&self) -> Option<SegKey> {
        self.rightmost(Child::Block(self.root))
    }

    pub(crate) fn next(&self, key: SegKey) -> Option<SegKey> {
        let mut child = Child::Leaf(key);
        loop {
            let (parent, index) = self.index_in_parent(child)?;
            if let Some(&sibling) = self.blocks[parent].children.get(index + 1) {
                return self.leftmost(sibling);
            }
            child = Child::Block(parent);
        }
    }

    #[cfg(test)]
    fn prev(&self, key: SegKey) -> Option<SegKey> {
        let mut child = Child::Leaf(key);
        loop {
            let (parent, index) = self.index_in_parent(child)?;
            if index > 0 {
                return self.rightmost(self.blocks[parent].children[index - 1]);
            }
            child = Child::Block(parent);
        }
    }

    /// In-order iteration, tombstones included
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            tree: self,
            next: self.first(),
        }
    }

    /// Insert directly before `before`
    pub(crate) fn insert_before(&mut self, before: SegKey, segment: Segment) -> SegKey {
        match self.index_in_parent(Child::Leaf(before)) {
            Some((parent, index)) => self.insert_leaf(parent, index, segment),
            None => self.push_back(segment),
        }
    }

    /// Insert directly after `after`, or at the front for `None`
    pub(crate) fn insert_after(&mut self, after: Option<SegKey>, segment: Segment) -> SegKey {
        match after {
            Some(key) => match self.index_in_parent(Child::Leaf(key)) {
                Some((parent, index)) => self.insert_leaf(parent, index + 1, segment),
                None => self.push_back(segment),
            },
            None => match self.first() {
                Some(first) => self.insert_before(first, segment),
                None => {
                    let root = self.root;
                    self.insert_leaf(root, 0, segment)
                }
            },
        }
    }

    /// Append at the end
    pub(crate) fn push_back(&mut self, segment: Segment) -> SegKey {
        match self.last() {
            Some(last) => self.insert_after(Some(last), segment),
            None => {
                let root = self.root;
                self.insert_leaf(root, 0, segment)
            }
        }
    }

    /// Physically remove a segment
    pub(crate) fn remove(&mut self, key: SegKey) -> Option<Segment> {
        let leaf = self.leaves.get_mut(key)?;
        let segment = leaf.segment.take()?;
        let parent = leaf.parent;
        self.free_leaves.push(key);
        self.count -= 1;
        self.detach(Child::Leaf(key), parent);
        Some(segment)
    }

    /// Split a text segment at a grapheme offset; returns the key of the right half
    pub(crate) fn split(&mut self, key: SegKey, offset: usize) -> Option<SegKey> {
        let (parent, index) = self.index_in_parent(Child::Leaf(key))?;
        let right = self.leaves[key].segment.as_mut()?.split_off(offset)?;
        Some(self.insert_leaf(parent, index + 1, right))
    }

    /// Number of visible units before `key` in the given view
    pub(crate) fn offset_of(&self, key: SegKey, view: View<'_>) -> usize {
        let mut offset = 0;
        let mut child = Child::Leaf(key);
        while let Some((parent, index)) = self.index_in_parent(child) {
            offset += self.blocks[parent].children[..index]
                .iter()
                .map(|c| self.child_len(*c, view))
                .sum::<usize>();
            child = Child::Block(parent);
        }
        offset
    }

    /// Find the segment holding visible unit `pos` and the offset inside it
    pub(crate) fn seek(&self, pos: usize, view: View<'_>) -> Option<(SegKey, usize)> {
        let mut remaining = pos;
        let mut block = self.root;
        'descend: loop {
            for &child in &self.blocks[block].children {
                let len = self.child_len(child, view);
                if remaining < len {
                    match child {
                        Child::Leaf(key) => return Some((key, remaining)),
                        Child::Block(inner) => {
                            block = inner;
                            continue 'descend;
                        }
                    }
                }
                remaining -= len;
            }
            return None;
        }
    }

    /// Rebuild the block structure over the current segments
    ///
    /// Segment keys are preserved.
    pub(crate) fn rebuild(&mut self) {
        let mut level: Vec<Child> = self.iter().map(|(key, _)| Child::Leaf(key)).collect();
        self.blocks.clear();
        self.free_blocks.clear();

        if level.is_empty() {
            self.blocks.push(Block::new(None));
            self.root = 0;
            return;
        }

        let fill = (self.capacity * 3 / 4).max(2);
        loop {
            let mut next = Vec::with_capacity(level.len() / fill + 1);
            for chunk in level.chunks(fill) {
                let block = self.alloc_block(None);
                for &child in chunk {
                    self.set_parent(child, block);
                }
                self.blocks[block].children = chunk.to_vec();
                self.refresh_block(block);
                next.push(Child::Block(block));
            }
            if let [Child::Block(root)] = next[..] {
                self.root = root;
                return;
            }
            level = next;
        }
    }

    /// Many blocks relative to the number of segments (after heavy collection)
    pub(crate) fn is_sparse(&self) -> bool {
        let live_blocks = self.blocks.len() - self.free_blocks.len();
        live_blocks * self.capacity > 4 * (self.count + self.capacity)
    }

    fn insert_leaf(&mut self, block: BlockId, index: usize, segment: Segment) -> SegKey {
        let leaf = Leaf {
            segment: Some(segment),
            parent: block,
        };
        let key = match self.free_leaves.pop() {
            Some(key) => {
                self.leaves[key] = leaf;
                key
            }
            None => {
                self.leaves.push(leaf);
                self.leaves.len() - 1
            }
        };
        self.blocks[block].children.insert(index, Child::Leaf(key));
        self.count += 1;
        self.split_overfull(block);
        key
    }

    fn alloc_block(&mut self, parent: Option<BlockId>) -> BlockId {
        match self.free_blocks.pop() {
            Some(id) => {
                self.blocks[id] = Block::new(parent);
                id
            }
            None => {
                self.blocks.push(Block::new(parent));
                self.blocks.len() - 1
            }
        }
    }

    fn split_overfull(&mut self, block: BlockId) {
        let mut block = block;
        loop {
            let size = self.blocks[block].children.len();
            if size <= self.capacity {
                self.refresh_path(block);
                return;
            }

            let moved = self.blocks[block].children.split_off(size / 2);
            let parent = self.blocks[block].parent;
            let sibling = self.alloc_block(parent);
            for &child in &moved {
                self.set_parent(child, sibling);
            }
            self.blocks[sibling].children = moved;
            self.refresh_block(block);
            self.refresh_block(sibling);

            match parent {
                Some(parent) => {
                    let index = self.blocks[parent]
                        .children
                        .iter()
                        .position(|c| *c == Child::Block(block))
                        .unwrap_or(self.blocks[parent].children.len());
                    let at = (index + 1).min(self.blocks[parent].children.len());
                    self.blocks[parent].children.insert(at, Child::Block(sibling));
                    block = parent;
                }
                None => {
                    let root = self.alloc_block(None);
                    self.blocks[root].children = vec![Child::Block(block), Child::Block(sibling)];
                    self.blocks[block].parent = Some(root);
                    self.blocks[sibling].parent = Some(root);
                    self.root = root;
                    self.refresh_block(root);
                    return;
                }
            }
        }
    }

    fn detach(&mut self, child: Child, block: BlockId) {
        let mut child = child;
        let mut block = block;
        loop {
            self.blocks[block].children.retain(|c| *c != child);
            if !self.blocks[block].children.is_empty() || block == self.root {
                break;
            }
            let Some(parent) = self.blocks[block].parent else {
                break;
            };
            self.free_blocks.push(block);
            child = Child::Block(block);
            block = parent;
        }
        self.refresh_path(block);
        self.collapse_root();
    }

    /// Drop root blocks that only forward to a single child block
    fn collapse_root(&mut self) {
        loop {
            let only = match self.blocks[self.root].children.as_slice() {
                [Child::Block(only)] => *only,
                _ => return,
            };
            self.free_blocks.push(self.root);
            self.blocks[only].parent = None;
            self.root = only;
        }
    }

    fn set_parent(&mut self, child: Child, parent: BlockId) {
        match child {
            Child::Leaf(key) => self.leaves[key].parent = parent,
            Child::Block(block) => self.blocks[block].parent = Some(parent),
        }
    }

    fn index_in_parent(&self, child: Child) -> Option<(BlockId, usize)> {
        let parent = match child {
            Child::Leaf(key) => {
                let leaf = self.leaves.get(key)?;
                leaf.segment.as_ref()?;
                leaf.parent
            }
            Child::Block(block) => self.blocks[block].parent?,
        };
        let index = self.blocks[parent].children.iter().position(|c| *c == child)?;
        Some((parent, index))
    }

    fn leftmost(&self, child: Child) -> Option<SegKey> {
        let mut child = child;
        loop {
            match child {
                Child::Leaf(key) => return Some(key),
                Child::Block(block) => child = *self.blocks[block].children.first()?,
            }
        }
    }

    fn rightmost(&self, child: Child) -> Option<SegKey> {
        let mut child = child;
        loop {
            match child {
                Child::Leaf(key) => return Some(key),
                Child::Block(block) => child = *self.blocks[block].children.last()?,
            }
        }
    }

    fn child_len(&self, child: Child, view: View<'_>) -> usize {
        match (child, view) {
            (Child::Leaf(key), View::Local) => self.get(key).map_or(0, Segment::local_len),
            (Child::Leaf(key), View::At(perspective)) => {
                self.get(key).map_or(0, |s| s.len_in(perspective))
            }
            (Child::Block(block), View::Local) => self.blocks[block].len,
            (Child::Block(block), View::At(perspective)) => {
                let block = &self.blocks[block];
                if block.max_seq <= perspective.ref_seq {
                    block.len
                } else {
                    block.children.iter().map(|c| self.child_len(*c, view)).sum()
                }
            }
        }
    }

    fn child_max_seq(&self, child: Child) -> u64 {
        match child {
            Child::Leaf(key) => self.get(key).map_or(0, Segment::max_acked_seq),
            Child::Block(block) => self.blocks[block].max_seq,
        }
    }

    fn refresh_block(&mut self, block: BlockId) {
        let (len, max_seq) = self.blocks[block]
            .children
            .iter()
            .fold((0, 0), |(len, max_seq), c| {
                (
                    len + self.child_len(*c, View::Local),
                    max_seq.max(self.child_max_seq(*c)),
                )
            });
        let block = &mut self.blocks[block];
        block.len = len;
        block.max_seq = max_seq;
    }

    fn refresh_path(&mut self, block: BlockId) {
        let mut current = Some(block);
        while let Some(block) = current {
            self.refresh_block(block);
            current = self.blocks[block].parent;
        }
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        let mut depth = 1;
        let mut block = self.root;
        while let Some(Child::Block(inner)) = self.blocks[block].children.first() {
            depth += 1;
            block = *inner;
        }
        depth
    }
}

/// In-order iterator over `(key, segment)` pairs
pub(crate) struct Iter<'a> {
    tree: &'a SegmentTree,
    next: Option<SegKey>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (SegKey, &'a Segment);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.next?;
        self.next = self.tree.next(key);
        Some((key, self.tree.get(key)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge_tree::segment::Removal;
    use crate::merge_tree::stamp::{Seq, Stamp};

    fn text(s: &str, seq: u64) -> Segment {
        Segment::text(s, Stamp::new(Seq::Acked(seq), "A"))
    }

    fn contents(tree: &SegmentTree) -> String {
        tree.iter()
            .filter(|(_, s)| !s.is_removed())
            .filter_map(|(_, s)| s.as_text())
            .collect()
    }

    #[test]
    fn test_insert_front_and_back() {
        let mut tree = SegmentTree::new(4);
        let b = tree.push_back(text("b", 1));
        tree.insert_after(None, text("a", 2));
        tree.insert_after(Some(b), text("c", 3));

        assert_eq!(contents(&tree), "abc");
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.segment_count(), 3);
    }

    #[test]
    fn test_many_inserts_split_blocks() {
        let mut tree = SegmentTree::new(4);
        for i in 0..200 {
            tree.push_back(text(&(i % 10).to_string(), 1));
        }

        assert_eq!(tree.len(), 200);
        assert!(tree.depth() > 2, "Tree should have grown");

        let expected: String = (0..200).map(|i| (i % 10).to_string()).collect();
        assert_eq!(contents(&tree), expected);

        for pos in [0, 57, 199] {
            let (key, offset) = tree.seek(pos, View::Local).unwrap();
            assert_eq!(offset, 0);
            assert_eq!(tree.offset_of(key, View::Local), pos);
        }
        assert!(tree.seek(200, View::Local).is_none());
    }

    #[test]
    fn test_split_keeps_order() {
        let mut tree = SegmentTree::new(4);
        let key = tree.push_back(text("hello", 1));
        tree.push_back(text("!", 1));

        let right = tree.split(key, 2).unwrap();
        assert_eq!(tree.get(key).unwrap().as_text(), Some("he"));
        assert_eq!(tree.get(right).unwrap().as_text(), Some("llo"));
        assert_eq!(tree.next(key), Some(right));
        assert_eq!(tree.prev(right), Some(key));
        assert_eq!(contents(&tree), "hello!");
    }

    #[test]
    fn test_remove_and_collapse() {
        let mut tree = SegmentTree::new(4);
        let keys: Vec<_> = (0..50).map(|_| tree.push_back(text("x", 1))).collect();

        for key in &keys[..49] {
            assert!(tree.remove(*key).is_some());
        }
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.segment_count(), 1);
        assert_eq!(tree.first(), Some(keys[49]));
        assert_eq!(tree.depth(), 1);

        tree.remove(keys[49]);
        assert_eq!(tree.first(), None);
        tree.push_back(text("y", 1));
        assert_eq!(contents(&tree), "y");
    }

    #[test]
    fn test_perspective_lengths() {
        let mut tree = SegmentTree::new(4);
        for _ in 0..20 {
            tree.push_back(text("ab", 1));
        }
        let late = tree.push_back(text("late", 9));
        tree.update(late, |s| s.removal = Some(Removal::new(Seq::Acked(10), "B")));

        assert_eq!(tree.len(), 40);
        assert_eq!(tree.visible_len(View::At(&Perspective::new(1, "C"))), 40);
        assert_eq!(tree.visible_len(View::At(&Perspective::new(9, "C"))), 44);
        assert_eq!(tree.visible_len(View::At(&Perspective::new(9, "B"))), 40);
        assert_eq!(tree.visible_len(View::At(&Perspective::new(10, "C"))), 40);
    }

    #[test]
    fn test_rebuild_preserves_keys() {
        let mut tree = SegmentTree::new(4);
        let keys: Vec<_> = (0..40).map(|i| tree.push_back(text(&i.to_string(), 1))).collect();
        for key in keys.iter().step_by(2) {
            tree.remove(*key);
        }

        let before = contents(&tree);
        tree.rebuild();
        assert_eq!(contents(&tree), before);
        assert_eq!(tree.get(keys[1]).unwrap().as_text(), Some("1"));
        assert_eq!(tree.next(keys[1]), Some(keys[3]));
        assert_eq!(tree.len(), before.len());
    }
}
