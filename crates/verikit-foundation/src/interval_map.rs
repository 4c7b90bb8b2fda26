//! Ordered map keyed by closed integer intervals, with overlap queries.
//!
//! Storage is a B-tree whose leaves hold `(lo, hi, value)` triples sorted by
//! `(lo, hi)` and whose branches carry per-child subtree bounds so overlap
//! queries can prune whole subtrees. Duplicate intervals are permitted and
//! keep their insertion order. There is no removal operation; downstream
//! analyses only ever accumulate ranges for the lifetime of a compilation.
//!
//! Iterators borrow the map shared, so the borrow checker statically rules
//! out using a stale path across an `insert`.

const LEAF_CAPACITY: usize = 8;
const BRANCH_CAPACITY: usize = 16;

/// Index of a node within the map's node arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct Child<K> {
    id: NodeId,
    /// `(lo, hi)` of the last entry in the subtree, in sort order. Used to
    /// navigate to an insertion position.
    last: (K, K),
    /// Smallest `lo` in the subtree; monotone across siblings.
    min_lo: K,
    /// Largest `hi` in the subtree; the overlap pruning bound.
    max_hi: K,
}

#[derive(Debug)]
enum Node<K, V> {
    Leaf { entries: Vec<((K, K), V)> },
    Branch { children: Vec<Child<K>> },
}

#[derive(Debug)]
pub struct IntervalMap<K, V> {
    nodes: Vec<Node<K, V>>,
    root: Option<NodeId>,
    /// Number of branch levels above the leaves; 0 means the root is a leaf.
    height: u32,
    len: usize,
}

impl<K, V> Default for IntervalMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> IntervalMap<K, V> {
    pub fn new() -> Self {
        Self {
            nodes: vec![],
            root: None,
            height: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<K: Copy + Ord + std::fmt::Debug, V> IntervalMap<K, V> {
    /// Inserts `[lo, hi] -> value`. Requires `hi >= lo`. Entries with equal
    /// intervals are kept in insertion order.
    pub fn insert(&mut self, lo: K, hi: K, value: V) {
        assert!(hi >= lo, "interval end must not be less than its start");
        let key = (lo, hi);
        let Some(root) = self.root else {
            let id = self.alloc(Node::Leaf {
                entries: vec![(key, value)],
            });
            self.root = Some(id);
            self.len = 1;
            return;
        };

        self.len += 1;
        if let Some(sibling) = self.insert_into(root, self.height, key, value) {
            // The root split; grow the tree by one level.
            let left = self.child_summary(root);
            let right = self.child_summary(sibling);
            let new_root = self.alloc(Node::Branch {
                children: vec![left, right],
            });
            self.root = Some(new_root);
            self.height += 1;
        }
    }

    /// `(min lo, max hi)` over all live entries.
    pub fn get_bounds(&self) -> Option<(K, K)> {
        let root = self.root?;
        let summary = self.child_summary(root);
        Some((summary.min_lo, summary.max_hi))
    }

    pub fn begin(&self) -> Iter<'_, K, V> {
        let mut iter = Iter {
            map: self,
            path: vec![],
        };
        if let Some(root) = self.root {
            iter.descend_first(root);
        }
        iter
    }

    pub fn end(&self) -> Iter<'_, K, V> {
        Iter {
            map: self,
            path: vec![],
        }
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        self.begin()
    }

    /// Overlap query: yields every stored `[a, b]` with `a <= hi && b >= lo`,
    /// in `(a, b)` sort order.
    pub fn find(&self, lo: K, hi: K) -> OverlapIter<'_, K, V> {
        let mut iter = OverlapIter {
            map: self,
            path: vec![],
            lo,
            hi,
        };
        if let Some(root) = self.root {
            if self.child_summary(root).max_hi >= lo {
                iter.descend_first_overlap(root);
                let (entry_lo, _) = iter.current_bounds();
                if entry_lo > hi {
                    iter.path.clear();
                }
            }
        }
        iter
    }

    /// Structural audit; panics on any violated invariant.
    pub fn verify(&self) {
        let Some(root) = self.root else {
            assert_eq!(self.len, 0);
            return;
        };
        let mut prev = None;
        let counted = self.verify_node(root, self.height, &mut prev);
        assert_eq!(counted, self.len, "entry count does not match tree contents");
    }

    fn verify_node(&self, node: NodeId, level: u32, prev: &mut Option<(K, K)>) -> usize {
        match &self.nodes[node.index()] {
            Node::Leaf { entries } => {
                assert_eq!(level, 0, "leaf found above level zero");
                assert!(!entries.is_empty(), "empty leaf node");
                assert!(entries.len() <= LEAF_CAPACITY, "overfull leaf node");
                for ((lo, hi), _) in entries {
                    assert!(hi >= lo, "inverted interval stored");
                    if let Some(prev) = prev {
                        assert!(*prev <= (*lo, *hi), "leaf entries out of order");
                    }
                    *prev = Some((*lo, *hi));
                }
                entries.len()
            }
            Node::Branch { children } => {
                assert!(level > 0, "branch found at leaf level");
                assert!(children.len() >= 2, "underfull branch node");
                assert!(children.len() <= BRANCH_CAPACITY, "overfull branch node");
                let mut counted = 0;
                for child in children {
                    let summary = self.child_summary(child.id);
                    assert_eq!(summary.last, child.last, "stale child key");
                    assert_eq!(summary.min_lo, child.min_lo, "stale child min bound");
                    assert_eq!(summary.max_hi, child.max_hi, "stale child max bound");
                    counted += self.verify_node(child.id, level - 1, prev);
                }
                counted
            }
        }
    }

    fn alloc(&mut self, node: Node<K, V>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn child_summary(&self, id: NodeId) -> Child<K> {
        match &self.nodes[id.index()] {
            Node::Leaf { entries } => {
                let (last, _) = entries.last().expect("leaf nodes are never empty");
                Child {
                    id,
                    last: *last,
                    min_lo: entries[0].0 .0,
                    max_hi: entries
                        .iter()
                        .map(|((_, hi), _)| *hi)
                        .max()
                        .expect("leaf nodes are never empty"),
                }
            }
            Node::Branch { children } => Child {
                id,
                last: children.last().expect("branch nodes are never empty").last,
                min_lo: children[0].min_lo,
                max_hi: children
                    .iter()
                    .map(|child| child.max_hi)
                    .max()
                    .expect("branch nodes are never empty"),
            },
        }
    }

    fn insert_into(&mut self, node: NodeId, level: u32, key: (K, K), value: V) -> Option<NodeId> {
        if level == 0 {
            return self.insert_into_leaf(node, key, value);
        }

        let (child_id, child_index) = {
            let Node::Branch { children } = &self.nodes[node.index()] else {
                unreachable!("level {level} node must be a branch");
            };
            let index = children
                .partition_point(|child| child.last <= key)
                .min(children.len() - 1);
            (children[index].id, index)
        };

        let split = self.insert_into(child_id, level - 1, key, value);
        let updated = self.child_summary(child_id);
        let new_child = split.map(|sibling| self.child_summary(sibling));

        let Node::Branch { children } = &mut self.nodes[node.index()] else {
            unreachable!("level {level} node must be a branch");
        };
        children[child_index] = updated;
        let Some(new_child) = new_child else {
            return None;
        };

        if children.len() < BRANCH_CAPACITY {
            children.insert(child_index + 1, new_child);
            return None;
        }

        // Split this branch, placing the freshly created child at its
        // position in the redistributed pair.
        let mut new_sizes = [0u32; 2];
        let (which, at) = distribute(
            2,
            children.len() as u32,
            BRANCH_CAPACITY as u32,
            &mut new_sizes,
            child_index as u32 + 1,
            true,
        );
        let mut right = children.split_off(new_sizes[0] as usize);
        if which == 0 {
            children.insert(at as usize, new_child);
        } else {
            right.insert(at as usize, new_child);
        }
        Some(self.alloc(Node::Branch { children: right }))
    }

    fn insert_into_leaf(&mut self, node: NodeId, key: (K, K), value: V) -> Option<NodeId> {
        let Node::Leaf { entries } = &mut self.nodes[node.index()] else {
            unreachable!("level zero node must be a leaf");
        };
        // Upper bound keeps duplicates in insertion order.
        let offset = entries.partition_point(|(entry, _)| *entry <= key);
        if entries.len() < LEAF_CAPACITY {
            entries.insert(offset, (key, value));
            return None;
        }

        let mut new_sizes = [0u32; 2];
        let (which, at) = distribute(
            2,
            entries.len() as u32,
            LEAF_CAPACITY as u32,
            &mut new_sizes,
            offset as u32,
            true,
        );
        let mut right = entries.split_off(new_sizes[0] as usize);
        if which == 0 {
            entries.insert(at as usize, (key, value));
        } else {
            right.insert(at as usize, (key, value));
        }
        Some(self.alloc(Node::Leaf { entries: right }))
    }
}

/// Left-leaning even distribution: spreads `num_elements` (+1 when `grow`)
/// across `num_nodes` nodes of the given capacity. Each node receives
/// `total / num_nodes` elements, plus one extra for the first
/// `total % num_nodes` nodes. Returns the `(node index, offset in node)`
/// where the grown element lands; when `grow` is set, that element is
/// excluded from the reported sizes.
fn distribute(
    num_nodes: u32,
    num_elements: u32,
    capacity: u32,
    new_sizes: &mut [u32],
    position: u32,
    grow: bool,
) -> (u32, u32) {
    debug_assert!(num_elements + grow as u32 <= num_nodes * capacity);
    debug_assert!(position <= num_elements);
    if num_nodes == 0 {
        return (0, 0);
    }

    let total = num_elements + grow as u32;
    let per_node = total / num_nodes;
    let extra = total % num_nodes;
    let mut pos = (num_nodes, 0);
    let mut sum = 0;
    for n in 0..num_nodes {
        new_sizes[n as usize] = per_node + u32::from(n < extra);
        sum += new_sizes[n as usize];
        if pos.0 == num_nodes && sum > position {
            pos = (n, position - (sum - new_sizes[n as usize]));
        }
    }

    debug_assert_eq!(sum, total);
    if grow {
        debug_assert!(pos.0 < num_nodes);
        debug_assert!(new_sizes[pos.0 as usize] > 0);
        new_sizes[pos.0 as usize] -= 1;
    }
    pos
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct PathEntry {
    node: NodeId,
    size: u32,
    offset: u32,
}

/// Cursor over the map in `(lo, hi)` order. An empty path is the
/// past-the-end position.
pub struct Iter<'a, K, V> {
    map: &'a IntervalMap<K, V>,
    path: Vec<PathEntry>,
}

impl<'a, K: Copy + Ord, V> Iter<'a, K, V> {
    pub fn valid(&self) -> bool {
        !self.path.is_empty()
    }

    pub fn bounds(&self) -> (K, K) {
        let leaf = self.path.last().expect("iterator is not valid");
        let Node::Leaf { entries } = &self.map.nodes[leaf.node.index()] else {
            unreachable!("iterator paths end at a leaf");
        };
        entries[leaf.offset as usize].0
    }

    pub fn value(&self) -> &'a V {
        let leaf = self.path.last().expect("iterator is not valid");
        let Node::Leaf { entries } = &self.map.nodes[leaf.node.index()] else {
            unreachable!("iterator paths end at a leaf");
        };
        &entries[leaf.offset as usize].1
    }

    pub fn move_next(&mut self) {
        let Some(leaf) = self.path.last_mut() else {
            return;
        };
        leaf.offset += 1;
        if leaf.offset < leaf.size {
            return;
        }

        // Climb until a slot with room to the right, then take the leftmost
        // descent into the next subtree.
        let mut level = self.path.len() - 1;
        loop {
            if level == 0 {
                self.path.clear();
                return;
            }
            level -= 1;
            if self.path[level].offset + 1 < self.path[level].size {
                break;
            }
        }
        self.path[level].offset += 1;
        self.path.truncate(level + 1);
        let next = self.child_at(level);
        self.descend_first(next);
    }

    pub fn move_prev(&mut self) {
        if self.path.is_empty() {
            if let Some(root) = self.map.root {
                self.descend_last(root);
            }
            return;
        }

        let leaf = self.path.last_mut().expect("path is not empty");
        if leaf.offset > 0 {
            leaf.offset -= 1;
            return;
        }

        let mut level = self.path.len() - 1;
        loop {
            if level == 0 {
                // Already at the first entry.
                return;
            }
            level -= 1;
            if self.path[level].offset > 0 {
                break;
            }
        }
        self.path[level].offset -= 1;
        self.path.truncate(level + 1);
        let next = self.child_at(level);
        self.descend_last(next);
    }

    fn child_at(&self, level: usize) -> NodeId {
        let entry = self.path[level];
        let Node::Branch { children } = &self.map.nodes[entry.node.index()] else {
            unreachable!("inner path entries are branches");
        };
        children[entry.offset as usize].id
    }

    fn descend_first(&mut self, mut node: NodeId) {
        loop {
            match &self.map.nodes[node.index()] {
                Node::Branch { children } => {
                    self.path.push(PathEntry {
                        node,
                        size: children.len() as u32,
                        offset: 0,
                    });
                    node = children[0].id;
                }
                Node::Leaf { entries } => {
                    self.path.push(PathEntry {
                        node,
                        size: entries.len() as u32,
                        offset: 0,
                    });
                    return;
                }
            }
        }
    }

    fn descend_last(&mut self, mut node: NodeId) {
        loop {
            match &self.map.nodes[node.index()] {
                Node::Branch { children } => {
                    self.path.push(PathEntry {
                        node,
                        size: children.len() as u32,
                        offset: children.len() as u32 - 1,
                    });
                    node = children.last().expect("branch nodes are never empty").id;
                }
                Node::Leaf { entries } => {
                    self.path.push(PathEntry {
                        node,
                        size: entries.len() as u32,
                        offset: entries.len() as u32 - 1,
                    });
                    return;
                }
            }
        }
    }
}

impl<'a, K, V> PartialEq for Iter<'a, K, V> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.map, other.map) && self.path == other.path
    }
}

impl<'a, K: Copy + Ord, V> Iterator for Iter<'a, K, V> {
    type Item = ((K, K), &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.valid() {
            return None;
        }
        let item = (self.bounds(), self.value());
        self.move_next();
        Some(item)
    }
}

/// Cursor over the entries overlapping a query interval, in `(lo, hi)`
/// order. Subtrees whose `max_hi` falls short of the query are pruned while
/// advancing; traversal stops outright once `min_lo` passes the query end.
pub struct OverlapIter<'a, K, V> {
    map: &'a IntervalMap<K, V>,
    path: Vec<PathEntry>,
    lo: K,
    hi: K,
}

impl<'a, K: Copy + Ord, V> OverlapIter<'a, K, V> {
    pub fn valid(&self) -> bool {
        !self.path.is_empty()
    }

    pub fn bounds(&self) -> (K, K) {
        self.current_bounds()
    }

    pub fn value(&self) -> &'a V {
        let leaf = self.path.last().expect("iterator is not valid");
        let Node::Leaf { entries } = &self.map.nodes[leaf.node.index()] else {
            unreachable!("iterator paths end at a leaf");
        };
        &entries[leaf.offset as usize].1
    }

    fn current_bounds(&self) -> (K, K) {
        let leaf = self.path.last().expect("iterator is not valid");
        let Node::Leaf { entries } = &self.map.nodes[leaf.node.index()] else {
            unreachable!("iterator paths end at a leaf");
        };
        entries[leaf.offset as usize].0
    }

    pub fn move_next(&mut self) {
        if self.path.is_empty() {
            return;
        }
        loop {
            let leaf = self.path.last_mut().expect("path is not empty");
            leaf.offset += 1;
            if leaf.offset >= leaf.size && !self.climb_to_next_subtree() {
                self.path.clear();
                return;
            }
            let (entry_lo, entry_hi) = self.current_bounds();
            if entry_lo > self.hi {
                self.path.clear();
                return;
            }
            if entry_hi >= self.lo {
                return;
            }
        }
    }

    /// Moves to the first entry of the next subtree that can still overlap.
    /// Returns false when traversal is complete.
    fn climb_to_next_subtree(&mut self) -> bool {
        let mut level = self.path.len() - 1;
        loop {
            if level == 0 {
                return false;
            }
            level -= 1;
            let entry = self.path[level];
            let Node::Branch { children } = &self.map.nodes[entry.node.index()] else {
                unreachable!("inner path entries are branches");
            };
            let mut next = entry.offset as usize + 1;
            while next < children.len() {
                let child = &children[next];
                if child.min_lo > self.hi {
                    return false;
                }
                if child.max_hi >= self.lo {
                    let id = child.id;
                    self.path.truncate(level + 1);
                    self.path[level].offset = next as u32;
                    self.descend_first_overlap(id);
                    return true;
                }
                next += 1;
            }
        }
    }

    fn descend_first_overlap(&mut self, mut node: NodeId) {
        loop {
            match &self.map.nodes[node.index()] {
                Node::Branch { children } => {
                    let index = children
                        .iter()
                        .position(|child| child.max_hi >= self.lo)
                        .expect("parent bound guarantees an overlapping child");
                    self.path.push(PathEntry {
                        node,
                        size: children.len() as u32,
                        offset: index as u32,
                    });
                    node = children[index].id;
                }
                Node::Leaf { entries } => {
                    let index = entries
                        .iter()
                        .position(|((_, hi), _)| *hi >= self.lo)
                        .expect("parent bound guarantees an overlapping entry");
                    self.path.push(PathEntry {
                        node,
                        size: entries.len() as u32,
                        offset: index as u32,
                    });
                    return;
                }
            }
        }
    }
}

impl<'a, K: Copy + Ord, V> Iterator for OverlapIter<'a, K, V> {
    type Item = ((K, K), &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.valid() {
            return None;
        }
        let item = (self.bounds(), self.value());
        self.move_next();
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map() {
        let map: IntervalMap<i32, u32> = IntervalMap::new();
        assert!(map.is_empty());
        assert!(map.begin() == map.begin());
        assert!(map.end() == map.begin());
        assert!(map.end() == map.end());
        assert!(!map.begin().valid());
        assert_eq!(map.get_bounds(), None);
        map.verify();
    }

    #[test]
    fn small_number_of_elements_in_root_leaf() {
        let mut map = IntervalMap::new();
        map.insert(1, 10, 1);
        map.insert(3, 7, 2);
        map.insert(2, 12, 3);
        map.insert(32, 42, 4);
        map.insert(3, 6, 5);

        let mut it = map.begin();
        assert!(it != map.end());
        assert_eq!(it.bounds(), (1, 10));
        assert_eq!(*it.value(), 1);

        it.move_next();
        assert_eq!(it.bounds(), (2, 12));

        it.move_next();
        assert_eq!(it.bounds(), (3, 6));

        it.move_next();
        assert_eq!(it.bounds(), (3, 7));

        it.move_prev();
        assert_eq!(it.bounds(), (3, 6));

        it.move_prev();
        assert_eq!(it.bounds(), (2, 12));
        assert_eq!(*it.value(), 3);

        assert_eq!(map.get_bounds(), Some((1, 42)));
        map.verify();

        let mut overlaps = map.find(7, 20);
        assert!(overlaps.valid());
        assert_eq!(overlaps.bounds(), (1, 10));
        assert_eq!(*overlaps.value(), 1);

        overlaps.move_next();
        assert!(overlaps.valid());
        assert_eq!(overlaps.bounds(), (2, 12));

        overlaps.move_next();
        assert_eq!(overlaps.bounds(), (3, 7));

        overlaps.move_next();
        assert!(!overlaps.valid());
    }

    #[test]
    fn duplicate_intervals_keep_insertion_order() {
        let mut map = IntervalMap::new();
        for i in 0..20 {
            map.insert(5, 9, i);
        }
        map.verify();
        let values: Vec<i32> = map.iter().map(|(_, &v)| v).collect();
        assert_eq!(values, (0..20).collect::<Vec<_>>());
    }

    /// xorshift with the parameters from Marsaglia's paper; deterministic
    /// stand-in for the mt19937 stream the reference tests use.
    struct XorShift32(u32);

    impl XorShift32 {
        fn next(&mut self) -> u32 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.0 = x;
            x
        }

        fn in_range(&mut self, lo: i32, hi: i32) -> i32 {
            lo + (self.next() % (hi - lo + 1) as u32) as i32
        }
    }

    #[test]
    fn branching_inserts() {
        let mut map = IntervalMap::new();
        let mut expected_overlap = vec![];

        // Wrapper around insert that catches all intervals that would
        // overlap the test interval we check at the end of the function.
        let mut insert = |map: &mut IntervalMap<i32, i32>, l: i32, r: i32, i: i32| {
            if r >= 200 && l <= 250 {
                expected_overlap.push((l, r, i));
            }
            map.insert(l, r, i);
        };

        // Insert a bunch of elements to force branching.
        for i in 1..1000 {
            insert(&mut map, 10 * i, 10 * i + 5, i);
            assert_eq!(map.get_bounds(), Some((10, 10 * i + 5)));
        }

        assert!(!map.is_empty());
        assert_eq!(map.get_bounds(), Some((10, 9995)));

        let mut it = map.begin();
        for i in 1..1000 {
            assert!(it.valid());
            assert_eq!(it.bounds(), (10 * i, 10 * i + 5));
            assert_eq!(*it.value(), i);
            it.move_next();
        }

        assert!(!it.valid());
        assert!(it == map.end());

        for i in (1..1000).rev() {
            it.move_prev();
            assert!(it.valid());
            assert_eq!(it.bounds(), (10 * i, 10 * i + 5));
            assert_eq!(*it.value(), i);
        }
        assert!(it == map.begin());

        // Insert more intervals in the middle.
        for i in 0..100 {
            insert(&mut map, 11 * i, 11 * i + i, i);
        }

        // Insert a bunch of pseudo-random intervals.
        let mut rng = XorShift32(0x2545f491);
        for i in 0..1000 {
            let left = rng.in_range(1, 10000);
            let right = rng.in_range(left, 10000);
            insert(&mut map, left, right, i);
        }

        map.verify();

        // Do some overlap finds.
        let mut actual_overlaps = vec![];
        let mut overlaps = map.find(200, 250);
        while overlaps.valid() {
            let (lo, hi) = overlaps.bounds();
            actual_overlaps.push((lo, hi, *overlaps.value()));
            overlaps.move_next();
        }

        let sorter = |left: &(i32, i32, i32), right: &(i32, i32, i32)| {
            (left.0, left.1).cmp(&(right.0, right.1))
        };
        expected_overlap.sort_by(sorter);
        actual_overlaps.sort_by(sorter);
        assert_eq!(expected_overlap, actual_overlaps);
    }

    #[test]
    fn forward_then_backward_iteration_mirrors() {
        let mut map = IntervalMap::new();
        let mut rng = XorShift32(0xdecafbad);
        for i in 0..500 {
            let lo = rng.in_range(1, 1000);
            let hi = rng.in_range(lo, 1000);
            map.insert(lo, hi, i);
        }
        map.verify();

        let forward: Vec<(i32, i32)> = map.iter().map(|(bounds, _)| bounds).collect();
        assert_eq!(forward.len(), 500);

        let mut backward = vec![];
        let mut it = map.end();
        for _ in 0..500 {
            it.move_prev();
            assert!(it.valid());
            backward.push(it.bounds());
        }
        assert!(it == map.begin());

        backward.reverse();
        assert_eq!(forward, backward);
    }
}
