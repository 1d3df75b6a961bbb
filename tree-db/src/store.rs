//! Binary search tree with one reader/writer lock per node.
//!
//! Every operation walks down from a root sentinel hand-over-hand: the lock
//! of the next node is taken before the lock of the current node is released,
//! and locks are only ever acquired parent-then-child. This rules out
//! deadlock and lets operations whose paths split above a common ancestor run
//! in parallel. There is no lock covering the whole tree.
//!
//! Children are `Arc`-shared so a traversal can hold an owned guard on a child
//! (`read_arc`/`write_arc`) independently of the guard on its parent. The
//! parent's link is still the only owner that matters: a node is unreachable
//! once its parent's link is cleared, and every thread that could wait on the
//! node's lock must hold the parent's lock first.

use std::{
    io::{self, Write},
    mem,
    sync::Arc,
};

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock,
};
use thiserror::Error;

/// Longest accepted name or value, in bytes.
pub const MAX_ENTRY_LEN: usize = 256;

type Link = Arc<RwLock<Node>>;
type ReadGuard = ArcRwLockReadGuard<RawRwLock, Node>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, Node>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{field} is {len} bytes long, the limit is {}", MAX_ENTRY_LEN)]
    EntryTooLong { field: &'static str, len: usize },
}

/// Outcome of [`TreeStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Inserted,
    AlreadyPresent,
}

/// Outcome of [`TreeStore::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    NotFound,
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Left,
    Right,
}

struct Node {
    name: String,
    value: String,
    left: Option<Link>,
    right: Option<Link>,
}

impl Node {
    fn new(name: String, value: String) -> Self {
        Self {
            name,
            value,
            left: None,
            right: None,
        }
    }

    fn side_for(&self, name: &str) -> Side {
        if name < self.name.as_str() {
            Side::Left
        } else {
            Side::Right
        }
    }

    fn child(&self, side: Side) -> Option<&Link> {
        match side {
            Side::Left => self.left.as_ref(),
            Side::Right => self.right.as_ref(),
        }
    }

    fn child_mut(&mut self, side: Side) -> &mut Option<Link> {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    fn child_toward(&self, name: &str) -> Option<Link> {
        self.child(self.side_for(name)).cloned()
    }
}

/// Concurrent key/value store.
///
/// The root is a sentinel with an empty name. Every real key compares "not
/// less" than the empty string, so the whole tree hangs off the sentinel's
/// right link and the sentinel is the single entry point for lock coupling.
pub struct TreeStore {
    root: Link,
}

impl Default for TreeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeStore {
    pub fn new() -> Self {
        Self {
            root: Arc::new(RwLock::new(Node::new(String::new(), String::new()))),
        }
    }

    /// Returns a copy of the value stored under `name`.
    pub fn query(&self, name: &str) -> Option<String> {
        let mut current: ReadGuard = self.root.read_arc();
        loop {
            let next = current.child_toward(name)?;
            // The child is locked before the assignment releases the parent.
            current = next.read_arc();
            if current.name == name {
                return Some(current.value.clone());
            }
        }
    }

    /// Inserts `name` if it is absent. An existing entry is left untouched.
    ///
    /// The descent takes write locks all the way down because reaching an
    /// empty link means the parent's link has to be mutated.
    pub fn insert(&self, name: &str, value: &str) -> Result<Insertion, StoreError> {
        check_len("name", name)?;
        check_len("value", value)?;

        let mut parent: WriteGuard = self.root.write_arc();
        loop {
            let side = parent.side_for(name);
            let Some(next) = parent.child(side).cloned() else {
                let node = Node::new(name.to_owned(), value.to_owned());
                *parent.child_mut(side) = Some(Arc::new(RwLock::new(node)));
                return Ok(Insertion::Inserted);
            };

            let child = next.write_arc();
            if child.name == name {
                return Ok(Insertion::AlreadyPresent);
            }
            parent = child;
        }
    }

    /// Removes `name`, promoting the in-order successor when the removed node
    /// has two children.
    pub fn remove(&self, name: &str) -> Removal {
        let mut parent: WriteGuard = self.root.write_arc();
        let mut target = loop {
            let Some(next) = parent.child_toward(name) else {
                return Removal::NotFound;
            };
            let child = next.write_arc();
            if child.name == name {
                break child;
            }
            parent = child;
        };
        let slot = parent.side_for(name);

        match (target.left.take(), target.right.take()) {
            (Some(left), Some(right)) => {
                target.left = Some(left);
                promote_successor(&mut target, right);
                drop(target);
                drop(parent);
            }
            (left, right) => {
                *parent.child_mut(slot) = left.or(right);
                drop(parent);
                // Unlocks before the last reference to the node goes away.
                drop(target);
            }
        }
        Removal::Removed
    }

    /// Writes the tree in pre-order, one line per position, indented by depth.
    ///
    /// Both children are read-locked before their parent is left behind, and a
    /// node stays locked until both of its subtrees have been written.
    /// Concurrent writers outside the locked frontier keep running, so the
    /// output can mix states from before and after their changes.
    pub fn dump<W: Write>(&self, out: &mut W) -> io::Result<()> {
        enum Step {
            Visit(ReadGuard, usize),
            Empty(usize),
            Release(ReadGuard),
        }

        let mut steps = vec![Step::Visit(self.root.read_arc(), 0)];
        while let Some(step) = steps.pop() {
            match step {
                Step::Visit(node, depth) => {
                    write_indent(out, depth)?;
                    if depth == 0 {
                        writeln!(out, "(root)")?;
                    } else {
                        writeln!(out, "{} {}", node.name, node.value)?;
                    }

                    let left = node.left.as_ref().map(|link| link.read_arc());
                    let right = node.right.as_ref().map(|link| link.read_arc());
                    steps.push(Step::Release(node));
                    for child in [right, left] {
                        steps.push(match child {
                            Some(guard) => Step::Visit(guard, depth + 1),
                            None => Step::Empty(depth + 1),
                        });
                    }
                }
                Step::Empty(depth) => {
                    write_indent(out, depth)?;
                    writeln!(out, "(null)")?;
                }
                Step::Release(node) => drop(node),
            }
        }
        Ok(())
    }

    /// Returns every entry in key order, read-lock-coupled like [`Self::dump`].
    pub fn entries(&self) -> Vec<(String, String)> {
        enum Step {
            Enter(ReadGuard),
            Emit(ReadGuard),
        }

        let mut entries = Vec::new();
        let mut steps = Vec::new();
        {
            let root = self.root.read_arc();
            let left = root.left.as_ref().map(|link| link.read_arc());
            let right = root.right.as_ref().map(|link| link.read_arc());
            steps.extend(right.map(Step::Enter));
            steps.extend(left.map(Step::Enter));
        }

        while let Some(step) = steps.pop() {
            match step {
                Step::Enter(node) => {
                    let left = node.left.as_ref().map(|link| link.read_arc());
                    let right = node.right.as_ref().map(|link| link.read_arc());
                    steps.extend(right.map(Step::Enter));
                    steps.push(Step::Emit(node));
                    steps.extend(left.map(Step::Enter));
                }
                Step::Emit(node) => entries.push((node.name.clone(), node.value.clone())),
            }
        }
        entries
    }

    /// Frees every real node, leaving an empty but usable tree.
    ///
    /// Only called once no other thread can reach the store. The locks taken
    /// here are therefore uncontended. Nodes are unlinked iteratively so a
    /// degenerate, list-shaped tree cannot exhaust the stack.
    pub fn teardown(&self) {
        let mut pending: Vec<Link> = Vec::new();
        {
            let mut root = self.root.write();
            pending.extend(root.left.take());
            pending.extend(root.right.take());
        }
        while let Some(link) = pending.pop() {
            let mut node = link.write();
            pending.extend(node.left.take());
            pending.extend(node.right.take());
        }
    }
}

impl Drop for TreeStore {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Moves the in-order successor of `target` into it and unlinks the donor.
///
/// `right` is the right subtree, already detached from `target`, which keeps
/// its left child. `target` stays write-locked for the whole walk, so nobody
/// else can be inside `right`; the walk still couples locks down the left
/// spine so the donor's parent is held when the donor is spliced out.
fn promote_successor(target: &mut Node, right: Link) {
    let mut donor: WriteGuard = right.write_arc();
    let next = donor.left.clone();

    match next {
        None => {
            // The right child is the successor itself.
            target.name = mem::take(&mut donor.name);
            target.value = mem::take(&mut donor.value);
            target.right = donor.right.take();
        }
        Some(next) => {
            let mut donor_parent = mem::replace(&mut donor, next.write_arc());
            while let Some(next) = donor.left.clone() {
                let child = next.write_arc();
                donor_parent = mem::replace(&mut donor, child);
            }

            target.name = mem::take(&mut donor.name);
            target.value = mem::take(&mut donor.value);
            donor_parent.left = donor.right.take();
            target.right = Some(right);
        }
    }
}

fn check_len(field: &'static str, text: &str) -> Result<(), StoreError> {
    if text.len() > MAX_ENTRY_LEN {
        return Err(StoreError::EntryTooLong {
            field,
            len: text.len(),
        });
    }
    Ok(())
}

fn write_indent<W: Write>(out: &mut W, depth: usize) -> io::Result<()> {
    for _ in 0..depth {
        out.write_all(b" ")?;
    }
    Ok(())
}
