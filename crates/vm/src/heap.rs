//! The runtime heap: boxed values and their collector.
//!
//! Strings, arrays, S-expressions, and closures live in an arena of
//! slots; the stack sees them only as handle words. A handle is
//! validated before every dereference, which is what keeps the
//! collector honest about the raw words it meets while scanning the
//! stack window: saved base pointers and return addresses are even but
//! never validate as live handles, so at worst a coincidental word
//! retains one object conservatively.
//!
//! Collection is stop-the-world mark-and-sweep, triggered when the live
//! object count reaches a doubling threshold. It only ever runs at the
//! top of an allocation, before the new object exists: handlers that
//! build an object allocate first and fill from popped words second, so
//! every word a collection can reach is still on the stack when it runs.

use std::collections::HashMap;

use lamarun_common::word::{self, Word};
use thiserror::Error;

/// How a heap operation went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The word is not a handle of any live object.
    #[error("not a heap value")]
    InvalidHandle,

    /// The object is not of the kind the operation needs.
    #[error("expected {expected}")]
    WrongKind { expected: &'static str },

    /// An element index fell outside the object.
    #[error("index {index} is out of bounds for length {len}")]
    OutOfBounds { index: i32, len: usize },

    /// A capture cell index fell outside the closure.
    #[error("capture cell {cell} is out of bounds for a closure of {len}")]
    BadCapture { cell: usize, len: usize },
}

/// One heap object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Obj {
    /// A byte string.
    Str(Vec<u8>),
    /// An array of words.
    Array(Vec<Word>),
    /// An S-expression: constructor tag hash plus fields.
    Sexp { tag: i32, fields: Vec<Word> },
    /// A closure: bytecode entry offset plus captured words.
    Closure { entry: u32, captures: Vec<Word> },
}

#[derive(Debug)]
struct HeapSlot {
    mark: bool,
    obj: Obj,
}

/// The arena and its collector.
pub struct Heap {
    slots: Vec<Option<HeapSlot>>,
    free: Vec<usize>,
    live: usize,
    threshold: usize,
    collections: usize,
    /// Names seen by [`Heap::tag_hash`], for rendering S-expressions.
    tag_names: HashMap<i32, Vec<u8>>,
}

impl Heap {
    /// Collection threshold at startup, in live objects.
    const INITIAL_THRESHOLD: usize = 1024;

    /// Mask keeping a tag hash inside the boxed integer range.
    const TAG_HASH_MASK: u32 = 0x3FFF_FFFF;

    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            threshold: Self::INITIAL_THRESHOLD,
            collections: 0,
            tag_names: HashMap::new(),
        }
    }

    /// Completed collection cycles.
    pub fn collections(&self) -> usize {
        self.collections
    }

    /// Live objects in the arena.
    pub fn live(&self) -> usize {
        self.live
    }

    // ---- allocation ----

    fn alloc(&mut self, obj: Obj, roots: &[Word]) -> Word {
        if self.live >= self.threshold {
            self.collect(roots);
        }
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[slot] = Some(HeapSlot { mark: false, obj });
        self.live += 1;
        word::handle(slot)
    }

    /// Allocate a string object holding a copy of `bytes`.
    pub fn alloc_string(&mut self, bytes: &[u8], roots: &[Word]) -> Word {
        self.alloc(Obj::Str(bytes.to_vec()), roots)
    }

    /// Allocate an array of `len` cells, each a boxed zero.
    pub fn alloc_array(&mut self, len: usize, roots: &[Word]) -> Word {
        self.alloc(Obj::Array(vec![word::box_int(0); len]), roots)
    }

    /// Allocate an S-expression with `len` boxed-zero fields.
    pub fn alloc_sexp(&mut self, tag: i32, len: usize, roots: &[Word]) -> Word {
        self.alloc(
            Obj::Sexp {
                tag,
                fields: vec![word::box_int(0); len],
            },
            roots,
        )
    }

    /// Allocate a closure with `len` boxed-zero capture cells.
    pub fn alloc_closure(&mut self, entry: u32, len: usize, roots: &[Word]) -> Word {
        self.alloc(
            Obj::Closure {
                entry,
                captures: vec![word::box_int(0); len],
            },
            roots,
        )
    }

    // ---- object access ----

    fn slot_of(&self, w: Word) -> Result<usize, HeapError> {
        word::handle_slot(w)
            .filter(|&slot| matches!(self.slots.get(slot), Some(Some(_))))
            .ok_or(HeapError::InvalidHandle)
    }

    fn obj(&self, w: Word) -> Result<&Obj, HeapError> {
        let slot = self.slot_of(w)?;
        Ok(&self.slots[slot].as_ref().expect("slot is live").obj)
    }

    fn obj_mut(&mut self, w: Word) -> Result<&mut Obj, HeapError> {
        let slot = self.slot_of(w)?;
        Ok(&mut self.slots[slot].as_mut().expect("slot is live").obj)
    }

    /// Indexed read. The index arrives boxed and is unboxed here.
    pub fn elem(&self, p: Word, i: Word) -> Result<Word, HeapError> {
        let index = word::unbox_int(i);
        let (word_at, len) = match self.obj(p)? {
            Obj::Str(bytes) => (
                usize::try_from(index)
                    .ok()
                    .and_then(|i| bytes.get(i))
                    .map(|&b| word::box_int(b as i32)),
                bytes.len(),
            ),
            Obj::Array(cells) => (
                usize::try_from(index).ok().and_then(|i| cells.get(i)).copied(),
                cells.len(),
            ),
            Obj::Sexp { fields, .. } => (
                usize::try_from(index).ok().and_then(|i| fields.get(i)).copied(),
                fields.len(),
            ),
            Obj::Closure { .. } => {
                return Err(HeapError::WrongKind {
                    expected: "an indexable value",
                })
            }
        };
        word_at.ok_or(HeapError::OutOfBounds { index, len })
    }

    /// Indexed write; returns the stored value. The index arrives boxed.
    pub fn store_at(&mut self, v: Word, i: Word, x: Word) -> Result<Word, HeapError> {
        let index = word::unbox_int(i);
        match self.obj_mut(x)? {
            Obj::Str(bytes) => {
                let len = bytes.len();
                let cell = usize::try_from(index)
                    .ok()
                    .and_then(|i| bytes.get_mut(i))
                    .ok_or(HeapError::OutOfBounds { index, len })?;
                *cell = word::unbox_int(v) as u8;
            }
            Obj::Array(cells) => {
                let len = cells.len();
                let cell = usize::try_from(index)
                    .ok()
                    .and_then(|i| cells.get_mut(i))
                    .ok_or(HeapError::OutOfBounds { index, len })?;
                *cell = v;
            }
            Obj::Sexp { fields, .. } => {
                let len = fields.len();
                let cell = usize::try_from(index)
                    .ok()
                    .and_then(|i| fields.get_mut(i))
                    .ok_or(HeapError::OutOfBounds { index, len })?;
                *cell = v;
            }
            Obj::Closure { .. } => {
                return Err(HeapError::WrongKind {
                    expected: "an indexable value",
                })
            }
        }
        Ok(v)
    }

    /// Write one cell of a freshly built array or S-expression.
    pub fn set_element(&mut self, w: Word, index: usize, v: Word) -> Result<(), HeapError> {
        match self.obj_mut(w)? {
            Obj::Array(cells) => {
                let len = cells.len();
                *cells.get_mut(index).ok_or(HeapError::OutOfBounds {
                    index: index as i32,
                    len,
                })? = v;
                Ok(())
            }
            Obj::Sexp { fields, .. } => {
                let len = fields.len();
                *fields.get_mut(index).ok_or(HeapError::OutOfBounds {
                    index: index as i32,
                    len,
                })? = v;
                Ok(())
            }
            _ => Err(HeapError::WrongKind {
                expected: "an array or S-expression",
            }),
        }
    }

    /// Number of characters or cells.
    pub fn length(&self, p: Word) -> Result<usize, HeapError> {
        match self.obj(p)? {
            Obj::Str(bytes) => Ok(bytes.len()),
            Obj::Array(cells) => Ok(cells.len()),
            Obj::Sexp { fields, .. } => Ok(fields.len()),
            Obj::Closure { .. } => Err(HeapError::WrongKind {
                expected: "a string, array, or S-expression",
            }),
        }
    }

    /// The bytecode entry offset stored in a closure's first cell.
    pub fn closure_entry(&self, w: Word) -> Result<u32, HeapError> {
        match self.obj(w)? {
            Obj::Closure { entry, .. } => Ok(*entry),
            _ => Err(HeapError::WrongKind {
                expected: "a closure",
            }),
        }
    }

    /// Read a capture cell.
    pub fn capture(&self, w: Word, cell: usize) -> Result<Word, HeapError> {
        match self.obj(w)? {
            Obj::Closure { captures, .. } => captures
                .get(cell)
                .copied()
                .ok_or(HeapError::BadCapture {
                    cell,
                    len: captures.len(),
                }),
            _ => Err(HeapError::WrongKind {
                expected: "a closure",
            }),
        }
    }

    /// Write a capture cell.
    pub fn set_capture(&mut self, w: Word, cell: usize, v: Word) -> Result<(), HeapError> {
        match self.obj_mut(w)? {
            Obj::Closure { captures, .. } => {
                let len = captures.len();
                *captures
                    .get_mut(cell)
                    .ok_or(HeapError::BadCapture { cell, len })? = v;
                Ok(())
            }
            _ => Err(HeapError::WrongKind {
                expected: "a closure",
            }),
        }
    }

    // ---- tag hashing ----

    /// Hash a constructor tag name. Stable across runs: equal names hash
    /// equal, and the result always fits a boxed integer. The name is
    /// remembered so S-expressions can be rendered with it.
    pub fn tag_hash(&mut self, name: &[u8]) -> i32 {
        let mut h: u32 = 0;
        for &b in name {
            h = h.wrapping_mul(31).wrapping_add(b as u32) & Self::TAG_HASH_MASK;
        }
        let hash = h as i32;
        self.tag_names.entry(hash).or_insert_with(|| name.to_vec());
        hash
    }

    // ---- pattern predicates ----

    pub fn is_string(&self, w: Word) -> bool {
        matches!(self.obj(w), Ok(Obj::Str(_)))
    }

    pub fn is_array(&self, w: Word) -> bool {
        matches!(self.obj(w), Ok(Obj::Array(_)))
    }

    pub fn is_sexp(&self, w: Word) -> bool {
        matches!(self.obj(w), Ok(Obj::Sexp { .. }))
    }

    pub fn is_closure(&self, w: Word) -> bool {
        matches!(self.obj(w), Ok(Obj::Closure { .. }))
    }

    /// Content equality of two string objects; false when either word is
    /// not a string.
    pub fn string_eq(&self, a: Word, b: Word) -> bool {
        match (self.obj(a), self.obj(b)) {
            (Ok(Obj::Str(x)), Ok(Obj::Str(y))) => x == y,
            _ => false,
        }
    }

    /// Does `w` hold an S-expression with this tag hash and arity?
    pub fn check_tag(&self, w: Word, hash: i32, arity: usize) -> bool {
        matches!(
            self.obj(w),
            Ok(Obj::Sexp { tag, fields }) if *tag == hash && fields.len() == arity
        )
    }

    /// Is `w` an array of exactly `len` cells?
    pub fn check_array_shape(&self, w: Word, len: usize) -> bool {
        matches!(self.obj(w), Ok(Obj::Array(cells)) if cells.len() == len)
    }

    // ---- rendering ----

    /// Display conversion for any word, in source syntax: integers in
    /// decimal, strings verbatim, arrays bracketed, S-expressions by tag.
    pub fn render(&self, w: Word) -> String {
        self.render_depth(w, 0)
    }

    fn render_depth(&self, w: Word, depth: usize) -> String {
        if depth > 32 {
            return "...".to_string();
        }
        if word::is_unboxed(w) {
            return word::unbox_int(w).to_string();
        }
        match self.obj(w) {
            Ok(Obj::Str(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
            Ok(Obj::Array(cells)) => {
                let inner: Vec<String> = cells
                    .iter()
                    .map(|&c| self.render_depth(c, depth + 1))
                    .collect();
                format!("[{}]", inner.join(", "))
            }
            Ok(Obj::Sexp { tag, fields }) => {
                let name = match self.tag_names.get(tag) {
                    Some(name) => String::from_utf8_lossy(name).into_owned(),
                    None => format!("#{tag}"),
                };
                if fields.is_empty() {
                    name
                } else {
                    let inner: Vec<String> = fields
                        .iter()
                        .map(|&f| self.render_depth(f, depth + 1))
                        .collect();
                    format!("{name} ({})", inner.join(", "))
                }
            }
            Ok(Obj::Closure { entry, .. }) => format!("<closure {entry:#x}>"),
            Err(_) => format!("<invalid {w:#x}>"),
        }
    }

    // ---- collection ----

    /// Mark everything reachable from `roots`, then sweep the rest.
    pub fn collect(&mut self, roots: &[Word]) {
        let mut worklist = Vec::new();
        for &w in roots {
            self.mark_word(w, &mut worklist);
        }
        while let Some(slot) = worklist.pop() {
            // Children are copied out so marking can borrow the arena.
            let children: Vec<Word> = match &self.slots[slot].as_ref().expect("marked slot").obj {
                Obj::Str(_) => Vec::new(),
                Obj::Array(cells) => cells.clone(),
                Obj::Sexp { fields, .. } => fields.clone(),
                Obj::Closure { captures, .. } => captures.clone(),
            };
            for w in children {
                self.mark_word(w, &mut worklist);
            }
        }

        let mut collected = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(live) if live.mark => live.mark = false,
                Some(_) => {
                    *slot = None;
                    self.free.push(index);
                    self.live -= 1;
                    collected += 1;
                }
                None => {}
            }
        }
        self.threshold = (self.live * 2).max(Self::INITIAL_THRESHOLD);
        self.collections += 1;
        tracing::debug!(
            target: "lamarun::heap",
            collected,
            live = self.live,
            threshold = self.threshold,
            "collection finished"
        );
    }

    /// Mark the object a root word designates, if any. A capture-cell
    /// reference keeps its closure alive; everything else that is not a
    /// live handle is skipped.
    fn mark_word(&mut self, w: Word, worklist: &mut Vec<usize>) {
        let slot = match word::handle_slot(w) {
            Some(slot) => Some(slot),
            None => match word::decode_ref(w) {
                Some(word::Ref::Capture { closure, .. }) => Some(closure),
                _ => None,
            },
        };
        let Some(slot) = slot else { return };
        if let Some(Some(live)) = self.slots.get_mut(slot) {
            if !live.mark {
                live.mark = true;
                worklist.push(slot);
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
