//! Object heap
//!
//! Every heap value lives in one arena slot addressed by [`ObjRef`]. Live
//! objects are threaded onto an intrusive doubly-linked list (by slot index)
//! that the sweeper walks; each allocation records its byte footprint in a
//! running heap-size counter, and crossing the collection threshold raises
//! the `collect pending` flag polled at VM safepoints.

use crate::bytecode::CodeChunk;
use crate::context::Context;
use crate::error::SableError;
use crate::table::ValueMap;
use crate::value::Value;
use std::any::Any;
use std::sync::Arc;

/// Index of an object's arena slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub u32);

/// GC color. White objects are sweep candidates; grey objects are reachable
/// and queued for scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    /// Candidate for sweep
    White,
    /// Reachable, scan pending or done
    Grey,
}

/// Host-implemented callable installed through the FFI
pub type Syscall =
    Arc<dyn Fn(&mut Context, &[Value]) -> Result<Value, SableError> + Send + Sync>;

/// What flavor of code a function object runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnKind {
    /// An ordinary function or lambda
    Script,
    /// A class; calling it builds an instance
    Class,
    /// A map initializer; calling it builds a map
    MapInit,
}

/// Compile-time local descriptor
#[derive(Debug, Clone)]
pub struct LocalVar {
    /// Fully qualified name
    pub name: String,
    /// Frame-relative stack slot (slot 0 is the callee)
    pub slot: usize,
    /// Set when a closure captures this local
    pub captured: bool,
}

/// Compile-time upvalue descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvarDesc {
    /// Enclosing frame slot (`from_local`) or enclosing-closure upvalue index
    pub index: usize,
    /// Which of the two the index addresses
    pub from_local: bool,
}

/// A compiled function
#[derive(Debug)]
pub struct Function {
    /// Flavor
    pub kind: FnKind,
    /// Declared parameter count
    pub arity: usize,
    /// Interned fully qualified name
    pub name: ObjRef,
    /// Interned short name (the part after the last `::`)
    pub short_name: ObjRef,
    /// The function's code object; filled in when compilation finalizes
    pub code: Option<ObjRef>,
    /// Locals table
    pub locals: Vec<LocalVar>,
    /// Upvalue descriptor table
    pub upvars: Vec<UpvarDesc>,
    /// Offset of this function's `CONST` load in the enclosing function's
    /// code, rewritten to `CLOSURE` if upvalues are discovered
    pub patch_point: Option<usize>,
    /// Whether the function is exported into its receiver's member map when
    /// constructed inside a class body
    pub is_api: bool,
}

/// A captured variable: aliases a stack slot while open, owns its value once
/// closed
#[derive(Debug, Clone, Copy)]
pub enum Upvalue {
    /// Aliases an absolute value-stack slot
    Open {
        /// Absolute stack position
        pos: usize,
    },
    /// Owns its value
    Closed {
        /// The captured value
        value: Value,
    },
}

/// The object variants
pub enum ObjData {
    /// Interned UTF-8 text
    Str {
        /// The text
        text: String,
        /// FNV-1a hash of the text
        hash: u64,
    },
    /// Bytecode plus its offset→span map
    Code(Arc<CodeChunk>),
    /// A compiled function, class, or map initializer
    Function(Function),
    /// A function bound to its captured upvalues
    Closure {
        /// The function
        function: ObjRef,
        /// Resolved upvalue objects, parallel to the function's descriptors
        upvalues: Vec<ObjRef>,
    },
    /// A bare map
    Map(ValueMap),
    /// A constructed object: fields, class, optional super-instance
    Instance {
        /// Field map (also holds `api` methods)
        map: ValueMap,
        /// The class this instance was built from
        class: ObjRef,
        /// Parent instance wired by `SUPER`
        super_obj: Option<ObjRef>,
    },
    /// A captured variable
    Upvalue(Upvalue),
    /// Host callable
    Syscall {
        /// Interned name
        name: ObjRef,
        /// The host function
        f: Syscall,
    },
    /// Opaque host pointer
    Boxed(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for ObjData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjData::Str { text, .. } => f.debug_tuple("Str").field(text).finish(),
            ObjData::Code(_) => f.write_str("Code"),
            ObjData::Function(fun) => f.debug_tuple("Function").field(&fun.kind).finish(),
            ObjData::Closure { function, .. } => {
                f.debug_tuple("Closure").field(function).finish()
            }
            ObjData::Map(m) => f.debug_tuple("Map").field(&m.len()).finish(),
            ObjData::Instance { class, .. } => f.debug_tuple("Instance").field(class).finish(),
            ObjData::Upvalue(u) => f.debug_tuple("Upvalue").field(u).finish(),
            ObjData::Syscall { name, .. } => f.debug_tuple("Syscall").field(name).finish(),
            ObjData::Boxed(_) => f.write_str("Boxed"),
        }
    }
}

/// Per-object header: identity, GC mark, intrusive list links, footprint
#[derive(Debug)]
pub struct ObjHeader {
    /// Monotonic object id
    pub oid: u64,
    /// GC color
    pub mark: Mark,
    prev: Option<ObjRef>,
    next: Option<ObjRef>,
    footprint: usize,
}

struct ObjCell {
    header: ObjHeader,
    data: ObjData,
}

/// The arena of all live objects
///
/// `Debug` summarizes rather than dumping the graph.
pub struct Heap {
    slots: Vec<Option<ObjCell>>,
    free: Vec<u32>,
    head: Option<ObjRef>,
    next_oid: u64,
    /// Running byte footprint of live objects
    heap_size: usize,
    /// Collection trigger; reset to `2 × heap_size` after each collection
    threshold: usize,
    /// Raised when `heap_size` crosses the threshold; polled at safepoints
    pub collect_pending: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("slots", &self.slots.len())
            .field("heap_size", &self.heap_size)
            .field("threshold", &self.threshold)
            .field("collect_pending", &self.collect_pending)
            .finish()
    }
}

impl Heap {
    /// Create an empty heap. The initial threshold of zero makes the first
    /// allocation request a collection at the next safepoint.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            next_oid: 0,
            heap_size: 0,
            threshold: 0,
            collect_pending: false,
        }
    }

    fn footprint_of(data: &ObjData) -> usize {
        let payload = match data {
            ObjData::Str { text, .. } => text.capacity(),
            ObjData::Code(chunk) => chunk.bytes.len() + chunk.spans.len() * 24,
            ObjData::Function(f) => {
                f.locals.capacity() * std::mem::size_of::<LocalVar>()
                    + f.upvars.capacity() * std::mem::size_of::<UpvarDesc>()
            }
            ObjData::Closure { upvalues, .. } => upvalues.capacity() * 4,
            ObjData::Map(m) => m.capacity() * 16,
            ObjData::Instance { map, .. } => map.capacity() * 16,
            ObjData::Upvalue(_) => 0,
            ObjData::Syscall { .. } => 0,
            ObjData::Boxed(_) => 0,
        };
        std::mem::size_of::<ObjCell>() + payload
    }

    /// Allocate an object, linking it into the live list and charging its
    /// footprint against the collection threshold
    pub fn alloc(&mut self, data: ObjData) -> ObjRef {
        let footprint = Self::footprint_of(&data);
        let cell = ObjCell {
            header: ObjHeader {
                oid: self.next_oid,
                mark: Mark::White,
                prev: None,
                next: self.head,
                footprint,
            },
            data,
        };
        self.next_oid += 1;

        let r = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(cell);
                ObjRef(idx)
            }
            None => {
                self.slots.push(Some(cell));
                ObjRef((self.slots.len() - 1) as u32)
            }
        };

        if let Some(old_head) = self.head {
            self.header_mut(old_head).prev = Some(r);
        }
        self.head = Some(r);

        self.heap_size += footprint;
        if self.heap_size > self.threshold {
            self.collect_pending = true;
        }

        r
    }

    /// Unlink and free an object, refunding its footprint
    pub fn free(&mut self, r: ObjRef) {
        let (prev, next, footprint) = {
            let header = self.header(r);
            (header.prev, header.next, header.footprint)
        };
        if let Some(p) = prev {
            self.header_mut(p).next = next;
        }
        if let Some(n) = next {
            self.header_mut(n).prev = prev;
        }
        if self.head == Some(r) {
            self.head = next;
        }
        self.slots[r.0 as usize] = None;
        self.free.push(r.0);
        self.heap_size -= footprint;
    }

    /// Reset the threshold after a collection and lower the pending flag
    pub fn finish_collection(&mut self) {
        self.threshold = self.heap_size * 2;
        self.collect_pending = false;
    }

    /// Current live byte footprint
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// First object on the live list (most recently allocated)
    pub fn live_head(&self) -> Option<ObjRef> {
        self.head
    }

    /// Successor on the live list
    pub fn live_next(&self, r: ObjRef) -> Option<ObjRef> {
        self.header(r).next
    }

    /// Number of live objects (walks the list; test/debug use)
    pub fn live_count(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.head;
        while let Some(r) = cursor {
            n += 1;
            cursor = self.live_next(r);
        }
        n
    }

    /// Borrow an object's header
    pub fn header(&self, r: ObjRef) -> &ObjHeader {
        match &self.slots[r.0 as usize] {
            Some(cell) => &cell.header,
            None => unreachable!("dangling object reference {:?}", r),
        }
    }

    /// Mutably borrow an object's header
    pub fn header_mut(&mut self, r: ObjRef) -> &mut ObjHeader {
        match &mut self.slots[r.0 as usize] {
            Some(cell) => &mut cell.header,
            None => unreachable!("dangling object reference {:?}", r),
        }
    }

    /// Borrow an object's data
    pub fn get(&self, r: ObjRef) -> &ObjData {
        match &self.slots[r.0 as usize] {
            Some(cell) => &cell.data,
            None => unreachable!("dangling object reference {:?}", r),
        }
    }

    /// Mutably borrow an object's data
    pub fn get_mut(&mut self, r: ObjRef) -> &mut ObjData {
        match &mut self.slots[r.0 as usize] {
            Some(cell) => &mut cell.data,
            None => unreachable!("dangling object reference {:?}", r),
        }
    }

    /// Hash used for map keys: interned strings hash by text, everything
    /// else by object id
    pub fn hash_of(&self, r: ObjRef) -> u64 {
        match self.get(r) {
            ObjData::Str { hash, .. } => *hash,
            _ => self.header(r).oid,
        }
    }

    // ── typed accessors ──────────────────────────────────────────────────────

    /// String text, if the object is a string
    pub fn as_str(&self, r: ObjRef) -> Option<&str> {
        match self.get(r) {
            ObjData::Str { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Function view, if the object is a function/class/map-init
    pub fn as_function(&self, r: ObjRef) -> Option<&Function> {
        match self.get(r) {
            ObjData::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Mutable function view
    pub fn as_function_mut(&mut self, r: ObjRef) -> Option<&mut Function> {
        match self.get_mut(r) {
            ObjData::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Upvalue view, if the object is one
    pub fn as_upvalue(&self, r: ObjRef) -> Option<&Upvalue> {
        match self.get(r) {
            ObjData::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    /// A short noun for diagnostics
    pub fn kind_name(&self, r: ObjRef) -> &'static str {
        match self.get(r) {
            ObjData::Str { .. } => "string",
            ObjData::Code(_) => "code",
            ObjData::Function(f) => match f.kind {
                FnKind::Script => "function",
                FnKind::Class => "object",
                FnKind::MapInit => "map initializer",
            },
            ObjData::Closure { .. } => "closure",
            ObjData::Map(_) => "map",
            ObjData::Instance { .. } => "instance",
            ObjData::Upvalue(_) => "upvalue",
            ObjData::Syscall { .. } => "syscall",
            ObjData::Boxed(_) => "box",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_links_live_list() {
        let mut heap = Heap::new();
        let a = heap.alloc(ObjData::Map(ValueMap::new()));
        let b = heap.alloc(ObjData::Map(ValueMap::new()));
        assert_eq!(heap.live_head(), Some(b));
        assert_eq!(heap.live_next(b), Some(a));
        assert_eq!(heap.live_next(a), None);
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn test_free_unlinks_and_refunds() {
        let mut heap = Heap::new();
        let a = heap.alloc(ObjData::Map(ValueMap::new()));
        let b = heap.alloc(ObjData::Map(ValueMap::new()));
        let c = heap.alloc(ObjData::Map(ValueMap::new()));
        let size_before = heap.heap_size();
        heap.free(b);
        assert!(heap.heap_size() < size_before);
        assert_eq!(heap.live_head(), Some(c));
        assert_eq!(heap.live_next(c), Some(a));
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn test_free_all_zeroes_counter() {
        let mut heap = Heap::new();
        let a = heap.alloc(ObjData::Map(ValueMap::new()));
        let b = heap.alloc(ObjData::Map(ValueMap::new()));
        heap.free(a);
        heap.free(b);
        assert_eq!(heap.heap_size(), 0);
        assert_eq!(heap.live_head(), None);
    }

    #[test]
    fn test_first_alloc_requests_collection() {
        let mut heap = Heap::new();
        assert!(!heap.collect_pending);
        heap.alloc(ObjData::Map(ValueMap::new()));
        assert!(heap.collect_pending);
        heap.finish_collection();
        assert!(!heap.collect_pending);
        assert_eq!(heap.threshold, heap.heap_size() * 2);
    }

    #[test]
    fn test_slot_reuse_keeps_fresh_oid() {
        let mut heap = Heap::new();
        let a = heap.alloc(ObjData::Map(ValueMap::new()));
        let oid_a = heap.header(a).oid;
        heap.free(a);
        let b = heap.alloc(ObjData::Map(ValueMap::new()));
        assert_eq!(a, b); // slot reused
        assert_ne!(heap.header(b).oid, oid_a);
    }
}
