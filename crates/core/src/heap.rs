//! Slab Heap
//!
//! Fixed-size object slots packed into pages, threaded through an
//! intrusive free-span list, with reference counting and a cycle-detecting
//! sweep.
//!
//! ## Page Layout
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┬─────────────┐
//! │ sentinel │  slot 1  │  slot 2  │   ...    │  slot 1599  │
//! │ (slot 0) │          │          │          │             │
//! └──────────┴──────────┴──────────┴──────────┴─────────────┘
//!
//! - slot 0 is a permanently-reserved sentinel with a non-null type_id,
//!   so probing the slot to the left of any object is always safe
//! - free slots form spans: the first slot of a span holds {len, next},
//!   the last slot holds a back-pointer to the first
//! ```
//!
//! ## Free-list Protocol
//!
//! Allocation pops one slot off the head span (splitting the span when it
//! is longer than one). Freeing probes the left neighbour: if it is free,
//! the object extends that span in place (O(1) coalescing, no relinking);
//! otherwise the object becomes a fresh single-slot span pushed onto the
//! list head.
//!
//! Pages never move or shrink during a VM lifetime; live pointers stay
//! valid until `deinit`.
//!
//! ## Cycles
//!
//! Reference counting cannot reclaim cycles. `check_memory` is a
//! debugging sweep, not a scheduled collector: user programs that build
//! mutually-capturing closures or self-referencing containers must break
//! the cycle manually (for example by clearing a back-reference before
//! dropping the last handle).

use std::alloc::{alloc, dealloc, Layout};
use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::memory_stats::MemoryCounters;
use crate::object::{
    free_capture_spill, free_str_buffer, FreeSpan, HeapObject, NULL_ID, SENTINEL_ID, TYPE_CLOSURE,
    TYPE_LAMBDA, TYPE_LIST, TYPE_MAP, TYPE_STRING,
};
use crate::value::Value;

/// Slots per page: ~62 KiB of object memory at 40 B/slot
pub const PAGE_SIZE: usize = 1600;

// Pin applied to cycle members so cascading releases during the sweep can
// never destruct a member mid-walk.
const RC_PIN: u32 = u32::MAX / 2;

/// The slab heap: pages, free list, counters
pub struct Heap {
    pages: Vec<*mut HeapObject>,
    free_head: *mut HeapObject,
    pub counters: MemoryCounters,
}

impl Heap {
    /// Create a heap with its first page allocated
    pub fn new() -> Self {
        let mut heap = Heap {
            pages: Vec::new(),
            free_head: std::ptr::null_mut(),
            counters: MemoryCounters::default(),
        };
        if !heap.grow_pages(1) {
            panic!("failed to allocate initial heap page");
        }
        heap
    }

    fn page_layout() -> Layout {
        Layout::array::<HeapObject>(PAGE_SIZE).expect("page layout overflow")
    }

    /// Allocate `n` fresh pages and link their initial spans onto the free
    /// list. Returns false if the allocator refused.
    fn grow_pages(&mut self, n: usize) -> bool {
        for _ in 0..n {
            let page = unsafe { alloc(Self::page_layout()) as *mut HeapObject };
            if page.is_null() {
                return false;
            }
            unsafe {
                // Reserved sentinel: never allocated, never freed
                (*page).head = crate::object::ObjHead {
                    type_id: SENTINEL_ID,
                    rc: 1,
                };
                // Every other slot starts free; only the header and tail
                // of the span carry meaningful span fields, but all free
                // slots must read as NULL_ID
                for i in 1..PAGE_SIZE {
                    (*page.add(i)).head = crate::object::ObjHead {
                        type_id: NULL_ID,
                        rc: 0,
                    };
                }
                let span_start = page.add(1);
                (*span_start).free_span = FreeSpan {
                    type_id: NULL_ID,
                    len: (PAGE_SIZE - 1) as u32,
                    start: span_start,
                    next: self.free_head,
                };
                (*page.add(PAGE_SIZE - 1)).free_span.start = span_start;
                self.free_head = span_start;
            }
            self.pages.push(page);
            self.counters.pages_allocated += 1;
        }
        debug!(pages = self.pages.len(), "heap grew");
        true
    }

    /// Number of pages currently allocated
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Hand out one uninitialized slot. The caller must write the full
    /// payload including `type_id` and `rc = 1` before the next heap
    /// operation. Returns None when the host allocator is exhausted.
    pub fn alloc_object(&mut self) -> Option<*mut HeapObject> {
        if self.free_head.is_null() {
            // Grow by max(1, ceil(pages * 1.5)) new pages
            let add = std::cmp::max(1, (self.pages.len() * 3 + 1) / 2);
            if !self.grow_pages(add) {
                return None;
            }
        }
        let head = self.free_head;
        unsafe {
            let span = (*head).free_span;
            if span.len == 1 {
                self.free_head = span.next;
            } else {
                // Split: the remainder span starts one slot later
                let new_head = head.add(1);
                (*new_head).free_span = FreeSpan {
                    type_id: NULL_ID,
                    len: span.len - 1,
                    start: new_head,
                    next: span.next,
                };
                let tail = head.add(span.len as usize - 1);
                if tail != new_head {
                    (*tail).free_span.start = new_head;
                }
                self.free_head = new_head;
            }
        }
        self.counters.objects_allocated += 1;
        Some(head)
    }

    /// Return a slot to the free pool, merging with the span on its left
    /// when present.
    ///
    /// # Safety
    /// `obj` must be a live slot previously returned by `alloc_object`
    /// whose owned buffers have already been freed.
    pub unsafe fn free_object(&mut self, obj: *mut HeapObject) {
        self.counters.objects_freed += 1;
        unsafe {
            let left = obj.sub(1);
            if (*left).is_free() {
                // The left neighbour is the tail of an already-linked
                // span: extend it in place. No relinking needed.
                let start = (*left).free_span.start;
                (*start).free_span.len += 1;
                (*obj).free_span.type_id = NULL_ID;
                (*obj).free_span.start = start;
            } else {
                (*obj).free_span = FreeSpan {
                    type_id: NULL_ID,
                    len: 1,
                    start: obj,
                    next: self.free_head,
                };
                self.free_head = obj;
            }
        }
    }

    // =========================================================================
    // Reference counting
    // =========================================================================

    /// Bump the refcount of a pointer value; no-op for primitives
    #[inline]
    pub fn retain(&mut self, v: Value) {
        if v.is_pointer() {
            unsafe {
                (*v.as_ptr()).head.rc += 1;
            }
            self.counters.num_retains += 1;
        }
    }

    /// Account for the initial reference written at object construction
    #[inline]
    pub fn note_initial_ref(&mut self) {
        self.counters.num_retains += 1;
    }

    /// Drop one reference; at zero, destruct recursively and free the slot
    #[inline]
    pub fn release(&mut self, v: Value) {
        if !v.is_pointer() {
            return;
        }
        self.counters.num_releases += 1;
        unsafe {
            let obj = v.as_ptr();
            debug_assert!((*obj).rc() >= 1, "release on dead object");
            (*obj).head.rc -= 1;
            if (*obj).head.rc == 0 {
                self.destruct(obj);
            }
        }
    }

    /// Kind-specific destructor: release children, free owned buffers,
    /// return the slot.
    unsafe fn destruct(&mut self, obj: *mut HeapObject) {
        unsafe {
            match (*obj).type_id() {
                TYPE_LIST => {
                    let vec = (*obj).list.take_vec();
                    for v in vec.iter().copied() {
                        self.release(v);
                    }
                    drop(vec);
                }
                TYPE_MAP => {
                    let table = Box::from_raw((*obj).map.entries);
                    for (_, v) in table.entries() {
                        self.release(v);
                    }
                    drop(table);
                }
                TYPE_STRING => {
                    let s = (*obj).string;
                    free_str_buffer(s.ptr, s.len as usize);
                }
                TYPE_LAMBDA => {}
                TYPE_CLOSURE => {
                    let c = (*obj).closure;
                    let n = usize::from(c.num_captured);
                    for v in c.captures().iter().copied() {
                        self.release(v);
                    }
                    if c.is_spilled() {
                        free_capture_spill(c.spill_ptr(), n);
                    }
                }
                // SmallObject: unused fields are None, so all four are safe
                _ => {
                    let fields = (*obj).small.fields;
                    for v in fields {
                        self.release(v);
                    }
                }
            }
            self.free_object(obj);
        }
    }

    // =========================================================================
    // Cycle detector
    // =========================================================================

    /// Pointer-valued children of a live object, as Values
    unsafe fn child_values(obj: *mut HeapObject) -> Vec<Value> {
        unsafe {
            let vals: Vec<Value> = match (*obj).type_id() {
                TYPE_LIST => (*obj).list.elems().to_vec(),
                TYPE_MAP => (*obj).map.table().entries().map(|(_, v)| v).collect(),
                TYPE_STRING | TYPE_LAMBDA => Vec::new(),
                TYPE_CLOSURE => (*obj).closure.captures().to_vec(),
                _ => (*obj).small.fields.to_vec(),
            };
            vals.into_iter().filter(|v| v.is_pointer()).collect()
        }
    }

    /// Walk all live objects looking for reference cycles. Cycle members
    /// are force-freed. Returns true iff no cycle was found.
    pub fn check_memory(&mut self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Entered,
            Visited,
        }

        let mut marks: HashMap<*mut HeapObject, Mark> = HashMap::new();
        let mut members: HashSet<*mut HeapObject> = HashSet::new();

        let roots: Vec<*mut HeapObject> = self.live_slots();
        for root in roots {
            if marks.contains_key(&root) {
                continue;
            }
            // Iterative DFS; the walk stack doubles as the current path so
            // cycle members can be extracted on a back-edge.
            let mut stack: Vec<(*mut HeapObject, Vec<*mut HeapObject>, usize)> = Vec::new();
            let children: Vec<*mut HeapObject> = unsafe {
                Self::child_values(root)
                    .into_iter()
                    .map(|v| v.as_ptr())
                    .collect()
            };
            marks.insert(root, Mark::Entered);
            stack.push((root, children, 0));

            while !stack.is_empty() {
                let next_child = {
                    let (node, children, idx) = stack.last_mut().expect("stack is non-empty");
                    if *idx >= children.len() {
                        marks.insert(*node, Mark::Visited);
                        None
                    } else {
                        let child = children[*idx];
                        *idx += 1;
                        Some(child)
                    }
                };
                let Some(child) = next_child else {
                    stack.pop();
                    continue;
                };
                match marks.get(&child).copied() {
                    Some(Mark::Entered) => {
                        // Back-edge: everything on the path from `child`
                        // to the top of the stack is a cycle member
                        let pos = stack
                            .iter()
                            .position(|(n, _, _)| *n == child)
                            .expect("entered node is on the walk stack");
                        for (n, _, _) in &stack[pos..] {
                            members.insert(*n);
                        }
                    }
                    Some(Mark::Visited) => {}
                    None => {
                        let grandchildren: Vec<*mut HeapObject> = unsafe {
                            Self::child_values(child)
                                .into_iter()
                                .map(|v| v.as_ptr())
                                .collect()
                        };
                        marks.insert(child, Mark::Entered);
                        stack.push((child, grandchildren, 0));
                    }
                }
            }
        }

        if members.is_empty() {
            return true;
        }
        warn!(members = members.len(), "reference cycle detected, force-freeing");

        unsafe {
            // Pin members so cascading releases can't destruct one mid-sweep
            for &m in &members {
                (*m).head.rc = RC_PIN;
            }
            // Release references that leave the cycle
            for &m in &members {
                for v in Self::child_values(m) {
                    if !members.contains(&v.as_ptr()) {
                        self.release(v);
                    }
                }
            }
            // Free buffers and slots without touching member refcounts
            for &m in &members {
                self.force_free(m);
                self.counters.cycle_roots_freed += 1;
            }
        }
        false
    }

    /// Free an object's owned buffers and its slot without releasing
    /// children (cycle-sweep path).
    unsafe fn force_free(&mut self, obj: *mut HeapObject) {
        unsafe {
            match (*obj).type_id() {
                TYPE_LIST => drop((*obj).list.take_vec()),
                TYPE_MAP => drop(Box::from_raw((*obj).map.entries)),
                TYPE_STRING => {
                    let s = (*obj).string;
                    free_str_buffer(s.ptr, s.len as usize);
                }
                TYPE_CLOSURE => {
                    let c = (*obj).closure;
                    if c.is_spilled() {
                        free_capture_spill(c.spill_ptr(), usize::from(c.num_captured));
                    }
                }
                _ => {}
            }
            self.free_object(obj);
        }
    }

    // =========================================================================
    // Introspection (tests + report)
    // =========================================================================

    /// All live slots (not free, not the page sentinel)
    fn live_slots(&self) -> Vec<*mut HeapObject> {
        let mut out = Vec::new();
        for &page in &self.pages {
            for i in 1..PAGE_SIZE {
                let slot = unsafe { page.add(i) };
                if unsafe { !(*slot).is_free() } {
                    out.push(slot);
                }
            }
        }
        out
    }

    /// Count of live objects across all pages
    pub fn live_object_count(&self) -> usize {
        self.live_slots().len()
    }

    /// Number of spans on the free list. Walks `next` pointers; the list
    /// is loop-free by construction, so this terminates.
    pub fn free_span_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free_head;
        while !cur.is_null() {
            n += 1;
            cur = unsafe { (*cur).free_span.next };
        }
        n
    }

    /// Total free slots reachable from the free list
    pub fn free_slot_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free_head;
        while !cur.is_null() {
            unsafe {
                n += (*cur).free_span.len as usize;
                cur = (*cur).free_span.next;
            }
        }
        n
    }

    /// Free all pages unconditionally. Owned buffers of still-live objects
    /// are freed first; their refcounts are ignored (leak detection is the
    /// cycle-check's job).
    pub fn deinit(&mut self) {
        for slot in self.live_slots() {
            unsafe {
                // force_free would return the slot to the free list; here
                // the whole page is going away, so only buffers matter
                match (*slot).type_id() {
                    TYPE_LIST => drop((*slot).list.take_vec()),
                    TYPE_MAP => drop(Box::from_raw((*slot).map.entries)),
                    TYPE_STRING => {
                        let s = (*slot).string;
                        free_str_buffer(s.ptr, s.len as usize);
                    }
                    TYPE_CLOSURE => {
                        let c = (*slot).closure;
                        if c.is_spilled() {
                            free_capture_spill(c.spill_ptr(), usize::from(c.num_captured));
                        }
                    }
                    _ => {}
                }
            }
        }
        for &page in &self.pages {
            unsafe { dealloc(page as *mut u8, Self::page_layout()) };
        }
        self.pages.clear();
        self.free_head = std::ptr::null_mut();
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.deinit();
    }
}

// =============================================================================
// Tests
// =============================================================================
