/// Garbage-collected heap.
///
/// ARCHITECTURE:
///   • Central arena of slots; every heap object lives in exactly one slot
///   • Handles are {index, generation} pairs checked on dereference, so a
///     stale handle is a loud bug instead of a dangling pointer
///   • Mark-sweep with an explicit gray worklist: marking pushes, tracing
///     pops and blackens by marking children; the worklist being empty is
///     the completion condition
///   • Trigger: any allocation while bytes_allocated > next_gc collects;
///     afterwards next_gc = bytes_allocated * 2 (initial threshold 1 MiB)
///   • Roots are supplied by the caller as a closure over a `GcScope`, so
///     the VM and the compiler each describe their own root set without the
///     heap knowing either
///   • String interning lives here: the intern table is weak, swept of
///     unmarked keys before the main sweep
///
/// Collection runs to completion; there is no incremental marking.

use std::time::Instant;

use crate::object::{fnv1a, BoundMethod, Class, Closure, Function, HeapObj, Instance, ListObj,
                    NativeObj, StrObj, Upvalue};
use crate::table::Table;
use crate::value::Value;

const GC_INITIAL_THRESHOLD: usize = 1024 * 1024;
const GC_GROWTH_FACTOR: usize = 2;

/// Handle to a heap object. Copyable; comparing handles is object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    pub(crate) index: u32,
    pub(crate) gen: u32,
}

#[cfg(test)]
impl ObjRef {
    /// Fabricated handle for table unit tests; never dereferenced.
    pub fn test_ref(index: u32) -> Self {
        ObjRef { index, gen: 0 }
    }
}

struct Slot {
    gen: u32,
    bytes: usize,
    obj: Option<HeapObj>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GcConfig {
    /// Collect on every allocation. Slow; shakes out missing roots.
    pub stress: bool,
    /// Log each collection to stderr.
    pub log: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub collections: u64,
    pub bytes_freed: u64,
    pub last_pause_us: u64,
    pub total_pause_us: u64,
}

pub struct Heap {
    slots: Vec<Slot>,
    marks: Vec<bool>,
    free: Vec<u32>,
    strings: Table,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    pub stats: GcStats,
    config: GcConfig,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new(GcConfig::default())
    }
}

impl Heap {
    pub fn new(config: GcConfig) -> Self {
        Heap {
            slots: Vec::new(),
            marks: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: GC_INITIAL_THRESHOLD,
            stats: GcStats::default(),
            config,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Live objects in the arena.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.obj.is_some()).count()
    }

    // ── Allocation ───────────────────────────────────────────────────────────

    /// Allocate an object. `roots` must mark everything the caller needs to
    /// survive a collection; it is only invoked when one actually runs.
    pub fn alloc<F: FnOnce(&mut GcScope)>(&mut self, obj: HeapObj, roots: F) -> ObjRef {
        let bytes = obj_size(&obj);
        self.bytes_allocated += bytes;
        if self.config.stress || self.bytes_allocated > self.next_gc {
            self.collect(roots);
        }

        match self.free.pop() {
            Some(index) => {
                let i = index as usize;
                self.marks[i] = false;
                let slot = &mut self.slots[i];
                slot.obj = Some(obj);
                slot.bytes = bytes;
                ObjRef { index, gen: slot.gen }
            }
            None => {
                self.slots.push(Slot { gen: 0, bytes, obj: Some(obj) });
                self.marks.push(false);
                ObjRef { index: (self.slots.len() - 1) as u32, gen: 0 }
            }
        }
    }

    /// Intern a string: return the canonical copy if one exists, otherwise
    /// allocate one and add it to the (weak) intern table.
    pub fn intern<F: FnOnce(&mut GcScope)>(&mut self, text: &str, roots: F) -> ObjRef {
        let hash = fnv1a(text.as_bytes());
        let slots = &self.slots;
        let found = self.strings.find_string(hash, |r| {
            matches!(slots[r.index as usize].obj.as_ref(),
                     Some(HeapObj::Str(s)) if &*s.chars == text)
        });
        if let Some(r) = found {
            return r;
        }

        let r = self.alloc(HeapObj::Str(StrObj { chars: text.into(), hash }), roots);
        self.strings.set(r, hash, Value::Nil);
        r
    }

    // ── Dereference ──────────────────────────────────────────────────────────

    pub fn get(&self, r: ObjRef) -> &HeapObj {
        let slot = &self.slots[r.index as usize];
        assert!(slot.gen == r.gen, "stale object handle");
        slot.obj.as_ref().expect("dereference of freed object")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut HeapObj {
        let slot = &mut self.slots[r.index as usize];
        assert!(slot.gen == r.gen, "stale object handle");
        slot.obj.as_mut().expect("dereference of freed object")
    }

    pub fn string(&self, r: ObjRef) -> &StrObj {
        match self.get(r) {
            HeapObj::Str(s) => s,
            _ => panic!("expected string object"),
        }
    }

    pub fn str_chars(&self, r: ObjRef) -> &str {
        &self.string(r).chars
    }

    pub fn str_hash(&self, r: ObjRef) -> u32 {
        self.string(r).hash
    }

    pub fn function(&self, r: ObjRef) -> &Function {
        match self.get(r) {
            HeapObj::Function(f) => f,
            _ => panic!("expected function object"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &Closure {
        match self.get(r) {
            HeapObj::Closure(c) => c,
            _ => panic!("expected closure object"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut Closure {
        match self.get_mut(r) {
            HeapObj::Closure(c) => c,
            _ => panic!("expected closure object"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &Upvalue {
        match self.get(r) {
            HeapObj::Upvalue(u) => u,
            _ => panic!("expected upvalue object"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut Upvalue {
        match self.get_mut(r) {
            HeapObj::Upvalue(u) => u,
            _ => panic!("expected upvalue object"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &Class {
        match self.get(r) {
            HeapObj::Class(c) => c,
            _ => panic!("expected class object"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut Class {
        match self.get_mut(r) {
            HeapObj::Class(c) => c,
            _ => panic!("expected class object"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &Instance {
        match self.get(r) {
            HeapObj::Instance(i) => i,
            _ => panic!("expected instance object"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut Instance {
        match self.get_mut(r) {
            HeapObj::Instance(i) => i,
            _ => panic!("expected instance object"),
        }
    }

    pub fn list(&self, r: ObjRef) -> &ListObj {
        match self.get(r) {
            HeapObj::List(l) => l,
            _ => panic!("expected list object"),
        }
    }

    pub fn list_mut(&mut self, r: ObjRef) -> &mut ListObj {
        match self.get_mut(r) {
            HeapObj::List(l) => l,
            _ => panic!("expected list object"),
        }
    }

    pub fn native(&self, r: ObjRef) -> &NativeObj {
        match self.get(r) {
            HeapObj::Native(n) => n,
            _ => panic!("expected native object"),
        }
    }

    pub fn bound(&self, r: ObjRef) -> &BoundMethod {
        match self.get(r) {
            HeapObj::Bound(b) => b,
            _ => panic!("expected bound method object"),
        }
    }

    /// Printable form of a heap object.
    pub fn object_display(&self, r: ObjRef) -> String {
        match self.get(r) {
            HeapObj::Str(s) => s.chars.to_string(),
            HeapObj::Function(f) => self.function_display(f.name),
            HeapObj::Closure(c) => self.function_display(self.function(c.function).name),
            HeapObj::Upvalue(_) => "upvalue".to_string(),
            HeapObj::Class(c) => self.str_chars(c.name).to_string(),
            HeapObj::Instance(i) => {
                format!("{} instance", self.str_chars(self.class(i.class).name))
            }
            HeapObj::Bound(b) => {
                self.function_display(self.function(self.closure(b.method).function).name)
            }
            HeapObj::List(l) => {
                let parts: Vec<String> = l.items.iter().map(|v| v.display(self)).collect();
                format!("[{}]", parts.join(", "))
            }
            HeapObj::Native(_) => "<native fn>".to_string(),
        }
    }

    fn function_display(&self, name: Option<ObjRef>) -> String {
        match name {
            Some(n) => format!("<fn {}>", self.str_chars(n)),
            None => "<script>".to_string(),
        }
    }

    // ── Collection ───────────────────────────────────────────────────────────

    /// Run a full mark-sweep cycle with the given root marker.
    pub fn collect<F: FnOnce(&mut GcScope)>(&mut self, mark_roots: F) {
        let start = Instant::now();
        let before = self.bytes_allocated;

        {
            let Heap { slots, marks, gray, .. } = self;
            gray.clear();
            for mark in marks.iter_mut() {
                *mark = false;
            }
            let mut scope = GcScope { slots: slots.as_slice(), marks, gray };
            mark_roots(&mut scope);
            scope.trace();
        }

        // Weak pass: forget interned strings about to die.
        let marks = &self.marks;
        self.strings.remove_unmarked(|r| !marks[r.index as usize]);

        // Sweep: the arena slot walk is the sweep source.
        let mut freed = 0usize;
        let mut live = 0usize;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.obj.is_none() {
                continue;
            }
            if self.marks[i] {
                live += 1;
            } else {
                freed += slot.bytes;
                slot.obj = None;
                slot.gen = slot.gen.wrapping_add(1);
                self.free.push(i as u32);
            }
        }

        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
        self.next_gc = self.bytes_allocated * GC_GROWTH_FACTOR;

        let pause = start.elapsed().as_micros() as u64;
        self.stats.collections += 1;
        self.stats.bytes_freed += freed as u64;
        self.stats.last_pause_us = pause;
        self.stats.total_pause_us += pause;

        if self.config.log {
            eprintln!(
                "[GC] collect #{}: freed {} of {} bytes, {} objects live, next at {} ({} µs)",
                self.stats.collections, freed, before, live, self.next_gc, pause
            );
        }
    }
}

/// Marking context handed to root-set closures during a collection.
pub struct GcScope<'a> {
    slots: &'a [Slot],
    marks: &'a mut Vec<bool>,
    gray: &'a mut Vec<ObjRef>,
}

impl<'a> GcScope<'a> {
    pub fn mark_object(&mut self, r: ObjRef) {
        let i = r.index as usize;
        if !self.marks[i] {
            self.marks[i] = true;
            self.gray.push(r);
        }
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Drain the gray worklist, blackening each object by marking its
    /// outgoing references. Marking is done when the worklist is empty.
    fn trace(&mut self) {
        let slots = self.slots;
        while let Some(r) = self.gray.pop() {
            match slots[r.index as usize].obj.as_ref() {
                None | Some(HeapObj::Str(_)) | Some(HeapObj::Native(_)) => {}
                Some(HeapObj::Function(f)) => {
                    if let Some(name) = f.name {
                        self.mark_object(name);
                    }
                    for &constant in &f.chunk.constants {
                        self.mark_value(constant);
                    }
                }
                Some(HeapObj::Closure(c)) => {
                    self.mark_object(c.function);
                    for &upvalue in &c.upvalues {
                        self.mark_object(upvalue);
                    }
                }
                Some(HeapObj::Upvalue(u)) => {
                    if let Upvalue::Closed(v) = u {
                        self.mark_value(*v);
                    }
                }
                Some(HeapObj::Class(c)) => {
                    self.mark_object(c.name);
                    if let Some(init) = c.initializer {
                        self.mark_object(init);
                    }
                    self.mark_table(&c.methods);
                }
                Some(HeapObj::Instance(i)) => {
                    self.mark_object(i.class);
                    self.mark_table(&i.fields);
                }
                Some(HeapObj::Bound(b)) => {
                    self.mark_value(b.receiver);
                    self.mark_object(b.method);
                }
                Some(HeapObj::List(l)) => {
                    for &item in &l.items {
                        self.mark_value(item);
                    }
                }
            }
        }
    }
}

/// Allocation-time size estimate, recorded in the slot and credited back at
/// sweep. Interior growth (list pushes, table inserts) is ordinary Rust
/// memory and stays outside the trigger accounting.
fn obj_size(obj: &HeapObj) -> usize {
    let base = std::mem::size_of::<HeapObj>() + std::mem::size_of::<Slot>();
    base + match obj {
        HeapObj::Str(s) => s.chars.len(),
        HeapObj::Function(f) => {
            f.chunk.code.len() + f.chunk.constants.len() * std::mem::size_of::<Value>()
        }
        HeapObj::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjRef>(),
        HeapObj::List(l) => l.items.len() * std::mem::size_of::<Value>(),
        HeapObj::Class(_) | HeapObj::Instance(_) => 64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_heap() -> Heap {
        Heap::new(GcConfig::default())
    }

    #[test]
    fn test_interning_identity() {
        let mut heap = new_heap();
        let a = heap.intern("alpha", |_| {});
        let b = heap.intern("alpha", |_| {});
        let c = heap.intern("beta", |_| {});
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.object_count(), 2);
        assert_eq!(heap.str_chars(a), "alpha");
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = new_heap();
        let keep = heap.intern("keep", |_| {});
        let _drop = heap.intern("drop", |_| {});
        assert_eq!(heap.object_count(), 2);

        heap.collect(|gc| gc.mark_object(keep));
        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.str_chars(keep), "keep");
    }

    #[test]
    fn test_weak_intern_table() {
        let mut heap = new_heap();
        let a = heap.intern("ghost", |_| {});
        heap.collect(|_| {});
        // The old entry is gone, so re-interning allocates a fresh object
        // whose handle differs (same slot, bumped generation).
        let b = heap.intern("ghost", |_| {});
        assert_ne!(a, b);
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_collect_breaks_cycles() {
        let mut heap = new_heap();
        let a = heap.alloc(HeapObj::List(ListObj { items: Vec::new() }), |_| {});
        let b = heap.alloc(HeapObj::List(ListObj { items: vec![Value::Obj(a)] }), |_| {});
        heap.list_mut(a).items.push(Value::Obj(b));

        heap.collect(|gc| gc.mark_object(a));
        assert_eq!(heap.object_count(), 2, "cycle is reachable through a");

        heap.collect(|_| {});
        assert_eq!(heap.object_count(), 0, "unrooted cycle must be collected");
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mut heap = new_heap();
        let a = heap.intern("one", |_| {});
        heap.collect(|_| {});
        let b = heap.intern("two", |_| {});
        assert_eq!(a.index, b.index, "freed slot should be reused");
        assert_ne!(a.gen, b.gen);
    }

    #[test]
    fn test_stress_mode_collects_on_every_alloc() {
        let mut heap = Heap::new(GcConfig { stress: true, log: false });
        let before = heap.stats.collections;
        let _ = heap.intern("x", |_| {});
        assert!(heap.stats.collections > before);
    }

    #[test]
    fn test_bytes_accounting_shrinks_after_collect() {
        let mut heap = new_heap();
        let keep = heap.intern("keep-me-around", |_| {});
        let _ = heap.intern("a-reasonably-long-transient-string", |_| {});
        let high = heap.bytes_allocated();
        heap.collect(|gc| gc.mark_object(keep));
        assert!(heap.bytes_allocated() < high);
    }
}
