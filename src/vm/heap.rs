use std::cell::RefCell;
use std::fmt;
use std::io::{self, Write};
use std::rc::Rc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use super::error::VmError;
use super::runtime::{Runtime, SLOT_SIZE, StackAccess};
use super::value::{ObjRef, Value};

/// Native function ids understood by [`Heap::invoke_native`].
pub mod natives {
    pub const PRINT: usize = 0;
    pub const TIME: usize = 1;
    pub const RANDOM: usize = 2;
    pub const PRINTLN: usize = 3;
}

/// Bytes charged per object on top of its payload.
pub const HEADER_SIZE: usize = 16;

/// Largest payload whose element storage the host can represent.
const MAX_PAYLOAD: usize = isize::MAX as usize / std::mem::size_of::<Value>() * SLOT_SIZE;

// =============================================================================
// HeapObject
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    Instance { class_id: usize, fields: Vec<Value> },
    Array(Vec<Value>),
    Str(String),
}

impl HeapObject {
    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapObject::Instance { .. } => "object",
            HeapObject::Array(_) => "array",
            HeapObject::Str(_) => "string",
        }
    }

    fn children(&self) -> impl Iterator<Item = ObjRef> + '_ {
        let slots: &[Value] = match self {
            HeapObject::Instance { fields, .. } => fields,
            HeapObject::Array(elements) => elements,
            HeapObject::Str(_) => &[],
        };
        slots.iter().filter_map(|v| v.live_ref())
    }
}

impl fmt::Display for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapObject::Str(s) => write!(f, "{}", s),
            HeapObject::Array(elements) => write!(f, "<array len={}>", elements.len()),
            HeapObject::Instance { class_id, .. } => write!(f, "<object class={}>", class_id),
        }
    }
}

struct Slot {
    object: HeapObject,
    size: usize,
    marked: bool,
}

// =============================================================================
// Output
// =============================================================================

/// Shared in-memory sink for native output.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Rc<RefCell<Vec<u8>>>);

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// GC statistics.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub cycles: usize,
    pub objects_freed: usize,
    pub bytes_freed: usize,
    pub total_pause_us: u64,
    pub max_pause_us: u64,
}

// =============================================================================
// Heap
// =============================================================================

/// Mark-sweep heap over a slot table. Handle `n` names slot `n - 1`.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free_slots: Vec<usize>,
    bytes_allocated: usize,
    /// Hard limit on heap size (None = unlimited)
    heap_limit: Option<usize>,
    gc_enabled: bool,
    log_gc_stats: bool,
    stats: GcStats,
    output: Box<dyn Write>,
    rng: StdRng,
    started: Instant,
}

impl Heap {
    pub fn new() -> Self {
        Self::new_with_config(None, true)
    }

    /// Create a heap with custom limits.
    ///
    /// # Arguments
    /// * `heap_limit` - Hard limit on heap size in bytes (None = unlimited)
    /// * `gc_enabled` - Whether `collect` reclaims anything
    pub fn new_with_config(heap_limit: Option<usize>, gc_enabled: bool) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            bytes_allocated: 0,
            heap_limit,
            gc_enabled,
            log_gc_stats: false,
            stats: GcStats::default(),
            output: Box::new(io::stdout()),
            rng: StdRng::from_entropy(),
            started: Instant::now(),
        }
    }

    pub fn with_output(mut self, output: Box<dyn Write>) -> Self {
        self.output = output;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_gc_stats(mut self, enabled: bool) -> Self {
        self.log_gc_stats = enabled;
        self
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn gc_stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn get(&self, r: ObjRef) -> Result<&HeapObject, VmError> {
        let index = (r.0 as usize).wrapping_sub(1);
        self.slots
            .get(index)
            .and_then(|s| s.as_ref())
            .map(|s| &s.object)
            .ok_or(VmError::InvalidReference(r.0))
    }

    fn get_mut(&mut self, r: ObjRef) -> Result<&mut HeapObject, VmError> {
        let index = (r.0 as usize).wrapping_sub(1);
        self.slots
            .get_mut(index)
            .and_then(|s| s.as_mut())
            .map(|s| &mut s.object)
            .ok_or(VmError::InvalidReference(r.0))
    }

    /// Contents of a string object.
    pub fn string(&self, r: ObjRef) -> Result<&str, VmError> {
        match self.get(r)? {
            HeapObject::Str(s) => Ok(s),
            other => Err(VmError::TypeMismatch { expected: "string", found: other.kind_name() }),
        }
    }

    fn elements(&self, r: ObjRef) -> Result<&Vec<Value>, VmError> {
        match self.get(r)? {
            HeapObject::Array(elements) => Ok(elements),
            other => Err(VmError::TypeMismatch { expected: "array", found: other.kind_name() }),
        }
    }

    fn insert(&mut self, object: HeapObject, payload: usize) -> Result<ObjRef, VmError> {
        let size = HEADER_SIZE + payload;
        if !self.can_allocate(payload) {
            return Err(VmError::OutOfMemory { requested: payload });
        }
        let slot = Slot { object, size, marked: false };
        let index = match self.free_slots.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.bytes_allocated += size;
        Ok(ObjRef(index as u64 + 1))
    }

    fn mark(&mut self, roots: &[ObjRef]) {
        let mut worklist: Vec<ObjRef> = roots.to_vec();

        while let Some(r) = worklist.pop() {
            let index = (r.0 as usize).wrapping_sub(1);
            let Some(Some(slot)) = self.slots.get_mut(index) else {
                continue;
            };
            if slot.marked {
                continue;
            }
            slot.marked = true;
            worklist.extend(slot.object.children());
        }
    }

    /// Free unmarked slots; returns (objects, bytes) reclaimed.
    fn sweep(&mut self) -> (usize, usize) {
        let mut freed = 0;
        let mut freed_bytes = 0;

        for (index, entry) in self.slots.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.marked => slot.marked = false,
                Some(slot) => {
                    freed += 1;
                    freed_bytes += slot.size;
                    *entry = None;
                    self.free_slots.push(index);
                }
                None => {}
            }
        }

        self.bytes_allocated -= freed_bytes;
        (freed, freed_bytes)
    }

    fn write_text(&mut self, text: &str, newline: bool) -> Result<(), VmError> {
        let result = if newline {
            writeln!(self.output, "{}", text)
        } else {
            write!(self.output, "{}", text)
        };
        result.map_err(|e| VmError::Io(e.to_string()))
    }
}

/// `count` null slots, or `OutOfMemory` when the host allocator refuses.
fn null_slots(count: usize, requested: usize) -> Result<Vec<Value>, VmError> {
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(count)
        .map_err(|_| VmError::OutOfMemory { requested })?;
    slots.resize(count, Value::null());
    Ok(slots)
}

fn joined_text(parts: &[&str]) -> Result<String, VmError> {
    let requested = parts.iter().fold(0usize, |n, p| n.saturating_add(p.len()));
    let mut text = String::new();
    text.try_reserve_exact(requested)
        .map_err(|_| VmError::OutOfMemory { requested })?;
    parts.iter().for_each(|p| text.push_str(p));
    Ok(text)
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for Heap {
    fn can_allocate(&self, size: usize) -> bool {
        if size > MAX_PAYLOAD {
            return false;
        }
        match self.heap_limit {
            Some(limit) => self.bytes_allocated.saturating_add(HEADER_SIZE).saturating_add(size) <= limit,
            None => true,
        }
    }

    fn allocate_object(&mut self, payload_size: usize, class_id: usize) -> Result<ObjRef, VmError> {
        if !self.can_allocate(payload_size) {
            return Err(VmError::OutOfMemory { requested: payload_size });
        }
        let fields = null_slots(payload_size / SLOT_SIZE, payload_size)?;
        self.insert(HeapObject::Instance { class_id, fields }, payload_size)
    }

    fn allocate_array(&mut self, length: usize) -> Result<ObjRef, VmError> {
        let payload = length.saturating_mul(SLOT_SIZE);
        if !self.can_allocate(payload) {
            return Err(VmError::OutOfMemory { requested: payload });
        }
        let elements = null_slots(length, payload)?;
        self.insert(HeapObject::Array(elements), payload)
    }

    fn allocate_string(&mut self, text: &str) -> Result<ObjRef, VmError> {
        let owned = joined_text(&[text])?;
        self.insert(HeapObject::Str(owned), text.len())
    }

    fn concat_strings(&mut self, a: ObjRef, b: ObjRef) -> Result<ObjRef, VmError> {
        let joined = joined_text(&[self.string(a)?, self.string(b)?])?;
        let payload = joined.len();
        self.insert(HeapObject::Str(joined), payload)
    }

    fn read_field(&self, obj: ObjRef, field: usize) -> Result<Value, VmError> {
        match self.get(obj)? {
            HeapObject::Instance { class_id, fields } => fields
                .get(field)
                .copied()
                .ok_or(VmError::UnknownField { class: *class_id, field }),
            other => Err(VmError::TypeMismatch { expected: "object", found: other.kind_name() }),
        }
    }

    fn write_field(&mut self, obj: ObjRef, field: usize, value: Value) -> Result<(), VmError> {
        match self.get_mut(obj)? {
            HeapObject::Instance { class_id, fields } => match fields.get_mut(field) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(VmError::UnknownField { class: *class_id, field }),
            },
            other => Err(VmError::TypeMismatch { expected: "object", found: other.kind_name() }),
        }
    }

    fn read_element(&self, arr: ObjRef, index: i32) -> Result<Value, VmError> {
        let elements = self.elements(arr)?;
        usize::try_from(index)
            .ok()
            .and_then(|i| elements.get(i).copied())
            .ok_or(VmError::IndexOutOfRange { index, length: elements.len() })
    }

    fn write_element(&mut self, arr: ObjRef, index: i32, value: Value) -> Result<(), VmError> {
        match self.get_mut(arr)? {
            HeapObject::Array(elements) => {
                let length = elements.len();
                match usize::try_from(index).ok().and_then(|i| elements.get_mut(i)) {
                    Some(slot) => {
                        *slot = value;
                        Ok(())
                    }
                    None => Err(VmError::IndexOutOfRange { index, length }),
                }
            }
            other => Err(VmError::TypeMismatch { expected: "array", found: other.kind_name() }),
        }
    }

    fn collect(&mut self, roots: &[ObjRef]) {
        if !self.gc_enabled {
            return;
        }

        let start = Instant::now();
        self.mark(roots);
        let (freed, freed_bytes) = self.sweep();
        let pause_us = start.elapsed().as_micros() as u64;

        self.stats.cycles += 1;
        self.stats.objects_freed += freed;
        self.stats.bytes_freed += freed_bytes;
        self.stats.total_pause_us += pause_us;
        self.stats.max_pause_us = self.stats.max_pause_us.max(pause_us);

        if self.log_gc_stats {
            info!(
                cycle = self.stats.cycles,
                freed,
                freed_bytes,
                live_bytes = self.bytes_allocated,
                pause_us,
                "gc cycle"
            );
        }
    }

    fn invoke_native(&mut self, id: usize, stack: &mut dyn StackAccess) -> Result<(), VmError> {
        match id {
            natives::PRINT | natives::PRINTLN => {
                let value = stack.pop()?;
                let text = self.describe(value);
                self.write_text(&text, id == natives::PRINTLN)
            }
            natives::TIME => {
                let ms = self.started.elapsed().as_millis() as i32;
                stack.push(Value::from_i32(ms));
                Ok(())
            }
            natives::RANDOM => {
                let max = stack.pop()?.as_i32();
                let n = if max <= 0 { 0 } else { self.rng.gen_range(0..max) };
                stack.push(Value::from_i32(n));
                Ok(())
            }
            _ => Err(VmError::UnknownNative(id)),
        }
    }

    fn describe(&self, value: Value) -> String {
        match value.live_ref().map(|r| self.get(r)) {
            Some(Ok(object)) => object.to_string(),
            _ => value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecStack(Vec<Value>);

    impl StackAccess for VecStack {
        fn push(&mut self, value: Value) {
            self.0.push(value);
        }
        fn pop(&mut self) -> Result<Value, VmError> {
            self.0.pop().ok_or(VmError::StackUnderflow)
        }
        fn peek(&self) -> Result<Value, VmError> {
            self.0.last().copied().ok_or(VmError::StackUnderflow)
        }
        fn len(&self) -> usize {
            self.0.len()
        }
    }

    #[test]
    fn test_alloc_and_read_fields() {
        let mut heap = Heap::new();
        let r = heap.allocate_object(2 * SLOT_SIZE, 0).unwrap();
        assert_eq!(r, ObjRef(1));
        assert_eq!(heap.read_field(r, 1).unwrap(), Value::null());

        heap.write_field(r, 1, Value::from_i32(5)).unwrap();
        assert_eq!(heap.read_field(r, 1).unwrap(), Value::from_i32(5));
        assert_eq!(heap.bytes_allocated(), HEADER_SIZE + 16);
    }

    #[test]
    fn test_array_bounds() {
        let mut heap = Heap::new();
        let arr = heap.allocate_array(3).unwrap();
        heap.write_element(arr, 2, Value::from_i64(9)).unwrap();
        assert_eq!(heap.read_element(arr, 2).unwrap(), Value::from_i64(9));
        assert_eq!(
            heap.read_element(arr, 3),
            Err(VmError::IndexOutOfRange { index: 3, length: 3 })
        );
        assert_eq!(
            heap.write_element(arr, -1, Value::null()),
            Err(VmError::IndexOutOfRange { index: -1, length: 3 })
        );
    }

    #[test]
    fn test_strings() {
        let mut heap = Heap::new();
        let a = heap.allocate_string("foo").unwrap();
        let b = heap.allocate_string("bar").unwrap();
        let c = heap.concat_strings(a, b).unwrap();
        assert_eq!(heap.string(c).unwrap(), "foobar");
        assert_eq!(heap.describe(Value::from_object_ref(c)), "foobar");
    }

    #[test]
    fn test_gc_frees_unreachable() {
        let mut heap = Heap::new();
        let keep = heap.allocate_array(1).unwrap();
        let child = heap.allocate_string("child").unwrap();
        let _garbage = heap.allocate_string("garbage").unwrap();
        heap.write_element(keep, 0, Value::from_object_ref(child)).unwrap();

        heap.collect(&[keep]);

        assert_eq!(heap.object_count(), 2);
        assert_eq!(heap.string(child).unwrap(), "child");
        assert_eq!(heap.gc_stats().cycles, 1);
        assert_eq!(heap.gc_stats().objects_freed, 1);
    }

    #[test]
    fn test_gc_handles_cycles() {
        let mut heap = Heap::new();
        let a = heap.allocate_object(SLOT_SIZE, 0).unwrap();
        let b = heap.allocate_object(SLOT_SIZE, 0).unwrap();
        heap.write_field(a, 0, Value::from_object_ref(b)).unwrap();
        heap.write_field(b, 0, Value::from_object_ref(a)).unwrap();

        heap.collect(&[]);
        assert_eq!(heap.object_count(), 0);
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut heap = Heap::new();
        let first = heap.allocate_string("x").unwrap();
        heap.collect(&[]);
        let second = heap.allocate_string("y").unwrap();
        assert_eq!(first, second);
        assert_eq!(heap.get(ObjRef(2)), Err(VmError::InvalidReference(2)));
    }

    #[test]
    fn test_disabled_gc_keeps_everything() {
        let mut heap = Heap::new_with_config(None, false);
        heap.allocate_string("x").unwrap();
        heap.collect(&[]);
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_heap_limit() {
        let mut heap = Heap::new_with_config(Some(64), true);
        assert!(heap.can_allocate(48));
        assert!(!heap.can_allocate(49));
        heap.allocate_array(2).unwrap();
        assert!(matches!(heap.allocate_array(4), Err(VmError::OutOfMemory { .. })));
    }

    #[test]
    fn test_unrepresentable_array_is_out_of_memory() {
        let mut heap = Heap::new();
        let length = usize::MAX / SLOT_SIZE;
        let err = heap.allocate_array(length).unwrap_err();
        assert_eq!(err, VmError::OutOfMemory { requested: length * SLOT_SIZE });
        assert!(!heap.can_allocate(usize::MAX));
        assert_eq!(heap.object_count(), 0);
    }

    #[test]
    fn test_refused_reservation_is_out_of_memory() {
        let err = null_slots(usize::MAX / 2, 64).unwrap_err();
        assert_eq!(err, VmError::OutOfMemory { requested: 64 });
        assert_eq!(null_slots(3, 24).unwrap(), vec![Value::null(); 3]);
    }

    #[test]
    fn test_print_natives() {
        let out = OutputBuffer::new();
        let mut heap = Heap::new().with_output(Box::new(out.clone()));
        let s = heap.allocate_string("hi").unwrap();
        let mut stack = VecStack(vec![Value::from_object_ref(s)]);
        heap.invoke_native(natives::PRINT, &mut stack).unwrap();
        stack.push(Value::from_f64(2.5));
        heap.invoke_native(natives::PRINTLN, &mut stack).unwrap();
        assert_eq!(out.contents(), "hi2.5\n");
        assert!(stack.is_empty());
    }

    #[test]
    fn test_random_is_seedable() {
        let draw = |seed| {
            let mut heap = Heap::new().with_seed(seed);
            let mut stack = VecStack(Vec::new());
            (0..5)
                .map(|_| {
                    stack.push(Value::from_i32(100));
                    heap.invoke_native(natives::RANDOM, &mut stack).unwrap();
                    stack.pop().unwrap().as_i32()
                })
                .collect::<Vec<_>>()
        };
        let a = draw(7);
        assert_eq!(a, draw(7));
        assert!(a.iter().all(|n| (0..100).contains(n)));

        let mut heap = Heap::new();
        let mut stack = VecStack(vec![Value::from_i32(-3)]);
        heap.invoke_native(natives::RANDOM, &mut stack).unwrap();
        assert_eq!(stack.pop().unwrap(), Value::from_i32(0));
    }

    #[test]
    fn test_unknown_native() {
        let mut heap = Heap::new();
        let mut stack = VecStack(Vec::new());
        assert_eq!(heap.invoke_native(42, &mut stack), Err(VmError::UnknownNative(42)));
    }
}
