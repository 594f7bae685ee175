//! Arena heap and mark-and-sweep collector.
//!
//! Objects live in a slot vector indexed by [`HeapId`]; freed slots are
//! recycled through a free list. Allocation attributes an estimated byte
//! size which is subtracted again at sweep, and a collection is due whenever
//! the byte counter crosses the threshold. After every collection the
//! threshold doubles.
//!
//! Marking is a worklist traversal over [`HeapData::trace`] with a
//! per-collection bitmap, so arbitrary cycles are collected once
//! unreachable. Native-instance finalizers run exactly once, during the
//! sweep that releases the instance.

use std::collections::BTreeMap;
use std::fmt;

use crate::{
    error::{RunError, RunResult},
    fiber::Fiber,
    object::HeapData,
};

/// Default collection threshold in bytes.
pub const DEFAULT_GC_THRESHOLD: usize = 256 * 1024;

/// Index of an object slot in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(u32);

impl HeapId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct HeapEntry {
    /// Bytes attributed at allocation time.
    size: usize,
    data: HeapData,
}

/// Snapshot of heap state, used by embedders and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of live objects.
    pub live_objects: usize,
    /// Recycled slots available for reuse.
    pub free_slots: usize,
    /// Total arena capacity (live + free).
    pub total_slots: usize,
    /// Bytes currently attributed to live objects.
    pub allocated_bytes: usize,
    /// Live object counts by variant name, deterministic iteration order.
    pub objects_by_type: BTreeMap<&'static str, usize>,
}

/// Result of one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Objects released this cycle.
    pub freed_objects: usize,
    /// Bytes released this cycle.
    pub freed_bytes: usize,
    /// Objects surviving this cycle.
    pub live_objects: usize,
}

/// The collector-owned object arena.
pub struct Heap {
    slots: Vec<Option<HeapEntry>>,
    free: Vec<u32>,
    allocated_bytes: usize,
    threshold: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Creates a heap with the default collection threshold.
    #[must_use]
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_GC_THRESHOLD)
    }

    /// Creates a heap with an explicit collection threshold. Embedders that
    /// allocate heavily during construction can pass a large value to keep
    /// the collector quiet.
    #[must_use]
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            allocated_bytes: 0,
            threshold,
        }
    }

    /// Allocates an object, registering it with the collector.
    pub fn alloc(&mut self, data: HeapData) -> HeapId {
        let size = data.shallow_size();
        self.allocated_bytes += size;
        let entry = HeapEntry { size, data };
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(entry);
            HeapId(index)
        } else {
            let index = u32::try_from(self.slots.len()).unwrap_or_else(|_| {
                // 2^32 live objects will have exhausted memory long before.
                panic!("heap slot index overflow")
            });
            self.slots.push(Some(entry));
            HeapId(index)
        }
    }

    /// Borrows an object. Panics on a stale id, which indicates a VM bug:
    /// values holding heap ids are themselves traced, so a reachable id is
    /// never swept.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        match self.slots.get(id.index()) {
            Some(Some(entry)) => &entry.data,
            _ => panic!("stale heap id {id}"),
        }
    }

    /// Mutably borrows an object. Panics on a stale id.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        match self.slots.get_mut(id.index()) {
            Some(Some(entry)) => &mut entry.data,
            _ => panic!("stale heap id {id}"),
        }
    }

    /// Borrows a fiber object.
    pub fn fiber(&self, id: HeapId) -> RunResult<&Fiber> {
        match self.get(id) {
            HeapData::Fiber(Some(fib)) => Ok(fib),
            HeapData::Fiber(None) => Err(RunError::internal("fiber is checked out for execution")),
            other => Err(RunError::type_error(format!(
                "expected fiber, got {}",
                other.type_name()
            ))),
        }
    }

    /// Mutably borrows a fiber object.
    pub fn fiber_mut(&mut self, id: HeapId) -> RunResult<&mut Fiber> {
        match self.get_mut(id) {
            HeapData::Fiber(Some(fib)) => Ok(fib),
            HeapData::Fiber(None) => Err(RunError::internal("fiber is checked out for execution")),
            other => Err(RunError::type_error(format!(
                "expected fiber, got {}",
                other.type_name()
            ))),
        }
    }

    /// Checks a fiber out of its slot for execution. The collector must not
    /// run while a fiber is checked out.
    pub fn take_fiber(&mut self, id: HeapId) -> RunResult<Box<Fiber>> {
        match self.get_mut(id) {
            HeapData::Fiber(slot) => slot
                .take()
                .ok_or_else(|| RunError::internal("fiber is already checked out")),
            other => Err(RunError::type_error(format!(
                "expected fiber, got {}",
                other.type_name()
            ))),
        }
    }

    /// Returns a checked-out fiber to its slot.
    pub fn put_fiber(&mut self, id: HeapId, fib: Box<Fiber>) {
        match self.get_mut(id) {
            HeapData::Fiber(slot @ None) => *slot = Some(fib),
            HeapData::Fiber(Some(_)) => panic!("fiber slot {id} already occupied"),
            other => panic!("expected fiber slot at {id}, got {}", other.type_name()),
        }
    }

    /// Bytes currently attributed to live objects.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Current collection threshold.
    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// True when the byte counter has crossed the threshold.
    #[must_use]
    pub fn should_collect(&self) -> bool {
        self.allocated_bytes >= self.threshold
    }

    /// Runs one mark-and-sweep cycle over the given roots and doubles the
    /// threshold.
    pub fn collect(&mut self, roots: &[HeapId]) -> SweepStats {
        let mut marked = vec![false; self.slots.len()];
        let mut work: Vec<HeapId> = roots.to_vec();
        let mut children = Vec::new();
        while let Some(id) = work.pop() {
            let index = id.index();
            if marked[index] {
                continue;
            }
            marked[index] = true;
            if let Some(Some(entry)) = self.slots.get(index) {
                children.clear();
                entry.data.trace(&mut children);
                work.extend_from_slice(&children);
            }
        }

        let mut stats = SweepStats {
            freed_objects: 0,
            freed_bytes: 0,
            live_objects: 0,
        };
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                continue;
            }
            if marked[index] {
                stats.live_objects += 1;
                continue;
            }
            if let Some(entry) = slot.take() {
                stats.freed_objects += 1;
                stats.freed_bytes += entry.size;
                self.allocated_bytes = self.allocated_bytes.saturating_sub(entry.size);
                run_finalizer(&entry.data);
                self.free.push(index as u32);
                drop(entry);
            }
        }
        self.threshold = self.threshold.saturating_mul(2);
        stats
    }

    /// Current heap statistics.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut objects_by_type = BTreeMap::new();
        let mut live_objects = 0;
        for slot in &self.slots {
            if let Some(entry) = slot {
                live_objects += 1;
                *objects_by_type.entry(entry.data.type_name()).or_insert(0) += 1;
            }
        }
        HeapStats {
            live_objects,
            free_slots: self.free.len(),
            total_slots: self.slots.len(),
            allocated_bytes: self.allocated_bytes,
            objects_by_type,
        }
    }
}

/// Invokes a native-instance finalizer on the foreign payload, if both are
/// present. Called once per instance, just before its slot is released.
fn run_finalizer(data: &HeapData) {
    if let HeapData::NativeInstance(instance) = data {
        if let (Some(finalizer), Some(foreign)) = (&instance.finalizer, &instance.foreign) {
            finalizer(foreign);
        }
    }
}
