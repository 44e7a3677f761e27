use crate::value::{HeapObject, Instance, Value};

/// Heap growth (estimated bytes) that triggers the next collection.
pub const DEFAULT_GC_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug)]
struct Slot {
    object: HeapObject,
    marked: bool,
}

/// The set of all live heap objects, identified by stable slot ids, plus the
/// mark-and-sweep collector that prunes it.
///
/// The heap itself knows nothing about where roots come from; the VM gathers
/// them (operand stack below `sp`, globals, constant pool) and passes them to
/// [`Heap::collect`].
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    bytes: usize,
    threshold: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_GC_THRESHOLD)
    }

    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            bytes: 0,
            threshold,
        }
    }

    pub fn alloc(&mut self, object: HeapObject) -> u32 {
        self.bytes += object.approx_bytes();
        let slot = Slot {
            object,
            marked: false,
        };
        if let Some(id) = self.free.pop() {
            self.slots[id as usize] = Some(slot);
            id
        } else {
            let id = self.slots.len() as u32;
            self.slots.push(Some(slot));
            id
        }
    }

    pub fn alloc_string(&mut self, value: impl Into<String>) -> u32 {
        self.alloc(HeapObject::Str(value.into()))
    }

    pub fn alloc_array(&mut self) -> u32 {
        self.alloc(HeapObject::Array(Vec::new()))
    }

    pub fn alloc_map(&mut self) -> u32 {
        self.alloc(HeapObject::Map(std::collections::HashMap::new()))
    }

    pub fn alloc_instance(&mut self, class_name: impl Into<String>) -> u32 {
        self.alloc(HeapObject::Instance(Instance::new(class_name)))
    }

    pub fn get(&self, id: u32) -> Option<&HeapObject> {
        self.slots
            .get(id as usize)
            .and_then(|slot| slot.as_ref())
            .map(|slot| &slot.object)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut HeapObject> {
        self.slots
            .get_mut(id as usize)
            .and_then(|slot| slot.as_mut())
            .map(|slot| &mut slot.object)
    }

    /// The raw bytes of a string object, if `id` names one.
    pub fn string(&self, id: u32) -> Option<&str> {
        match self.get(id) {
            Some(HeapObject::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Count of live objects.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated live bytes (allocation-time sizes; not updated for
    /// in-place growth until the next sweep).
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn should_collect(&self) -> bool {
        self.bytes > self.threshold
    }

    /// Mark everything reachable from `roots`, sweep the rest, and raise the
    /// threshold to twice the surviving live set so back-to-back collections
    /// cannot thrash.
    pub fn collect<I>(&mut self, roots: I)
    where
        I: IntoIterator<Item = Value>,
    {
        self.mark(roots);
        self.sweep();
        self.threshold = self.threshold.max(self.bytes * 2);
    }

    fn mark<I>(&mut self, roots: I)
    where
        I: IntoIterator<Item = Value>,
    {
        for slot in self.slots.iter_mut().flatten() {
            slot.marked = false;
        }

        let mut pending: Vec<u32> = roots
            .into_iter()
            .filter_map(|value| match value {
                Value::Object(id) => Some(id),
                _ => None,
            })
            .collect();

        // Worklist traversal; a marked slot is never revisited, so cycles
        // terminate.
        while let Some(id) = pending.pop() {
            let Some(slot) = self.slots.get_mut(id as usize).and_then(|s| s.as_mut()) else {
                continue;
            };
            if slot.marked {
                continue;
            }
            slot.marked = true;
            slot.object.mark_children(&mut |child| {
                if let Value::Object(child_id) = child {
                    pending.push(child_id);
                }
            });
        }
    }

    fn sweep(&mut self) {
        self.free.clear();
        self.bytes = 0;
        for (index, entry) in self.slots.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.marked => {
                    slot.marked = false;
                    self.bytes += slot.object.approx_bytes();
                }
                Some(_) => {
                    *entry = None;
                    self.free.push(index as u32);
                }
                None => self.free.push(index as u32),
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
