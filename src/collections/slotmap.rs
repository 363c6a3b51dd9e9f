/// Handle into a [`SlotMap`]. A released slot bumps its generation, so stale keys never
/// reach whatever reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    idx: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    // Err holds the next free slot
    value: Result<T, u32>,
}

#[derive(Debug)]
pub struct SlotMap<T> {
    head: u32,
    len: usize,
    entries: Vec<Slot<T>>,
}
impl<T> SlotMap<T> {
    pub fn new() -> Self {
        Self {
            head: u32::MAX,
            len: 0,
            entries: vec![],
        }
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn get(&self, key: SlotKey) -> Option<&T> {
        self.entries
            .get(key.idx as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_ref().ok())
    }
    pub fn insert(&mut self, value: T) -> SlotKey {
        self.len += 1;
        if self.head == u32::MAX {
            let idx = self.entries.len() as u32;
            self.entries.push(Slot { generation: 0, value: Ok(value) });
            SlotKey { idx, generation: 0 }
        } else {
            let idx = self.head;
            let slot = &mut self.entries[idx as usize];
            self.head = match core::mem::replace(&mut slot.value, Ok(value)) {
                Err(next) => next,
                Ok(_) => unreachable!("free list points at a live slot"),
            };
            SlotKey { idx, generation: slot.generation }
        }
    }
    pub fn release(&mut self, key: SlotKey) -> Option<T> {
        let slot = self.entries.get_mut(key.idx as usize)?;
        if slot.generation != key.generation || slot.value.is_err() {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;
        core::mem::replace(&mut slot.value, Err(core::mem::replace(&mut self.head, key.idx))).ok()
    }
    pub fn retain(&mut self, mut keep: impl FnMut(SlotKey, &mut T) -> bool) {
        for (idx, slot) in self.entries.iter_mut().enumerate() {
            if let Ok(value) = &mut slot.value {
                if !keep(SlotKey { idx: idx as u32, generation: slot.generation }, value) {
                    slot.generation = slot.generation.wrapping_add(1);
                    slot.value = Err(core::mem::replace(&mut self.head, idx as u32));
                    self.len -= 1;
                }
            }
        }
    }
}
impl<T> Default for SlotMap<T> {
    fn default() -> Self {
        Self::new()
    }
}
