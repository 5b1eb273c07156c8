use crate::prelude::*;
use crate::register::{Register, RegisterValue, WriteAck};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub type Registers = HashMap<String, Register>;

/// Last known value of every register ever fetched from the device.
///
/// Cloning gives another handle onto the same cache. A merge takes the write
/// lock for the whole batch, so a reader sees either the state before the
/// merge or after it, never half of one. Entries are never removed.
#[derive(Clone, Default)]
pub struct RegisterCache {
    register_data: Arc<RwLock<Registers>>,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges freshly fetched registers. The incoming record wins for every
    /// field; tags absent from `registers` keep their previous entry.
    pub fn merge<I>(&self, registers: I) -> usize
    where
        I: IntoIterator<Item = Register>,
    {
        let mut data = self.write();
        let mut count = 0;

        for register in registers {
            match data.get_mut(&register.tag_id) {
                Some(existing) => *existing = register,
                None => {
                    debug!("register_cache: new tag {}", register.tag_id);
                    data.insert(register.tag_id.clone(), register);
                }
            }
            count += 1;
        }

        count
    }

    /// Applies acknowledged writes. Only acks with status `ok` change the
    /// cache, and only the value: description and limits are kept from the
    /// last read. Returns the acks that were applied.
    pub fn apply_write_acks<'a>(&self, acks: &'a [WriteAck]) -> Vec<&'a WriteAck> {
        let mut data = self.write();
        let mut applied = Vec::new();

        for ack in acks {
            if !ack.is_ok() {
                warn!("write to {} rejected with status {}", ack.tag_id, ack.status);
                continue;
            }
            let Some(raw) = &ack.value else {
                warn!("write ack {} for {} carries no value, skipping", ack.write_id, ack.tag_id);
                continue;
            };

            let value = RegisterValue::coerce(raw);
            data.entry(ack.tag_id.clone())
                .and_modify(|r| r.value = value.clone())
                .or_insert_with(|| Register {
                    tag_id: ack.tag_id.clone(),
                    value,
                    description: None,
                    min_value: None,
                    max_value: None,
                });
            applied.push(ack);
        }

        applied
    }

    pub fn get(&self, tag_id: &str) -> Option<Register> {
        self.read().get(tag_id).cloned()
    }

    pub fn value(&self, tag_id: &str) -> Option<RegisterValue> {
        self.read().get(tag_id).map(|r| r.value.clone())
    }

    pub fn tags(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// A consistent copy of the whole cache.
    pub fn snapshot(&self) -> Registers {
        self.read().clone()
    }

    // a panic while holding the lock cannot leave a half merged map behind
    // (each entry is replaced whole), so poisoning is safe to ignore
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registers> {
        self.register_data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registers> {
        self.register_data.write().unwrap_or_else(|e| e.into_inner())
    }
}
