//! References between levels, stored as `(level, guid)` tokens instead of
//! import indices so either level can be loaded first.

use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, trace};

use crate::FGuid;
use crate::object_store::{ObjectRef, ObjectStore, PropertyValue};
use crate::resources::EObjectFlags;

/// Top byte of a serialized reference that holds a cross-level token.
pub const CROSS_LEVEL_TAG: u32 = 0xF0;

/// Pack `(level index, guid index)` into a tagged reference. `None` when
/// either index doesn't fit its field.
pub fn encode_token(level: usize, guid: usize) -> Option<i32> {
    if level > 0xFF || guid > 0xFFFF {
        return None;
    }
    Some(((CROSS_LEVEL_TAG << 24) | ((level as u32) << 16) | guid as u32) as i32)
}

/// Split a tagged reference into `(level index, guid index)`.
pub fn decode_token(value: i32) -> Option<(usize, usize)> {
    let value = value as u32;
    (value >> 24 == CROSS_LEVEL_TAG).then(|| (((value >> 16) & 0xFF) as usize, (value & 0xFFFF) as usize))
}

/// A reference slot waiting for its target: property `slot` of `holder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CrossLevelSlot {
    pub holder: ObjectRef,
    pub slot: usize,
}

#[derive(Debug, Default)]
pub struct CrossLevelRegistry {
    object_to_guid: HashMap<ObjectRef, FGuid>,
    guid_to_object: HashMap<FGuid, ObjectRef>,
    pending: HashMap<FGuid, Vec<CrossLevelSlot>>,
    /// Target to the slots pointing at it.
    holders: HashMap<ObjectRef, Vec<CrossLevelSlot>>,
    notified: Vec<ObjectRef>,
}

impl CrossLevelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guid_of(&self, object: ObjectRef) -> Option<FGuid> {
        self.object_to_guid.get(&object).copied()
    }

    pub fn resolve(&self, guid: FGuid) -> Option<ObjectRef> {
        self.guid_to_object.get(&guid).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Holders whose slots were filled in since the last call.
    pub fn take_notified(&mut self) -> Vec<ObjectRef> {
        std::mem::take(&mut self.notified)
    }

    /// Bind `guid` to a loaded object and fill in every slot waiting for it.
    pub fn register(&mut self, store: &mut ObjectStore, guid: FGuid, object: ObjectRef) -> Result<()> {
        self.object_to_guid.insert(object, guid);
        self.guid_to_object.insert(guid, object);
        let Some(waiting) = self.pending.remove(&guid) else {
            return Ok(());
        };
        for slot in waiting {
            if !store.is_alive(slot.holder) {
                continue;
            }
            write_slot(store, slot, Some(object))?;
            debug!("fixed up cross-level reference {}[{}] -> {}", store.path_name(slot.holder), slot.slot, store.path_name(object));
            self.add_holder(store, object, slot);
            self.notified.push(slot.holder);
        }
        Ok(())
    }

    /// Record that `slot` references `target`, which is already loaded.
    pub fn add_holder(&mut self, store: &mut ObjectStore, target: ObjectRef, slot: CrossLevelSlot) {
        store.set_flags(target, EObjectFlags::IS_CROSS_LEVEL_REFERENCED);
        let holders = self.holders.entry(target).or_default();
        if !holders.contains(&slot) {
            holders.push(slot);
        }
    }

    /// Remember that `slot` wants the object with `guid` once it loads.
    pub fn add_pending(&mut self, guid: FGuid, slot: CrossLevelSlot) {
        trace!("deferring cross-level reference to {guid}");
        let pending = self.pending.entry(guid).or_default();
        if !pending.contains(&slot) {
            pending.push(slot);
        }
    }

    /// Null every slot pointing at `target` and queue them again, so a
    /// reload of the target level restores them.
    pub fn object_destroyed(&mut self, store: &mut ObjectStore, target: ObjectRef) -> Result<()> {
        let guid = self.object_to_guid.remove(&target);
        if let Some(guid) = guid {
            self.guid_to_object.remove(&guid);
        }
        let Some(slots) = self.holders.remove(&target) else {
            return Ok(());
        };
        for slot in slots {
            if !store.is_alive(slot.holder) {
                continue;
            }
            write_slot(store, slot, None)?;
            if let Some(guid) = guid {
                self.add_pending(guid, slot);
            }
        }
        Ok(())
    }

    /// Forget every slot held by `holder`, which is going away.
    pub fn holder_destroyed(&mut self, holder: ObjectRef) {
        for slots in self.pending.values_mut().chain(self.holders.values_mut()) {
            slots.retain(|s| s.holder != holder);
        }
        self.pending.retain(|_, v| !v.is_empty());
        self.holders.retain(|_, v| !v.is_empty());
    }
}

fn write_slot(store: &mut ObjectStore, slot: CrossLevelSlot, target: Option<ObjectRef>) -> Result<()> {
    let holder = store.get_mut(slot.holder)?;
    if let Some(property) = holder.properties_mut().and_then(|p| p.get_mut(slot.slot)) {
        property.value = PropertyValue::CrossLevelObject(target);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::name_map::FName;
    use crate::object_store::Property;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_token_layout() {
        assert_eq!(encode_token(0, 3), Some(0xF000_0003u32 as i32));
        assert_eq!(encode_token(2, 0x1234), Some(0xF002_1234u32 as i32));
        assert_eq!(decode_token(0xF002_1234u32 as i32), Some((2, 0x1234)));
        assert_eq!(encode_token(256, 0), None);
        assert_eq!(decode_token(5), None);
        assert_eq!(decode_token(-3), None);
    }

    #[test]
    fn test_pending_fixup_and_teardown() -> Result<()> {
        let mut store = ObjectStore::new();
        let object = store.core().object;
        let a = store.create_package(None, FName::new("LevelA"))?;
        let b = store.create_package(None, FName::new("LevelB"))?;
        let holder = store.construct_object(object, Some(a), FName::new("Trigger"), EObjectFlags::empty(), None)?;
        store
            .get_mut(holder)?
            .properties_mut()
            .unwrap()
            .push(Property::new("Target", PropertyValue::CrossLevelObject(None)));

        let guid = FGuid::new(1, 2, 3, 4);
        let mut registry = CrossLevelRegistry::new();
        registry.add_pending(guid, CrossLevelSlot { holder, slot: 0 });
        assert_eq!(registry.pending_count(), 1);

        let target = store.construct_object(object, Some(b), FName::new("Door"), EObjectFlags::empty(), None)?;
        registry.register(&mut store, guid, target)?;
        assert_eq!(store.get(holder)?.properties()[0].value, PropertyValue::CrossLevelObject(Some(target)));
        assert!(store.flags(target).contains(EObjectFlags::IS_CROSS_LEVEL_REFERENCED));
        assert_eq!(registry.take_notified(), vec![holder]);
        assert_eq!(registry.pending_count(), 0);

        registry.object_destroyed(&mut store, target)?;
        assert_eq!(store.get(holder)?.properties()[0].value, PropertyValue::CrossLevelObject(None));
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(registry.resolve(guid), None);
        Ok(())
    }
}
