//! Typed module registry with priority-ordered lifecycle hooks.
//!
//! Each registered type gets a small integer id on first registration,
//! stable for the registry's lifetime; the slot array is bounded. Lifecycle
//! hooks iterate priorities High to Low and registration order within one
//! priority; `proc` splits the remaining budget evenly across active
//! modules with a 1 ms floor.

use std::any::{Any, TypeId};
use std::collections::HashMap;

/// Bound on registered modules.
pub const MAX_MODULES: usize = 50;

/// Lifecycle hooks of an engine sub-system.
pub trait EngineModule: Any {
    fn on_init(&mut self) -> bool {
        true
    }
    fn on_tick(&mut self, _now_ms: u64, _tick_count: u64) {}
    /// Co-scheduled work slice; returns how much work was done.
    fn on_proc(&mut self, _now_ms: u64, _remain_ms: u64, _stopping: bool) -> usize {
        0
    }
    fn on_finish(&mut self) {}
}

/// Scheduling priority of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulePriority {
    Low = 0,
    Mid = 1,
    High = 2,
}

const PRIORITY_COUNT: usize = 3;

/// Bounded typed store of modules.
#[derive(Default)]
pub struct ModuleRegistry {
    slots: Vec<Option<Box<dyn EngineModule>>>,
    type_ids: HashMap<TypeId, usize>,
    priority_index: [Vec<usize>; PRIORITY_COUNT],
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_MODULES).map(|_| None).collect(),
            type_ids: HashMap::new(),
            priority_index: Default::default(),
        }
    }

    fn id_for<T: EngineModule>(&mut self) -> usize {
        let next = self.type_ids.len();
        *self.type_ids.entry(TypeId::of::<T>()).or_insert(next)
    }

    /// Registers a module under its type. Fails when the slot space is
    /// exhausted or the type is already registered.
    pub fn add<T: EngineModule>(&mut self, module: T, priority: ModulePriority) -> bool {
        let id = self.id_for::<T>();
        if id >= MAX_MODULES || self.slots[id].is_some() {
            return false;
        }
        self.slots[id] = Some(Box::new(module));
        self.priority_index[priority as usize].push(id);
        true
    }

    /// Removes a module, clearing both the slot and its priority entry.
    pub fn remove<T: EngineModule>(&mut self) -> bool {
        let Some(&id) = self.type_ids.get(&TypeId::of::<T>()) else {
            return false;
        };
        if self.slots[id].is_none() {
            return false;
        }
        self.slots[id] = None;
        for bucket in &mut self.priority_index {
            bucket.retain(|&slot| slot != id);
        }
        true
    }

    pub fn get<T: EngineModule>(&self) -> Option<&T> {
        let id = *self.type_ids.get(&TypeId::of::<T>())?;
        let module = self.slots[id].as_ref()?;
        (module.as_ref() as &dyn Any).downcast_ref::<T>()
    }

    pub fn get_mut<T: EngineModule>(&mut self) -> Option<&mut T> {
        let id = *self.type_ids.get(&TypeId::of::<T>())?;
        let module = self.slots[id].as_mut()?;
        (module.as_mut() as &mut dyn Any).downcast_mut::<T>()
    }

    /// Registered module count.
    pub fn len(&self) -> usize {
        self.priority_index.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn for_each_priority_desc(&mut self, mut f: impl FnMut(&mut dyn EngineModule) -> bool) -> bool {
        for priority in (0..PRIORITY_COUNT).rev() {
            let ids = self.priority_index[priority].clone();
            for id in ids {
                if let Some(module) = self.slots[id].as_mut() {
                    if !f(module.as_mut()) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Runs every `on_init`, High to Low; stops at the first failure.
    pub fn init(&mut self) -> bool {
        self.for_each_priority_desc(|m| m.on_init())
    }

    pub fn tick(&mut self, now_ms: u64, tick_count: u64) {
        self.for_each_priority_desc(|m| {
            m.on_tick(now_ms, tick_count);
            true
        });
    }

    /// Runs every `on_proc` with an even share of `remain_ms` (1 ms floor).
    pub fn proc(&mut self, now_ms: u64, remain_ms: u64, stopping: bool) -> usize {
        let active = self.len().max(1) as u64;
        let share = if remain_ms > 0 { (remain_ms / active).max(1) } else { 1 };
        let mut dealt = 0usize;
        self.for_each_priority_desc(|m| {
            dealt += m.on_proc(now_ms, share, stopping);
            true
        });
        dealt
    }

    pub fn finish(&mut self) {
        self.for_each_priority_desc(|m| {
            m.on_finish();
            true
        });
    }
}
