//! Cirrus - a stripped down sparse component store in finite time.
//!
//! This library lets you throw collections of objects with varying
//! lifetimes into one store. You specify the `Component` tables, create
//! any number of reference counted `Entity` objects, and when an `Entity`
//! goes out of scope its component data is dropped along with it. Emphasis
//! is placed on minimizing complexity and avoiding scanning or
//! re-organizing data, as Cirrus is meant to be the data engine for
//! low-latency graphics programs.
//!
//! Cirrus supports multi-threaded access. `Entity` is internally a
//! reference counted id, and each `Component` is a data table wrapped in
//! a `RwLock`. Calling the `get` and `get_mut` methods returns a `TableRef`,
//! which holds the `RwLock` open for as long as the reference is active.
//! The main gotcha is being aware of that locking behavior: holding a
//! `TableRef` across a call that writes the same table will deadlock.
//!
//! Usage begins with creating an `Instance`. It tracks the validity of
//! `Entity` objects in the system and holds references to the data tables
//! used for storage:
//!
//! ```
//! use cirrus as cs;
//! let mut inst = cs::Instance::new();
//! let entity = inst.add_entity();
//!
//! let comp = inst.add_component();
//! comp.set(&entity, "Hola Cirrus");
//! assert_eq!(*comp.get(&entity).unwrap(), "Hola Cirrus");
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

#[cfg(test)]
mod tests;

/// Type erased handle that lets the instance clear an entity's
/// value out of any component table.
trait TableOps: Send + Sync {
    fn clear_entity(&self, id: usize);
}

/// One component table. The backing array is indexed by the raw
/// entity id and grows on demand.
struct TableInner<T: 'static> {
    t_data: RwLock<Vec<Option<T>>>,
}

impl<T: Send + Sync + 'static> TableOps for TableInner<T> {
    fn clear_entity(&self, id: usize) {
        let mut data = self.t_data.write().unwrap();
        if id < data.len() {
            data[id] = None;
        }
    }
}

/// Tracking state shared by all entities and components of one `Instance`.
struct InstanceInternal {
    /// The next id to hand out when the free list is empty
    ii_next_id: usize,
    /// Ids that have been released and can be recycled
    ii_free: Vec<usize>,
    /// Every table created from this instance. Needed so entity
    /// destruction can drop the component data.
    ii_tables: Vec<Arc<dyn TableOps>>,
}

/// The component store itself.
///
/// Cloning an `Instance` is cheap and yields a handle to the same
/// underlying store.
#[derive(Clone)]
pub struct Instance {
    i_internal: Arc<Mutex<InstanceInternal>>,
}

struct EntityInternal {
    e_id: usize,
    e_inst: Weak<Mutex<InstanceInternal>>,
}

impl Drop for EntityInternal {
    fn drop(&mut self) {
        // If the instance is already gone there is nothing to clean up
        if let Some(inst) = self.e_inst.upgrade() {
            let mut internal = inst.lock().unwrap();
            for table in internal.ii_tables.iter() {
                table.clear_entity(self.e_id);
            }
            internal.ii_free.push(self.e_id);
        }
    }
}

/// A reference counted id into the store.
///
/// When the last clone of an `Entity` is dropped its id is recycled and
/// all component values stored for it are dropped.
#[derive(Clone)]
pub struct Entity(Arc<EntityInternal>);

impl Entity {
    /// The raw index of this entity. Valid for as long as the entity
    /// is alive, after which it may be handed out again.
    pub fn get_raw_id(&self) -> usize {
        self.0.e_id
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Entity").field(&self.0.e_id).finish()
    }
}

impl Instance {
    pub fn new() -> Self {
        Self {
            i_internal: Arc::new(Mutex::new(InstanceInternal {
                ii_next_id: 0,
                ii_free: Vec::new(),
                ii_tables: Vec::new(),
            })),
        }
    }

    /// Allocate a new entity, recycling a freed id if one is available.
    pub fn add_entity(&mut self) -> Entity {
        let mut internal = self.i_internal.lock().unwrap();
        let id = match internal.ii_free.pop() {
            Some(id) => id,
            None => {
                let id = internal.ii_next_id;
                internal.ii_next_id += 1;
                id
            }
        };

        Entity(Arc::new(EntityInternal {
            e_id: id,
            e_inst: Arc::downgrade(&self.i_internal),
        }))
    }

    /// Create a new sparse component table.
    pub fn add_component<T: Send + Sync + 'static>(&mut self) -> Component<T> {
        let inner = Arc::new(TableInner {
            t_data: RwLock::new(Vec::new()),
        });

        let mut internal = self.i_internal.lock().unwrap();
        internal.ii_tables.push(inner.clone());

        Component { c_inner: inner }
    }

    /// The total number of entity slots ever allocated. This bounds the
    /// raw ids currently in circulation.
    pub fn capacity(&self) -> usize {
        self.i_internal.lock().unwrap().ii_next_id
    }

    /// The number of currently live entities.
    pub fn num_entities(&self) -> usize {
        let internal = self.i_internal.lock().unwrap();
        internal.ii_next_id - internal.ii_free.len()
    }
}

/// An immutable reference to one entity's value in a component table.
/// Holds the table's read lock open.
pub struct TableRef<'a, T: 'static> {
    tr_guard: RwLockReadGuard<'a, Vec<Option<T>>>,
    tr_id: usize,
}

impl<'a, T: 'static> Deref for TableRef<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.tr_guard[self.tr_id].as_ref().unwrap()
    }
}

/// A mutable reference to one entity's value in a component table.
/// Holds the table's write lock open.
pub struct TableRefMut<'a, T: 'static> {
    tr_guard: RwLockWriteGuard<'a, Vec<Option<T>>>,
    tr_id: usize,
}

impl<'a, T: 'static> Deref for TableRefMut<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.tr_guard[self.tr_id].as_ref().unwrap()
    }
}

impl<'a, T: 'static> DerefMut for TableRefMut<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.tr_guard[self.tr_id].as_mut().unwrap()
    }
}

/// One typed table of per-entity values. Cloning yields another handle
/// to the same table.
pub struct Component<T: 'static> {
    c_inner: Arc<TableInner<T>>,
}

impl<T: 'static> Clone for Component<T> {
    fn clone(&self) -> Self {
        Self {
            c_inner: self.c_inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Component<T> {
    /// Set the value of this component for an entity, replacing any
    /// previous value.
    pub fn set(&self, entity: &Entity, value: T) {
        let mut data = self.c_inner.t_data.write().unwrap();
        let id = entity.get_raw_id();
        if id >= data.len() {
            data.resize_with(id + 1, || None);
        }
        data[id] = Some(value);
    }

    pub fn has(&self, entity: &Entity) -> bool {
        let data = self.c_inner.t_data.read().unwrap();
        let id = entity.get_raw_id();
        id < data.len() && data[id].is_some()
    }

    pub fn get(&self, entity: &Entity) -> Option<TableRef<T>> {
        let guard = self.c_inner.t_data.read().unwrap();
        let id = entity.get_raw_id();
        if id >= guard.len() || guard[id].is_none() {
            return None;
        }

        Some(TableRef {
            tr_guard: guard,
            tr_id: id,
        })
    }

    pub fn get_mut(&self, entity: &Entity) -> Option<TableRefMut<T>> {
        let guard = self.c_inner.t_data.write().unwrap();
        let id = entity.get_raw_id();
        if id >= guard.len() || guard[id].is_none() {
            return None;
        }

        Some(TableRefMut {
            tr_guard: guard,
            tr_id: id,
        })
    }

    /// Remove and return the value stored for an entity.
    pub fn take(&self, entity: &Entity) -> Option<T> {
        let mut data = self.c_inner.t_data.write().unwrap();
        let id = entity.get_raw_id();
        if id >= data.len() {
            return None;
        }
        data[id].take()
    }

    /// Visit every live value in this table in raw id order.
    pub fn for_each<F: FnMut(usize, &T)>(&self, mut func: F) {
        let data = self.c_inner.t_data.read().unwrap();
        for (id, val) in data.iter().enumerate() {
            if let Some(v) = val {
                func(id, v);
            }
        }
    }

    /// Visit every live value in this table mutably, in raw id order.
    pub fn for_each_mut<F: FnMut(usize, &mut T)>(&self, mut func: F) {
        let mut data = self.c_inner.t_data.write().unwrap();
        for (id, val) in data.iter_mut().enumerate() {
            if let Some(v) = val {
                func(id, v);
            }
        }
    }

    /// The number of live values in this table.
    pub fn len(&self) -> usize {
        let data = self.c_inner.t_data.read().unwrap();
        data.iter().filter(|v| v.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
