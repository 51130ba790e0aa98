//! Handle registry with release tracking.
//!
//! A [`HandleTable`] owns the native objects behind one kind of handle.
//! Slots are append-only and never reused: once an object is released its
//! slot stays in the `Released` state, so a stale or repeated handle is
//! reported as [`ComputeError::AlreadyReleased`] instead of reaching the
//! driver.

use crate::error::{ComputeError, ComputeResult};
use crate::handle::Handle;

enum Slot<T> {
    Live(T),
    Released,
}

/// Table of live and released objects addressed by typed handles.
pub struct HandleTable<H: Handle, T> {
    slots: Vec<Slot<T>>,
    _handle: std::marker::PhantomData<H>,
}

impl<H: Handle, T> HandleTable<H, T> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            _handle: std::marker::PhantomData,
        }
    }

    /// Store an object and return its handle.
    pub fn insert(&mut self, value: T) -> H {
        let handle = H::from_index(self.slots.len());
        self.slots.push(Slot::Live(value));
        handle
    }

    /// Borrow a live object.
    pub fn get(&self, handle: H) -> ComputeResult<&T> {
        match self.slots.get(handle.index()) {
            Some(Slot::Live(value)) => Ok(value),
            Some(Slot::Released) => Err(released::<H>(handle)),
            None => Err(unknown::<H>(handle)),
        }
    }

    /// Mutably borrow a live object.
    pub fn get_mut(&mut self, handle: H) -> ComputeResult<&mut T> {
        match self.slots.get_mut(handle.index()) {
            Some(Slot::Live(value)) => Ok(value),
            Some(Slot::Released) => Err(released::<H>(handle)),
            None => Err(unknown::<H>(handle)),
        }
    }

    /// Release an object, handing it back so the caller can drop it.
    pub fn release(&mut self, handle: H) -> ComputeResult<T> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or_else(|| unknown::<H>(handle))?;

        match std::mem::replace(slot, Slot::Released) {
            Slot::Live(value) => Ok(value),
            Slot::Released => Err(released::<H>(handle)),
        }
    }

    /// Release every live object matching `predicate`, in insertion order.
    pub fn release_where<F>(&mut self, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut released = Vec::new();
        for slot in &mut self.slots {
            if matches!(slot, Slot::Live(value) if predicate(value)) {
                if let Slot::Live(value) = std::mem::replace(slot, Slot::Released) {
                    released.push(value);
                }
            }
        }
        released
    }

    /// Check whether the handle refers to a live object.
    pub fn is_live(&self, handle: H) -> bool {
        matches!(self.slots.get(handle.index()), Some(Slot::Live(_)))
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    /// Iterate over live objects in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Live(value) => Some((H::from_index(index), value)),
                Slot::Released => None,
            })
    }
}

impl<H: Handle, T> Default for HandleTable<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

fn released<H: Handle>(handle: H) -> ComputeError {
    ComputeError::AlreadyReleased {
        kind: H::KIND,
        raw: handle.raw(),
    }
}

fn unknown<H: Handle>(handle: H) -> ComputeError {
    ComputeError::UnknownHandle {
        kind: H::KIND,
        raw: handle.raw(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{HandleKind, MemHandle};

    #[test]
    fn test_insert_and_get() {
        let mut table: HandleTable<MemHandle, &str> = HandleTable::new();
        let a = table.insert("a");
        let b = table.insert("b");

        assert_ne!(a, b);
        assert_eq!(*table.get(a).unwrap(), "a");
        assert_eq!(*table.get(b).unwrap(), "b");
        assert_eq!(table.live_count(), 2);
    }

    #[test]
    fn test_double_release_is_reported() {
        let mut table: HandleTable<MemHandle, Vec<u8>> = HandleTable::new();
        let handle = table.insert(vec![0u8; 16]);

        assert_eq!(table.release(handle).unwrap().len(), 16);
        assert!(!table.is_live(handle));

        let err = table.release(handle).unwrap_err();
        assert_eq!(
            err,
            ComputeError::AlreadyReleased {
                kind: HandleKind::Memory,
                raw: handle.raw()
            }
        );
        assert!(table.get(handle).unwrap_err().is_released());
    }

    #[test]
    fn test_slots_are_not_reused() {
        let mut table: HandleTable<MemHandle, u32> = HandleTable::new();
        let first = table.insert(1);
        table.release(first).unwrap();
        let second = table.insert(2);

        assert_ne!(first, second);
        assert_eq!(second.index(), 1);
        assert_eq!(table.live_count(), 1);
        assert_eq!(table.iter().map(|(h, _)| h).collect::<Vec<_>>(), vec![second]);
    }

    #[test]
    fn test_release_where() {
        let mut table: HandleTable<MemHandle, u32> = HandleTable::new();
        let handles: Vec<_> = (0..5).map(|v| table.insert(v)).collect();

        let released = table.release_where(|v| v % 2 == 0);
        assert_eq!(released, vec![0, 2, 4]);
        assert!(table.is_live(handles[1]));
        assert!(table.get(handles[2]).unwrap_err().is_released());
        assert!(table.release_where(|v| v % 2 == 0).is_empty());
    }

    #[test]
    fn test_unknown_handle() {
        let table: HandleTable<MemHandle, u32> = HandleTable::new();
        let err = table.get(MemHandle::from_index(7)).unwrap_err();
        assert!(matches!(err, ComputeError::UnknownHandle { .. }));
    }
}
