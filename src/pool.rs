//! Bounded slab pool with generational ids.
//!
//! Replaces the original firmware's fixed C arrays of structs plus
//! hand-rolled `used`/`ready` bit flags and a linear free-list scan. Each
//! slot carries a monotonically increasing `session_id` generation so a
//! stale reference to a freed-and-reused slot is rejected instead of
//! silently aliasing a new occupant (DESIGN NOTES §9).
//!
//! A slot is considered alive iff its state is `Ready` *and* the
//! caller's remembered id matches the slot's current generation —
//! mirroring "a pool slot is considered alive iff both its `used` and
//! `ready` flags are set."

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{PoolError, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Writing,
    Ready,
}

struct Slot<T> {
    state: SlotState,
    generation: u64,
    value: Option<T>,
}

/// A fixed-capacity pool of slots, each identified by `(index,
/// generation)`. Ids are strictly increasing across the pool's lifetime,
/// matching "session and packet ids are strictly increasing."
pub struct Pool<T> {
    slots: Mutex<Vec<Slot<T>>>,
    free: Mutex<VecDeque<usize>>,
    next_generation: Mutex<u64>,
}

/// Opaque handle identifying a live slot. Two handles never compare equal
/// unless they name the same allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId {
    pub index: usize,
    pub generation: u64,
}

impl PoolId {
    /// Pack into a single `u64` correlator (generation in the high bits,
    /// index in the low 32) so events that only carry a bare integer
    /// (e.g. `RadioEvent::PacketSent`'s downlink reference) can name a
    /// specific allocation without risking ABA against a freed-and-reused
    /// index.
    pub fn to_u64(self) -> u64 {
        (self.generation << 32) | (self.index as u64 & 0xFFFF_FFFF)
    }

    pub fn from_u64(packed: u64) -> Self {
        Self {
            index: (packed & 0xFFFF_FFFF) as usize,
            generation: packed >> 32,
        }
    }
}

impl<T> Pool<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut free = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                state: SlotState::Empty,
                generation: 0,
                value: None,
            });
            free.push_back(i);
        }
        Self {
            slots: Mutex::new(slots),
            free: Mutex::new(free),
            next_generation: Mutex::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn len(&self) -> usize {
        self.capacity() - self.free.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a slot in the `Writing` state (not yet visible to other
    /// tasks as ready). Returns `PoolError` if no free slot exists.
    pub fn allocate_writing(&self, value: T) -> Result<PoolId, PoolError> {
        let index = self.free.lock().unwrap().pop_front().ok_or(PoolError)?;
        let generation = {
            let mut next = self.next_generation.lock().unwrap();
            let g = *next;
            *next += 1;
            g
        };
        let mut slots = self.slots.lock().unwrap();
        slots[index] = Slot {
            state: SlotState::Writing,
            generation,
            value: Some(value),
        };
        Ok(PoolId { index, generation })
    }

    /// Mark a `Writing` slot `Ready`, making it visible to other tasks.
    /// Must be called after the slot's fields have been fully populated
    /// ("the session's `ready` flag is set last so other tasks see a
    /// fully-initialized record"). A slot not currently `Writing` (a
    /// double `mark_ready`, or one racing a concurrent release) means a
    /// session field was touched outside its owning worker; that is
    /// logged as a `SessionError::InvariantViolation` and the slot is
    /// left untouched rather than silently overwriting its state.
    pub fn mark_ready(&self, id: PoolId) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(id.index) {
            if slot.generation == id.generation {
                if slot.state != SlotState::Writing {
                    let violation = SessionError::InvariantViolation(format!(
                        "mark_ready on slot {} in state {:?}, expected Writing",
                        id.index, slot.state
                    ));
                    tracing::error!(error = %violation, "pool invariant violation");
                    return;
                }
                slot.state = SlotState::Ready;
            }
        }
    }

    /// True iff `id` names a currently `Ready` slot.
    pub fn is_ready(&self, id: PoolId) -> bool {
        let slots = self.slots.lock().unwrap();
        slots
            .get(id.index)
            .is_some_and(|s| s.generation == id.generation && s.state == SlotState::Ready)
    }

    /// Run `f` against the slot's value if it is alive (`Ready` and
    /// matching generation). Returns `None` if the slot was released or
    /// reused.
    pub fn with<R>(&self, id: PoolId, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(id.index)?;
        if slot.generation != id.generation || slot.state != SlotState::Ready {
            return None;
        }
        slot.value.as_ref().map(f)
    }

    /// Mutate the slot's value in place if it is alive.
    pub fn with_mut<R>(&self, id: PoolId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(id.index)?;
        if slot.generation != id.generation || slot.state != SlotState::Ready {
            return None;
        }
        slot.value.as_mut().map(f)
    }

    /// Release a slot exactly once. A second release (or a release with
    /// a stale generation) is a no-op, which is what lets
    /// `process_session_event(released)` on an already-released
    /// transaction stay idempotent.
    pub fn release(&self, id: PoolId) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(id.index) {
            if slot.generation == id.generation && slot.state != SlotState::Empty {
                slot.state = SlotState::Empty;
                slot.value = None;
                drop(slots);
                self.free.lock().unwrap().push_back(id.index);
            }
        }
    }

    /// Snapshot of every currently-ready id, for periodic sweeps.
    pub fn ready_ids(&self) -> Vec<PoolId> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Ready)
            .map(|(index, s)| PoolId {
                index,
                generation: s.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_ready_then_release_cycle() {
        let pool: Pool<u32> = Pool::with_capacity(2);
        let id = pool.allocate_writing(42).unwrap();
        assert!(!pool.is_ready(id));
        pool.mark_ready(id);
        assert!(pool.is_ready(id));
        assert_eq!(pool.with(id, |v| *v), Some(42));
        pool.release(id);
        assert!(!pool.is_ready(id));
        assert_eq!(pool.with(id, |v| *v), None);
    }

    #[test]
    fn exhaustion_is_recoverable_and_next_allocation_succeeds_after_release() {
        let pool: Pool<u32> = Pool::with_capacity(1);
        let id = pool.allocate_writing(1).unwrap();
        assert_eq!(pool.allocate_writing(2), Err(PoolError));
        pool.release(id);
        assert!(pool.allocate_writing(3).is_ok());
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let pool: Pool<u32> = Pool::with_capacity(4);
        let a = pool.allocate_writing(1).unwrap();
        let b = pool.allocate_writing(2).unwrap();
        assert!(b.generation > a.generation);
    }

    #[test]
    fn stale_generation_is_rejected_after_reuse() {
        let pool: Pool<u32> = Pool::with_capacity(1);
        let a = pool.allocate_writing(1).unwrap();
        pool.mark_ready(a);
        pool.release(a);
        let b = pool.allocate_writing(2).unwrap();
        pool.mark_ready(b);
        // `a` referenced the same index but an earlier generation.
        assert!(!pool.is_ready(a));
        assert_eq!(pool.with(a, |v| *v), None);
        assert_eq!(pool.with(b, |v| *v), Some(2));
    }

    #[test]
    fn double_release_is_a_no_op() {
        let pool: Pool<u32> = Pool::with_capacity(1);
        let id = pool.allocate_writing(1).unwrap();
        pool.mark_ready(id);
        pool.release(id);
        pool.release(id); // must not panic or free the slot twice
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn one_slot_away_from_full_is_admitted() {
        let pool: Pool<u32> = Pool::with_capacity(2);
        pool.allocate_writing(1).unwrap();
        assert!(pool.allocate_writing(2).is_ok());
    }

    #[test]
    fn mark_ready_on_a_non_writing_slot_is_rejected_not_applied() {
        let pool: Pool<u32> = Pool::with_capacity(1);
        let id = pool.allocate_writing(1).unwrap();
        pool.mark_ready(id);
        assert!(pool.is_ready(id));
        pool.release(id);
        // `id`'s slot is now `Empty` under a stale generation; a second
        // `mark_ready` for the same id must not resurrect it.
        pool.mark_ready(id);
        assert!(!pool.is_ready(id));
    }

    #[test]
    fn pool_id_round_trips_through_u64_packing() {
        let id = PoolId {
            index: 7,
            generation: 42,
        };
        assert_eq!(PoolId::from_u64(id.to_u64()), id);
    }
}
