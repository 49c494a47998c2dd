//! UTXO reservations.
//!
//! An outpoint referenced by an in-flight transaction is reserved until the
//! transaction confirms (`commit`, outpoints become spent) or is abandoned
//! (`release`). Reservations are all-or-nothing.

use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::OutPoint;

/// Handle for one reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct State {
    reservations: HashMap<ReservationId, Vec<OutPoint>>,
    reserved: HashMap<OutPoint, ReservationId>,
    spent: HashSet<OutPoint>,
}

/// Thread-safe reservation table.
#[derive(Default)]
pub struct UtxoReservations {
    state: Mutex<State>,
}

impl UtxoReservations {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves all of `outpoints` or none of them.
    ///
    /// # Errors
    /// `UtxoReserved` naming the first outpoint that is already reserved or spent.
    pub fn reserve(&self, outpoints: &[OutPoint]) -> Result<ReservationId> {
        let mut state = self.state.lock();

        let mut seen = HashSet::with_capacity(outpoints.len());
        for op in outpoints {
            if state.reserved.contains_key(op) || state.spent.contains(op) || !seen.insert(*op) {
                return Err(KestrelError::UtxoReserved(op.to_string()));
            }
        }

        let id = ReservationId::new();
        for op in outpoints {
            state.reserved.insert(*op, id);
        }
        state.reservations.insert(id, outpoints.to_vec());
        debug!(reservation = %id, count = outpoints.len(), "UTXOs reserved");
        Ok(id)
    }

    /// Releases a reservation. Returns false if it was unknown.
    pub fn release(&self, id: ReservationId) -> bool {
        let mut state = self.state.lock();
        match state.reservations.remove(&id) {
            Some(outpoints) => {
                for op in outpoints {
                    state.reserved.remove(&op);
                }
                debug!(reservation = %id, "Reservation released");
                true
            }
            None => false,
        }
    }

    /// Marks a reservation's outpoints as spent.
    pub fn commit(&self, id: ReservationId) -> Result<()> {
        let mut state = self.state.lock();
        let outpoints = state
            .reservations
            .remove(&id)
            .ok_or_else(|| KestrelError::not_found("reservation", id.to_string()))?;
        for op in outpoints {
            state.reserved.remove(&op);
            state.spent.insert(op);
        }
        debug!(reservation = %id, "Reservation committed");
        Ok(())
    }

    /// Marks outpoints as spent without a prior reservation.
    pub fn mark_spent(&self, outpoints: &[OutPoint]) {
        let mut state = self.state.lock();
        for op in outpoints {
            if let Some(id) = state.reserved.remove(op) {
                state.reservations.remove(&id);
            }
            state.spent.insert(*op);
        }
    }

    /// True if `outpoint` is held by a live reservation.
    pub fn is_reserved(&self, outpoint: &OutPoint) -> bool {
        self.state.lock().reserved.contains_key(outpoint)
    }

    /// True if `outpoint` was committed as spent.
    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.state.lock().spent.contains(outpoint)
    }

    /// True if `outpoint` is neither reserved nor spent.
    pub fn is_available(&self, outpoint: &OutPoint) -> bool {
        let state = self.state.lock();
        !state.reserved.contains_key(outpoint) && !state.spent.contains(outpoint)
    }

    /// Outpoints held by `id`.
    pub fn outpoints(&self, id: ReservationId) -> Option<Vec<OutPoint>> {
        self.state.lock().reservations.get(&id).cloned()
    }

    /// Number of live reservations.
    pub fn active(&self) -> usize {
        self.state.lock().reservations.len()
    }
}

impl fmt::Debug for UtxoReservations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("UtxoReservations")
            .field("active", &state.reservations.len())
            .field("spent", &state.spent.len())
            .finish()
    }
}
