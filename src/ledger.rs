//! Correlation ledger: a fixed ring of slots for probes in flight.
//!
//! # Identifier space
//! Probe identifiers occupy the low 40 bits of the 8-byte payload
//! ([`ID_MASK`]). The emitter wraps identifiers at a boundary rounded down
//! to a multiple of the ring capacity, so `id % capacity` maps every live
//! identifier to a distinct slot even across the wrap.
//!
//! # Concurrency
//! All slot access goes through [`Ledger::lock`]. The guard hands out
//! [`SlotRef`] handles whose lifetime is tied to the lock, so a caller's
//! check-then-update sequence on a slot cannot be interleaved with another
//! role's: the identifier re-check and the flag update happen under one
//! critical section by construction.

use std::sync::{Mutex, MutexGuard};

use crate::time::Stamp;

/// Low 40 bits of the payload carry the probe identifier.
pub const ID_MASK: u64 = 0x0000_00ff_ffff_ffff;

/// Largest raw identifier value.
pub const ID_MAX: u64 = ID_MASK;

/// Decodes a probe identifier from the start of `payload`.
///
/// Returns `None` when fewer than eight bytes are present. Bits above the
/// identifier space are discarded.
#[must_use]
pub fn read_probe_id(payload: &[u8]) -> Option<u64> {
    if payload.len() < 8 {
        return None;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&payload[..8]);
    Some(u64::from_ne_bytes(raw) & ID_MASK)
}

/// Encodes `id` into its 8-byte wire form.
#[inline]
#[must_use]
pub fn probe_payload(id: u64) -> [u8; 8] {
    (id & ID_MASK).to_ne_bytes()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SlotFlags(u8);

impl SlotFlags {
    const TIMESTAMPED: u8 = 1 << 0;
    const RECEIVED: u8 = 1 << 1;
    const COMPLETE: u8 = Self::TIMESTAMPED | Self::RECEIVED;

    #[inline]
    fn has(self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    #[inline]
    fn set(&mut self, bits: u8) {
        self.0 |= bits;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    id: u64,
    flags: SlotFlags,
    send_ts: Stamp,
    recv_ts: Stamp,
}

/// A completed round trip: both kernel timestamps present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub id: u64,
    pub send_ts: Stamp,
    pub recv_ts: Stamp,
}

impl Measurement {
    /// Round-trip duration, receive stamp minus send stamp.
    #[must_use]
    pub fn latency(&self) -> Stamp {
        self.recv_ts.since(self.send_ts)
    }
}

/// Outcome of claiming the next ring slot for a fresh probe.
#[derive(Debug)]
pub struct Claimed {
    /// Ring index the probe was assigned.
    pub index: usize,
    /// Completed measurement evicted from the slot, when the previous
    /// occupant finished its round trip before being recycled.
    pub recycled: Option<Measurement>,
}

struct Ring {
    slots: Box<[Slot]>,
    cursor: usize,
}

/// Shared registry of probes in flight.
pub struct Ledger {
    capacity: usize,
    boundary: u64,
    ring: Mutex<Ring>,
}

impl Ledger {
    /// Builds a ledger with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or exceeds the identifier space.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ledger capacity must be nonzero");
        assert!(
            capacity as u64 <= ID_MAX,
            "ledger capacity exceeds the identifier space"
        );
        let boundary = (ID_MAX / capacity as u64) * capacity as u64;
        Self {
            capacity,
            boundary,
            ring: Mutex::new(Ring {
                slots: vec![Slot::default(); capacity].into_boxed_slice(),
                cursor: 0,
            }),
        }
    }

    /// Number of slots in the ring.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Identifier wrap point: the largest multiple of the capacity that
    /// fits the identifier space. Identifiers at or above it are invalid.
    #[inline]
    #[must_use]
    pub const fn id_boundary(&self) -> u64 {
        self.boundary
    }

    /// Takes the ledger lock.
    pub fn lock(&self) -> LedgerGuard<'_> {
        LedgerGuard {
            ring: self.ring.lock().expect("ledger lock poisoned"),
        }
    }
}

/// Exclusive access to the ring. All slot operations live here.
pub struct LedgerGuard<'a> {
    ring: MutexGuard<'a, Ring>,
}

impl LedgerGuard<'_> {
    /// Overwrites the slot under the cursor with a fresh entry for `id`,
    /// clearing its flags, and advances the cursor cyclically.
    ///
    /// When the evicted occupant had completed its round trip, the finished
    /// measurement is handed back so deferred-reporting callers can forward
    /// it.
    pub fn claim_next(&mut self, id: u64) -> Claimed {
        let index = self.ring.cursor;
        let slot = &mut self.ring.slots[index];
        let recycled = slot.flags.has(SlotFlags::COMPLETE).then(|| Measurement {
            id: slot.id,
            send_ts: slot.send_ts,
            recv_ts: slot.recv_ts,
        });
        slot.id = id;
        slot.flags = SlotFlags::default();
        self.ring.cursor += 1;
        if self.ring.cursor == self.ring.slots.len() {
            self.ring.cursor = 0;
        }
        Claimed { index, recycled }
    }

    /// Slot handle for `id`.
    ///
    /// The mapping is `id % capacity`; the caller must compare
    /// [`SlotRef::id`] against the identifier it was looking for before
    /// trusting the contents, since the slot may have been recycled for a
    /// newer probe.
    pub fn lookup(&mut self, id: u64) -> SlotRef<'_> {
        let index = (id % self.ring.slots.len() as u64) as usize;
        SlotRef {
            slot: &mut self.ring.slots[index],
        }
    }

    /// Completed round trips still parked in the ring, oldest first.
    #[must_use]
    pub fn completed(&self) -> Vec<Measurement> {
        let len = self.ring.slots.len();
        let mut out = Vec::new();
        for offset in 0..len {
            let slot = &self.ring.slots[(self.ring.cursor + offset) % len];
            if slot.flags.has(SlotFlags::COMPLETE) {
                out.push(Measurement {
                    id: slot.id,
                    send_ts: slot.send_ts,
                    recv_ts: slot.recv_ts,
                });
            }
        }
        out
    }
}

/// Mutable view of one slot, valid only while the ledger lock is held.
pub struct SlotRef<'g> {
    slot: &'g mut Slot,
}

impl SlotRef<'_> {
    /// Identifier currently stored in the slot.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    #[inline]
    #[must_use]
    pub fn is_timestamped(&self) -> bool {
        self.slot.flags.has(SlotFlags::TIMESTAMPED)
    }

    #[inline]
    #[must_use]
    pub fn is_received(&self) -> bool {
        self.slot.flags.has(SlotFlags::RECEIVED)
    }

    /// Kernel transmit timestamp. Meaningful only after
    /// [`SlotRef::is_timestamped`] returns true.
    #[inline]
    #[must_use]
    pub fn send_ts(&self) -> Stamp {
        self.slot.send_ts
    }

    /// Records the kernel transmit timestamp.
    pub fn mark_timestamped(&mut self, ts: Stamp) {
        self.slot.send_ts = ts;
        self.slot.flags.set(SlotFlags::TIMESTAMPED);
    }

    /// Records the kernel receive timestamp, completing the round trip.
    pub fn mark_received(&mut self, ts: Stamp) {
        self.slot.recv_ts = ts;
        self.slot.flags.set(SlotFlags::RECEIVED);
    }
}
