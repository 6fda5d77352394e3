// src/slab.rs
//! Fixed-capacity connection table shared by the reactor and the workers.
//!
//! Every slot carries an ownership tag. A thread may touch a slot's `Conn`
//! only through an [`Owned`] handle, which it obtains by a successful
//! compare-and-swap on the tag and gives up by handing the slot on: parking
//! it before a one-shot re-arm, queueing it for a worker, or closing it.
use crate::conn::Conn;
use crate::sync::lock;
use crate::syscalls::{Interest, Poller};
use std::cell::UnsafeCell;
use std::io;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Poll token of the listening socket. Never a valid connection token.
pub const LISTENER_TOKEN: u64 = u64::MAX;

/// Who may touch a slot right now.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Free = 0,
    /// Armed for one readiness event; nobody owns it until it fires.
    Parked = 1,
    Reactor = 2,
    /// Submitted to the pool, not yet picked up.
    Queued = 3,
    Worker = 4,
}

impl Owner {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Owner::Parked,
            2 => Owner::Reactor,
            3 => Owner::Queued,
            4 => Owner::Worker,
            _ => Owner::Free,
        }
    }
}

/// Stable connection identifier: slot index plus the slot's generation at
/// allocation time, so a stale token never resolves to a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

impl ConnId {
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    pub fn token(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_token(token: u64) -> Option<Self> {
        if token == LISTENER_TOKEN {
            return None;
        }
        Some(Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        })
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

struct Slot {
    owner: AtomicU8,
    generation: AtomicU32,
    conn: UnsafeCell<Conn>,
}

// SAFETY: `conn` is only reached through an `Owned` handle, and at most one
// handle per slot exists at a time (enforced by the CAS on `owner`).
unsafe impl Sync for Slot {}

pub struct ConnTable {
    slots: Box<[Slot]>,
    free: Mutex<Vec<u32>>,
    live: AtomicUsize,
    read_capacity: usize,
    write_capacity: usize,
}

impl ConnTable {
    /// Allocate every slot up front. Buffers are allocated lazily, the first
    /// time a slot hosts a connection, and kept afterwards.
    pub fn new(capacity: usize, read_capacity: usize, write_capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                owner: AtomicU8::new(Owner::Free as u8),
                generation: AtomicU32::new(0),
                conn: UnsafeCell::new(Conn::empty()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Reversed so the lowest index is handed out first.
        let free = (0..capacity as u32).rev().collect();

        Self {
            slots,
            free: Mutex::new(free),
            live: AtomicUsize::new(0),
            read_capacity,
            write_capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Connections currently open.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.live() >= self.capacity()
    }

    /// Take a free slot for a freshly accepted descriptor. The caller owns
    /// the result as `Owner::Reactor`.
    pub fn insert(&self, fd: RawFd, peer: Option<SocketAddr>) -> Option<Owned<'_>> {
        let index = lock(&self.free).pop()?;
        let slot = &self.slots[index as usize];

        if slot
            .owner
            .compare_exchange(Owner::Free as u8, Owner::Reactor as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(index, "free list held a slot that is in use");
            return None;
        }
        self.live.fetch_add(1, Ordering::AcqRel);

        let mut owned = Owned {
            table: self,
            index,
            generation: slot.generation.load(Ordering::Acquire),
            holder: Owner::Reactor,
        };
        let token = owned.id().token();
        let (read_cap, write_cap) = (self.read_capacity, self.write_capacity);
        owned.init(fd, peer, token, read_cap, write_cap);
        Some(owned)
    }

    /// Take ownership of `id` if it is currently held as `from`.
    pub fn claim(&self, id: ConnId, from: Owner, to: Owner) -> Option<Owned<'_>> {
        let slot = self.slots.get(id.index())?;
        if slot.generation.load(Ordering::Acquire) != id.generation {
            return None;
        }
        slot.owner
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        // The generation only moves under ownership; re-check in case the
        // slot was recycled between the two loads.
        if slot.generation.load(Ordering::Acquire) != id.generation {
            slot.owner.store(from as u8, Ordering::Release);
            return None;
        }
        Some(Owned {
            table: self,
            index: id.index,
            generation: id.generation,
            holder: to,
        })
    }

    /// Current owner of `id`, or `None` when the id is stale.
    pub fn owner_of(&self, id: ConnId) -> Option<Owner> {
        let slot = self.slots.get(id.index())?;
        if slot.generation.load(Ordering::Acquire) != id.generation {
            return None;
        }
        Some(Owner::from_u8(slot.owner.load(Ordering::Acquire)))
    }

    fn release(&self, index: u32) {
        let slot = &self.slots[index as usize];
        slot.generation.fetch_add(1, Ordering::AcqRel);
        slot.owner.store(Owner::Free as u8, Ordering::Release);
        lock(&self.free).push(index);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Close every connection still parked or queued. Only meaningful once
    /// the reactor loop has stopped and the workers have joined.
    pub fn close_all(&self, poller: &Poller) -> usize {
        let mut closed = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let id = ConnId {
                index: index as u32,
                generation: slot.generation.load(Ordering::Acquire),
            };
            let owned = self
                .claim(id, Owner::Parked, Owner::Reactor)
                .or_else(|| self.claim(id, Owner::Queued, Owner::Reactor));
            match owned {
                Some(conn) => {
                    conn.close(poller);
                    closed += 1;
                }
                None => {
                    let owner = Owner::from_u8(slot.owner.load(Ordering::Acquire));
                    if owner != Owner::Free {
                        warn!(%id, ?owner, "connection still owned at teardown");
                    }
                }
            }
        }
        closed
    }
}

/// Exclusive access to one slot's connection. Has no `Drop`: the holder
/// must hand the slot on with one of the consuming methods.
#[must_use = "an owned connection must be armed, queued, parked or closed"]
pub struct Owned<'t> {
    table: &'t ConnTable,
    index: u32,
    generation: u32,
    holder: Owner,
}

/// A re-arm that failed. The connection is owned again by the caller.
#[derive(Debug)]
pub struct ArmFailed<'t> {
    pub conn: Owned<'t>,
    pub error: io::Error,
}

impl<'t> Owned<'t> {
    pub fn id(&self) -> ConnId {
        ConnId {
            index: self.index,
            generation: self.generation,
        }
    }

    pub fn holder(&self) -> Owner {
        self.holder
    }

    fn slot(&self) -> &'t Slot {
        &self.table.slots[self.index as usize]
    }

    fn set_owner(&self, owner: Owner) {
        self.slot().owner.store(owner as u8, Ordering::Release);
    }

    /// Register a new connection for one readiness event.
    pub fn register(self, poller: &Poller, interest: Interest) -> Result<(), ArmFailed<'t>> {
        let (fd, token) = (self.fd(), self.id().token());
        self.set_owner(Owner::Parked);
        poller
            .register(fd, token, interest, true)
            .map_err(|error| self.reclaim(error))
    }

    /// Re-arm for one readiness event. Parks first: once the kernel has the
    /// new interest the event may fire on another thread immediately.
    pub fn arm(self, poller: &Poller, interest: Interest) -> Result<(), ArmFailed<'t>> {
        let (fd, token) = (self.fd(), self.id().token());
        self.set_owner(Owner::Parked);
        poller
            .rearm(fd, token, interest)
            .map_err(|error| self.reclaim(error))
    }

    // A failed epoll_ctl leaves nothing armed, so no one else can have
    // claimed the slot in between.
    fn reclaim(self, error: io::Error) -> ArmFailed<'t> {
        self.set_owner(self.holder);
        ArmFailed { conn: self, error }
    }

    /// Hand the connection to the task queue.
    pub fn enqueue(self) -> ConnId {
        self.set_owner(Owner::Queued);
        self.id()
    }

    /// Give up ownership without arming. Only the teardown sweep reaches a
    /// connection parked this way.
    pub fn park(self) {
        self.set_owner(Owner::Parked);
    }

    /// Close the descriptor and return the slot to the free list.
    pub fn close(mut self, poller: &Poller) {
        let id = self.id();
        if !self.deref_mut().close(poller) {
            debug!(%id, "slot released with descriptor already closed");
        }
        self.table.release(self.index);
    }
}

impl Deref for Owned<'_> {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        // SAFETY: this handle won the ownership CAS and has not handed on.
        unsafe { &*self.slot().conn.get() }
    }
}

impl DerefMut for Owned<'_> {
    fn deref_mut(&mut self) -> &mut Conn {
        // SAFETY: as above; `&mut self` rules out aliasing through this handle.
        unsafe { &mut *self.slot().conn.get() }
    }
}

impl std::fmt::Debug for Owned<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Owned")
            .field("id", &self.id())
            .field("holder", &self.holder)
            .finish()
    }
}
