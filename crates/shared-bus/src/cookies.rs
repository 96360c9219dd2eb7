//! # Cookie Registry
//!
//! Maps opaque `u64` cookies to the cancellation tokens of long-running
//! operations, so a later request can stop an operation started by an
//! earlier one.
//!
//! A cookie packs a slot index (low 32 bits, offset by one so that `0` is
//! never issued) and the slot's generation (high 32 bits). Retiring a cookie
//! bumps its slot's generation, so a reused slot hands out a different cookie
//! and a stale cookie can be told apart from one that was never issued. A slot
//! whose generation would overflow is retired instead of reused.

use parking_lot::Mutex;
use shared_types::BusError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    token: Option<CancellationToken>,
    /// Generation space used up; the slot is never handed out again.
    exhausted: bool,
}

#[derive(Debug, Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Registry of live cancellable operations.
#[derive(Debug, Default)]
pub struct CookieRegistry {
    inner: Mutex<Slots>,
}

fn encode(slot: u32, generation: u32) -> u64 {
    (u64::from(generation) << 32) | (u64::from(slot) + 1)
}

fn decode(cookie: u64) -> Option<(usize, u32)> {
    let low = (cookie & 0xFFFF_FFFF) as u32;
    let slot = low.checked_sub(1)?;
    Some((slot as usize, (cookie >> 32) as u32))
}

impl CookieRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cancellation token and return its cookie.
    ///
    /// # Errors
    ///
    /// `AlreadyCancelled` if the token was cancelled before registration.
    pub fn add(&self, token: CancellationToken) -> Result<u64, BusError> {
        if token.is_cancelled() {
            return Err(BusError::AlreadyCancelled { cookie: 0 });
        }

        let mut inner = self.inner.lock();
        let slot = match inner.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = u32::try_from(inner.slots.len()).map_err(|_| {
                    BusError::TransportFailure("cookie registry exhausted".into())
                })?;
                inner.slots.push(Slot::default());
                slot
            }
        };

        let entry = &mut inner.slots[slot as usize];
        entry.token = Some(token);
        let cookie = encode(slot, entry.generation);
        inner.live += 1;

        debug!(cookie, "Registered cancellable operation");
        Ok(cookie)
    }

    /// Look up the token behind a cookie.
    ///
    /// # Errors
    ///
    /// `UnknownCookie` if the cookie is not live.
    pub fn get(&self, cookie: u64) -> Result<CancellationToken, BusError> {
        let inner = self.inner.lock();
        decode(cookie)
            .and_then(|(slot, generation)| inner.slots.get(slot).map(|s| (s, generation)))
            .filter(|(s, generation)| s.generation == *generation)
            .and_then(|(s, _)| s.token.clone())
            .ok_or(BusError::UnknownCookie { cookie })
    }

    /// Cancel the operation behind a cookie and retire the cookie.
    ///
    /// # Errors
    ///
    /// - `AlreadyCancelled` - the cookie was issued but has been retired
    /// - `UnknownCookie` - the cookie was never issued
    pub fn cancel(&self, cookie: u64) -> Result<(), BusError> {
        let token = self.retire(cookie)?;
        token.cancel();
        debug!(cookie, "Cancelled operation");
        Ok(())
    }

    /// Retire a cookie without cancelling its operation.
    ///
    /// Used when an operation finishes on its own. Returns `false` if the
    /// cookie was not live.
    pub fn remove(&self, cookie: u64) -> bool {
        self.retire(cookie).is_ok()
    }

    fn retire(&self, cookie: u64) -> Result<CancellationToken, BusError> {
        let mut inner = self.inner.lock();
        let Some((slot, generation)) = decode(cookie) else {
            return Err(BusError::UnknownCookie { cookie });
        };
        let Some(entry) = inner.slots.get_mut(slot) else {
            return Err(BusError::UnknownCookie { cookie });
        };

        if generation > entry.generation {
            return Err(BusError::UnknownCookie { cookie });
        }
        if generation < entry.generation || entry.exhausted {
            return Err(BusError::AlreadyCancelled { cookie });
        }
        let Some(token) = entry.token.take() else {
            // Slot is free with a generation never issued for it.
            return Err(BusError::UnknownCookie { cookie });
        };

        match entry.generation.checked_add(1) {
            Some(next) => {
                entry.generation = next;
                inner.free.push(slot as u32);
            }
            None => {
                entry.exhausted = true;
                debug!(slot, "Cookie slot retired for good");
            }
        }
        inner.live -= 1;
        Ok(token)
    }

    /// Number of live cookies.
    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
