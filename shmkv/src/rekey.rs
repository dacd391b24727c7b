//! Changing the key of a store that several processes hold.
//!
//! Exactly one process rotates the key: it re-encrypts every value in place. Every other holder
//! then only swaps the key it reads and writes with. Telling those peers is up to the
//! application; a [`PendingRekey`] is what it has to pass along. Two processes rotating the key
//! of one store concurrently is a race; hold the store's lock around the rotation to prevent it.
use zeroize::Zeroizing;

use crate::error::Result;
use crate::{Kv, StoreId};

/// A completed key rotation that peers have yet to apply.
pub struct PendingRekey {
    id: StoreId,
    new_key: Zeroizing<String>,
    epoch: u32,
}

impl PendingRekey {
    pub fn id(&self) -> &StoreId {
        &self.id
    }

    /// The new key, empty if the store is no longer encrypted.
    pub fn new_key(&self) -> &str {
        &self.new_key
    }

    /// How many rotations the store had seen with this one.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Switch `peer` to the new key.
    ///
    /// Returns `false` without changing anything if `peer` is another store, or if a later
    /// rotation superseded this one.
    pub fn apply(&self, peer: &Kv) -> Result<bool> {
        if peer.id() != &self.id {
            return Ok(false);
        }

        let current = peer.store().key_epoch()?;
        if current != self.epoch {
            tracing::info!(id = %self.id, pending = self.epoch, current, "skipping superseded key rotation");
            return Ok(false);
        }

        reset_key_only(peer, &self.new_key)?;
        Ok(true)
    }
}

impl core::fmt::Debug for PendingRekey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PendingRekey")
            .field("id", &self.id)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

pub(crate) fn rotate_key(kv: &Kv, new_key: &str) -> Result<PendingRekey> {
    let epoch = kv.store().rekey(new_key)?;
    tracing::info!(id = %kv.id(), epoch, encrypted = !new_key.is_empty(), "rotated store key");

    Ok(PendingRekey {
        id: kv.id().clone(),
        new_key: Zeroizing::new(new_key.to_owned()),
        epoch,
    })
}

pub(crate) fn reset_key_only(kv: &Kv, new_key: &str) -> Result<()> {
    kv.store().reset_key(new_key)?;
    tracing::info!(id = %kv.id(), encrypted = !new_key.is_empty(), "reset store key");
    Ok(())
}
