//! Striped per-identity write locks
//!
//! Writers to one identity serialise on the stripe the identity hashes to.
//! Multi-identity writers take stripes in ascending order, which rules out
//! lock-order cycles between them.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::model::IndexKey;

pub struct KeyLockTable {
    stripes: Box<[Mutex<()>]>,
    mask: usize,
}

/// Stripes held by one writer; released on drop
pub struct StripeGuards<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl KeyLockTable {
    pub fn new(stripes: usize) -> Self {
        let count = stripes.max(1).next_power_of_two();
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
            mask: count - 1,
        }
    }

    fn stripe_of(&self, key: &IndexKey) -> usize {
        // Use the high bits so stripes do not line up with index shards
        ((key.combined_hash() >> 32) as usize) & self.mask
    }

    /// Lock every stripe covering `keys`, waiting at most `timeout` per stripe
    pub fn lock_all<'a, I>(&self, keys: I, timeout: Duration) -> Result<StripeGuards<'_>>
    where
        I: IntoIterator<Item = &'a IndexKey>,
    {
        let mut stripes: Vec<usize> = keys.into_iter().map(|k| self.stripe_of(k)).collect();
        stripes.sort_unstable();
        stripes.dedup();

        let mut guards = Vec::with_capacity(stripes.len());
        for stripe in stripes {
            match self.stripes[stripe].try_lock_for(timeout) {
                Some(guard) => guards.push(guard),
                None => {
                    return Err(Error::lock_timeout(format!(
                        "stripe {} not acquired within {:?}",
                        stripe, timeout
                    )))
                }
            }
        }
        Ok(StripeGuards { _guards: guards })
    }

    /// Lock the stripe of a single identity
    pub fn lock(&self, key: &IndexKey, timeout: Duration) -> Result<StripeGuards<'_>> {
        self.lock_all(std::iter::once(key), timeout)
    }
}
