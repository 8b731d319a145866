// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! A read-through cache of a fixed set of device registers.
//!
//! Device telemetry is read in passes: every register of the set, in a fixed
//! order. A [`CachedSnapshot`] remembers the values from the last pass and
//! when it completed, and only goes back to the bus once the refresh interval
//! has elapsed or the snapshot has been invalidated.
//!
//! The snapshot's lock is also the device's lock. Writes to the device are
//! made through [`CachedSnapshot::write`], so they never interleave with a
//! refresh pass, and they invalidate the snapshot so the next read sees the
//! effect of the write.

use crate::Error;
use slog::debug;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

/// How a refresh pass handles a failed read.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RefreshPolicy {
    /// Abort the pass at the first failure and invalidate the snapshot.
    #[default]
    Strict,
    /// Keep the previous value of any register which cannot be read, and
    /// complete the pass.
    Lenient,
}

/// The values read by one refresh pass.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot<K, V> {
    values: BTreeMap<K, V>,
    refreshed_at: Instant,
}

impl<K: Ord + Copy, V: Copy + Default> Snapshot<K, V> {
    /// Return the value of `key`.
    ///
    /// Keys outside the snapshot's register set, and registers which have
    /// never been read under the lenient policy, read as the default.
    pub fn get(&self, key: K) -> V {
        self.values.get(&key).copied().unwrap_or_default()
    }

    pub fn refreshed_at(&self) -> Instant {
        self.refreshed_at
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, V)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }
}

#[derive(Debug)]
struct State<K, V> {
    values: BTreeMap<K, V>,
    valid: bool,
    last_refresh: Option<Instant>,
}

impl<K: Ord + Copy, V: Copy> State<K, V> {
    fn is_fresh(&self, interval: Duration) -> bool {
        self.valid
            && self
                .last_refresh
                .is_some_and(|when| when.elapsed() < interval)
    }

    fn snapshot(&self) -> Option<Snapshot<K, V>> {
        self.last_refresh.map(|refreshed_at| Snapshot {
            values: self.values.clone(),
            refreshed_at,
        })
    }

    fn commit(&mut self) -> Snapshot<K, V> {
        let now = Instant::now();
        self.valid = true;
        self.last_refresh = Some(now);
        Snapshot {
            values: self.values.clone(),
            refreshed_at: now,
        }
    }
}

/// A cache of the registers `K` of one device, holding values `V`.
#[derive(Debug)]
pub struct CachedSnapshot<K, V> {
    keys: Vec<K>,
    interval: Duration,
    policy: RefreshPolicy,
    state: Mutex<State<K, V>>,
    log: Logger,
}

impl<K, V> CachedSnapshot<K, V>
where
    K: Ord + Copy + Debug,
    V: Copy + Default,
{
    /// Create an empty, invalid snapshot of the registers `keys`, read in the
    /// order given.
    pub fn new(
        keys: impl IntoIterator<Item = K>,
        interval: Duration,
        policy: RefreshPolicy,
        log: &Logger,
    ) -> Self {
        Self {
            keys: keys.into_iter().collect(),
            interval,
            policy,
            state: Mutex::new(State {
                values: BTreeMap::new(),
                valid: false,
                last_refresh: None,
            }),
            log: log.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Return true if the snapshot holds values from a completed pass which
    /// has not been invalidated.
    pub fn is_valid(&self) -> bool {
        self.lock().valid
    }

    /// Return the cached values, reading every register with `read` first if
    /// the snapshot is stale.
    pub fn refresh<F>(&self, mut read: F) -> Result<Snapshot<K, V>, Error>
    where
        F: FnMut(K) -> Result<V, Error>,
    {
        let mut state = self.lock();
        if state.is_fresh(self.interval) {
            if let Some(snapshot) = state.snapshot() {
                return Ok(snapshot);
            }
        }
        debug!(self.log, "refreshing snapshot"; "registers" => self.keys.len());
        match self.policy {
            RefreshPolicy::Strict => {
                let mut values = BTreeMap::new();
                for key in self.keys.iter().copied() {
                    match read(key) {
                        Ok(value) => {
                            values.insert(key, value);
                        }
                        Err(e) => {
                            state.valid = false;
                            warn!(
                                self.log,
                                "snapshot refresh failed";
                                "register" => ?key,
                                "reason" => %e,
                            );
                            return Err(e);
                        }
                    }
                }
                state.values = values;
            }
            RefreshPolicy::Lenient => {
                for key in self.keys.iter().copied() {
                    match read(key) {
                        Ok(value) => {
                            state.values.insert(key, value);
                        }
                        Err(e) => {
                            warn!(
                                self.log,
                                "register read failed, keeping previous value";
                                "register" => ?key,
                                "reason" => %e,
                            );
                            state.values.entry(key).or_default();
                        }
                    }
                }
            }
        }
        Ok(state.commit())
    }

    /// Return the cached values, replacing them with the result of `fetch`
    /// first if the snapshot is stale.
    ///
    /// This is for devices where one transaction yields every value. Under
    /// the lenient policy, a failed fetch or any key missing from its result
    /// keeps the previous value.
    pub fn refresh_batch<F>(&self, fetch: F) -> Result<Snapshot<K, V>, Error>
    where
        F: FnOnce() -> Result<BTreeMap<K, V>, Error>,
    {
        let mut state = self.lock();
        if state.is_fresh(self.interval) {
            if let Some(snapshot) = state.snapshot() {
                return Ok(snapshot);
            }
        }
        debug!(self.log, "refreshing snapshot"; "registers" => self.keys.len());
        let fetched = match fetch() {
            Ok(values) => values,
            Err(e) => {
                warn!(self.log, "snapshot refresh failed"; "reason" => %e);
                if self.policy == RefreshPolicy::Strict {
                    state.valid = false;
                    return Err(e);
                }
                BTreeMap::new()
            }
        };
        match self.policy {
            RefreshPolicy::Strict => {
                if let Some(missing) = self.keys.iter().find(|k| !fetched.contains_key(k)) {
                    state.valid = false;
                    warn!(self.log, "snapshot refresh incomplete"; "register" => ?missing);
                    return Err(Error::Decode(
                        switch_platform_decode::Error::MalformedResponse {
                            expected: self.keys.len(),
                            found: fetched.len(),
                        },
                    ));
                }
                state.values = fetched;
            }
            RefreshPolicy::Lenient => {
                for key in self.keys.iter().copied() {
                    let value = fetched
                        .get(&key)
                        .copied()
                        .or_else(|| state.values.get(&key).copied())
                        .unwrap_or_default();
                    state.values.insert(key, value);
                }
            }
        }
        Ok(state.commit())
    }

    /// Run a write to the device under the snapshot's lock, then invalidate
    /// the snapshot.
    ///
    /// The snapshot is invalidated whether or not the write succeeds, since a
    /// failed write may have been partially applied.
    pub fn write<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Result<T, Error>,
    {
        let mut state = self.lock();
        let result = f();
        state.valid = false;
        result
    }

    /// Force the next access to refresh.
    pub fn invalidate(&self) {
        self.lock().valid = false;
    }
}
