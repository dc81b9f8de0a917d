//! Per-name event sampling.
//!
//! A [`SamplingOptions`] lets through the first invocation and every
//! `rate`-th one after it. Definitions are shared by name through a
//! [`SamplingRegistry`] that callers own and pass around explicitly.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, TelemetryError};

/// A named sampling definition.
#[derive(Debug)]
pub struct SamplingOptions {
    name: String,
    rate: u64,
    event_count: AtomicU64,
}

impl SamplingOptions {
    /// Creates a definition that samples one in every `rate` invocations.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidConfiguration`] if `rate` is zero.
    pub fn new(name: impl Into<String>, rate: u64) -> Result<Self> {
        Self::with_event_count(name, rate, 0)
    }

    /// Creates a definition whose counter starts at `event_count`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidConfiguration`] if `rate` is zero.
    pub fn with_event_count(name: impl Into<String>, rate: u64, event_count: u64) -> Result<Self> {
        let name = name.into();
        if rate == 0 {
            return Err(TelemetryError::InvalidConfiguration(format!(
                "sampling rate for '{name}' must be positive"
            )));
        }
        Ok(Self {
            name,
            rate,
            event_count: AtomicU64::new(event_count),
        })
    }

    /// Definition name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sampling rate.
    #[must_use]
    pub const fn rate(&self) -> u64 {
        self.rate
    }

    /// Invocations counted so far, modulo 2^64.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Acquire)
    }

    /// Returns true if the current invocation should emit events.
    #[must_use]
    pub fn sample(&self) -> bool {
        let count = self.event_count();
        count == 0 || count % self.rate == 0
    }

    /// Counts one invocation, wrapping to zero on overflow.
    pub fn increment(&self) {
        // fetch_add wraps on overflow.
        self.event_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns a guard that counts one invocation when dropped, including
    /// during unwinding.
    #[must_use]
    pub fn count_on_drop(&self) -> CountGuard<'_> {
        CountGuard { options: self }
    }
}

/// Increments a [`SamplingOptions`] counter when dropped.
#[derive(Debug)]
pub struct CountGuard<'a> {
    options: &'a SamplingOptions,
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.options.increment();
    }
}

/// Shared, create-on-first-use sampling definitions.
#[derive(Debug, Default)]
pub struct SamplingRegistry {
    definitions: Mutex<HashMap<String, Arc<SamplingOptions>>>,
}

impl SamplingRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the definition for `name`, creating it with `rate` if absent.
    ///
    /// An existing definition keeps its original rate.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidConfiguration`] if the definition
    /// must be created and `rate` is zero.
    pub fn get_or_create(&self, name: &str, rate: u64) -> Result<Arc<SamplingOptions>> {
        let mut definitions = self.definitions.lock();
        if let Some(existing) = definitions.get(name) {
            return Ok(Arc::clone(existing));
        }
        let created = Arc::new(SamplingOptions::new(name, rate)?);
        definitions.insert(name.to_string(), Arc::clone(&created));
        Ok(created)
    }

    /// Returns the definition for `name` if one exists.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<SamplingOptions>> {
        self.definitions.lock().get(name).cloned()
    }

    /// Number of definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.lock().len()
    }

    /// Returns true if no definitions exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.lock().is_empty()
    }
}
