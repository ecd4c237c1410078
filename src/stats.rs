//! Engine-wide counters.
//!
//! All counters are relaxed atomics shared by every connection of one
//! [`AppService`](crate::server::AppService). Pairs such as
//! `decoders_created` / `decoders_destroyed` make resource leaks observable:
//! once the engine is quiescent each pair must balance.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineStats {
    requests_started: AtomicU64,
    cleanups: AtomicU64,
    decoders_created: AtomicU64,
    decoders_destroyed: AtomicU64,
    spill_files_created: AtomicU64,
    spill_files_removed: AtomicU64,
    async_submitted: AtomicU64,
    async_completed: AtomicU64,
    render_failures: AtomicU64,
    write_failures: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $get:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        #[must_use]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl EngineStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_request, requests_started, requests_started);
    counter!(record_cleanup, cleanups, cleanups);
    counter!(record_decoder_created, decoders_created, decoders_created);
    counter!(record_decoder_destroyed, decoders_destroyed, decoders_destroyed);
    counter!(record_spill_created, spill_files_created, spill_files_created);
    counter!(record_spill_removed, spill_files_removed, spill_files_removed);
    counter!(record_async_submitted, async_submitted, async_submitted);
    counter!(record_async_completed, async_completed, async_completed);
    counter!(record_render_failure, render_failures, render_failures);
    counter!(record_write_failure, write_failures, write_failures);

    /// Decoders currently alive.
    #[must_use]
    pub fn live_decoders(&self) -> u64 {
        self.decoders_created()
            .saturating_sub(self.decoders_destroyed())
    }

    /// Spill files currently on disk.
    #[must_use]
    pub fn live_spill_files(&self) -> u64 {
        self.spill_files_created()
            .saturating_sub(self.spill_files_removed())
    }
}
