// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Runtime substrate for the bundle scheduler: configuration, logging,
//! worker lifecycle, and the narrow hooks the surrounding scheduler installs
//! (deeper-reschedule callbacks). Initialization mirrors process start-up
//! order: logging first, then configuration, then the site bitmap, then
//! kernel registration. A failed registration leaves the scheduler inert
//! rather than failing the process.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod config;
pub mod fail;
pub mod logging;
pub mod thread;
pub mod timer;
pub mod worker;

pub use self::{
    config::LameConfig,
    fail::Fail,
    worker::Worker,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::scheduler::{
    bitmap,
    register::{
        self,
        HandlerVariant,
    },
};
use ::core::sync::atomic::{
    AtomicUsize,
    Ordering,
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Ordinary-scheduler hook run when the slow return path wants a yield.
static YIELD_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Control-plane hook run when the slow return path wants a cede.
static CEDE_HOOK: AtomicUsize = AtomicUsize::new(0);

//======================================================================================================================
// Structures
//======================================================================================================================

/// The bundle scheduler's per-process state: one worker per CPU, plus the
/// configuration they were built from.
pub struct LameRuntime {
    config: LameConfig,
    workers: Vec<Box<Worker>>,
}

/// Cross-worker counter totals.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct AggregateStats {
    pub lame_switches: u64,
    pub lame_skips: u64,
    pub rq_overflows: u64,
    pub total_lames: u64,
    pub total_xsave_lames: u64,
    pub total_cycles: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl LameRuntime {
    /// Brings the scheduler up: logging, bitmap, workers, registration.
    /// Registration failure is downgraded to a warning and the scheduler
    /// stays inert; every other failure is surfaced.
    pub fn new(config: LameConfig, nworkers: usize) -> Result<Self, Fail> {
        logging::initialize();

        if config.bitmap_pgsz_factor >= 0 {
            if let Err(e) = bitmap::init(config.bitmap_pgsz_factor as u32) {
                warn!("site bitmap not enabled: {:?}", e);
            }
        } else {
            warn!("site bitmap not enabled");
        }

        let mut workers: Vec<Box<Worker>> = Vec::with_capacity(nworkers);
        for index in 0..nworkers {
            workers.push(Worker::new(index, config.bundle_size)?);
        }

        let variant: HandlerVariant = register::select_variant(config.tsc, config.register);
        let registered: Result<(), Fail> = register::validate(variant, config.tsc, config.bundle_size)
            .and_then(|_| register::register(config.register, variant, config.bundle_size));
        if let Err(e) = registered {
            warn!("switching capability not enabled: {:?}", e);
        }

        Ok(Self { config, workers })
    }

    /// Parses the configuration file and brings the scheduler up.
    pub fn from_config_file(path: &str, nworkers: usize) -> Result<Self, Fail> {
        let config: LameConfig = LameConfig::from_file(path)?;
        Self::new(config, nworkers)
    }

    pub fn config(&self) -> &LameConfig {
        &self.config
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn worker(&self, index: usize) -> &Worker {
        &self.workers[index]
    }

    pub fn worker_mut(&mut self, index: usize) -> &mut Worker {
        &mut self.workers[index]
    }

    /// Sums the per-worker counters. Counters never cross workers, so this
    /// is the only place totals exist.
    pub fn aggregate_stats(&self) -> AggregateStats {
        let mut totals: AggregateStats = AggregateStats::default();
        for k in self.workers.iter() {
            totals.lame_switches += k.stats.lame_switches;
            totals.lame_skips += k.stats.lame_skips;
            totals.rq_overflows += k.stats.rq_overflows;
            totals.total_lames += k.bundle().total_lames();
            totals.total_xsave_lames += k.bundle().total_xsave_lames();
            totals.total_cycles += k.bundle().total_cycles();
        }
        totals
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Installs the deeper-reschedule hooks consumed by the slow return path.
pub fn set_resched_hooks(yield_fn: fn(), cede_fn: fn()) {
    YIELD_HOOK.store(yield_fn as usize, Ordering::Release);
    CEDE_HOOK.store(cede_fn as usize, Ordering::Release);
}

pub(crate) fn yield_hook() -> Option<fn()> {
    let raw: usize = YIELD_HOOK.load(Ordering::Acquire);
    if raw == 0 {
        None
    } else {
        Some(unsafe { ::core::mem::transmute::<usize, fn()>(raw) })
    }
}

pub(crate) fn cede_hook() -> Option<fn()> {
    let raw: usize = CEDE_HOOK.load(Ordering::Acquire);
    if raw == 0 {
        None
    } else {
        Some(unsafe { ::core::mem::transmute::<usize, fn()>(raw) })
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
