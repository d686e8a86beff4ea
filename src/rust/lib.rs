// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-CPU LAME bundle scheduler.
//!
//! A bundle is a small fixed set of user threads co-resident on one worker.
//! An asynchronous event (an interrupt vector or a performance-counter
//! overflow) drives a handler that rotates the CPU round-robin through the
//! bundle with a direct frame-to-frame switch, hiding short stalls without
//! a trip through the full scheduler. When the worker gives up its CPU, the
//! bundle is dismantled back onto the ordinary run queue.

mod collections;
mod pal;

pub mod runtime;
pub mod scheduler;

#[macro_use]
extern crate log;

pub use crate::{
    collections::{
        run_queue::{
            QPtrs,
            RunQueue,
            RQ_SIZE,
        },
        spin_lock::SpinLock,
    },
    runtime::{
        config::{
            LameConfig,
            RegisterMode,
            TscMode,
        },
        fail::Fail,
        thread::{
            ThreadFrame,
            ThreadRef,
        },
        worker::Worker,
        LameRuntime,
    },
    scheduler::{
        Bundle,
        HandlerVariant,
        BUNDLE_SIZE_MAX,
    },
};
