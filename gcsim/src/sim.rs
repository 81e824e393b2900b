//! Toy stop-the-world collector driving the extra-object heap.
//!
//! Every cycle each worker thread allocates a batch of objects through its
//! own allocator, then all workers meet at a barrier. The leader marks the
//! roots, everyone sweeps extra-object pages, the leader sweeps objects and
//! publishes the epoch to the finalizer thread.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread,
};

use heap::{
    Disposer, Epoch, ExtraObjectHeap, HeapSettings, SettingsError, SweepStats,
};
use object::{
    CLEANER_TYPE, FinalizerKind, ObjHeader, PLAIN_TYPE, TypeInfo,
    WORKER_BOUND_REFERENCE_TYPE,
};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::barrier::SenseBarrier;

/// Quiescent cycles run after the last allocating cycle at most.
const MAX_SETTLE_CYCLES: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one thread is required")]
    NoThreads,
    #[error("{name} must be between 0 and 100, got {value}")]
    Percent { name: &'static str, value: u8 },
    #[error("finalizable and stack percentages add up to more than 100")]
    PercentSum,
    #[error(transparent)]
    Heap(#[from] SettingsError),
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub threads: usize,
    /// Objects each thread allocates per cycle.
    pub objects: usize,
    pub cycles: usize,
    pub finalizable_percent: u8,
    pub stack_percent: u8,
    pub heap: HeapSettings,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            objects: 1000,
            cycles: 5,
            finalizable_percent: 20,
            stack_percent: 5,
            heap: HeapSettings::default(),
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        for (name, value) in [
            ("finalizable percent", self.finalizable_percent),
            ("stack percent", self.stack_percent),
        ] {
            if value > 100 {
                return Err(ConfigError::Percent { name, value });
            }
        }
        if self.finalizable_percent as u16 + self.stack_percent as u16 > 100 {
            return Err(ConfigError::PercentSum);
        }
        self.heap.validate()?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimReport {
    pub cycles: u64,
    pub objects_allocated: usize,
    pub finalizable_allocated: usize,
    pub stack_objects: usize,
    pub objects_freed: usize,
    pub cleaners_disposed: usize,
    pub worker_refs_disposed: usize,
    pub sweep: SweepStats,
    /// Pages still allocated at the end, holding stack-object records.
    pub pages_live: usize,
}

#[derive(Debug, Default)]
struct CountingDisposer {
    cleaners: AtomicUsize,
    worker_refs: AtomicUsize,
}

impl Disposer for CountingDisposer {
    fn dispose(&self, kind: FinalizerKind, object: &ObjHeader) {
        log::trace!("disposing {}", object.type_info().name());
        match kind {
            FinalizerKind::Cleaner => &self.cleaners,
            FinalizerKind::WorkerBoundReference => &self.worker_refs,
        }
        .fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct EpochSignal {
    done: Mutex<Epoch>,
    changed: Condvar,
}

impl EpochSignal {
    fn notify(&self, epoch: Epoch) {
        *self.done.lock() = epoch;
        self.changed.notify_all();
    }

    fn wait_for(&self, epoch: Epoch) {
        let mut done = self.done.lock();
        while *done < epoch {
            self.changed.wait(&mut done);
        }
    }
}

struct Tracked {
    object: Box<ObjHeader>,
    /// Cycles the object stays a root.
    ttl: u32,
}

#[derive(Clone, Copy)]
enum Kind {
    Finalizable(&'static TypeInfo),
    Stack,
    Plain,
}

pub struct Simulation {
    config: SimConfig,
    heap: ExtraObjectHeap,
    disposer: Arc<CountingDisposer>,
    epochs: Arc<EpochSignal>,
    epoch: AtomicU64,
    barrier: SenseBarrier,
    arena: Mutex<Vec<Tracked>>,
    stack_objects: Mutex<Vec<Box<ObjHeader>>>,
    report: Mutex<SimReport>,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Self {
        let disposer = Arc::new(CountingDisposer::default());
        let epochs = Arc::new(EpochSignal::default());
        let signal = epochs.clone();
        let heap = ExtraObjectHeap::new(
            config.heap.clone(),
            disposer.clone(),
            move |epoch| {
                log::debug!("finalizers done for epoch {epoch}");
                signal.notify(epoch);
            },
        );
        Self {
            config,
            heap,
            disposer,
            epochs,
            epoch: AtomicU64::new(0),
            barrier: SenseBarrier::new(),
            arena: Mutex::new(Vec::new()),
            stack_objects: Mutex::new(Vec::new()),
            report: Mutex::new(SimReport::default()),
        }
    }

    pub fn run(self) -> SimReport {
        for _ in 0..self.config.cycles {
            self.cycle(self.config.objects);
        }
        self.settle();

        self.epochs.wait_for(self.epoch.load(Ordering::Acquire));
        self.heap.stop_finalizers();

        let mut report = *self.report.lock();
        report.cleaners_disposed = self.disposer.cleaners.load(Ordering::Relaxed);
        report.worker_refs_disposed =
            self.disposer.worker_refs.load(Ordering::Relaxed);
        report.pages_live = self.heap.page_count();
        report
    }

    /// Runs empty cycles until every heap object has been collected.
    fn settle(&self) {
        for _ in 0..MAX_SETTLE_CYCLES {
            self.epochs.wait_for(self.epoch.load(Ordering::Acquire));
            if self.arena.lock().is_empty() {
                return;
            }
            self.cycle(0);
        }
        log::warn!(
            "{} objects still alive after {MAX_SETTLE_CYCLES} settle cycles",
            self.arena.lock().len()
        );
    }

    fn cycle(&self, objects: usize) {
        thread::scope(|scope| {
            for id in 0..self.config.threads {
                thread::Builder::new()
                    .name(format!("mutator-{id}"))
                    .spawn_scoped(scope, move || self.worker(id, objects))
                    .expect("spawn mutator");
            }
        });
    }

    fn worker(&self, id: usize, objects: usize) {
        let threads = self.config.threads;
        let mut proxy = self.heap.proxy();
        let mut allocated = Vec::with_capacity(objects);
        let mut finalizable = 0;
        let mut stack = Vec::new();

        for i in 0..objects {
            let kind = self.kind_for(id * objects + i);
            let object = match kind {
                Kind::Finalizable(type_info) => {
                    finalizable += 1;
                    Box::new(ObjHeader::new_heap(type_info))
                }
                Kind::Stack => Box::new(ObjHeader::new_stack(&PLAIN_TYPE)),
                Kind::Plain => Box::new(ObjHeader::new_heap(&PLAIN_TYPE)),
            };
            let record = proxy.allocate(&object);
            if let Kind::Plain = kind {
                // SAFETY: the record was just installed on a live object
                drop(unsafe { record.as_ref() }.weak_reference_counter());
            }
            match kind {
                Kind::Stack => stack.push(object),
                _ => allocated.push(Tracked {
                    object,
                    ttl: u32::from(i % 3 == 0),
                }),
            }
        }

        {
            let mut report = self.report.lock();
            report.objects_allocated += objects;
            report.finalizable_allocated += finalizable;
            report.stack_objects += stack.len();
        }
        self.arena.lock().extend(allocated);
        self.stack_objects.lock().extend(stack);

        // safepoint
        proxy.prepare_for_gc();
        if self.barrier.wait(threads) {
            self.mark();
        }
        self.barrier.wait(threads);

        let stats = self.heap.sweep();
        self.report.lock().sweep += stats;

        if self.barrier.wait(threads) {
            self.sweep_objects();
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            self.report.lock().cycles = epoch;
            self.heap.finish_epoch(epoch);
        }
    }

    fn kind_for(&self, n: usize) -> Kind {
        let slot = (n % 100) as u8;
        let finalizable = self.config.finalizable_percent;
        if slot < finalizable {
            if slot % 2 == 0 {
                Kind::Finalizable(&CLEANER_TYPE)
            } else {
                Kind::Finalizable(&WORKER_BOUND_REFERENCE_TYPE)
            }
        } else if slot < finalizable + self.config.stack_percent {
            Kind::Stack
        } else {
            Kind::Plain
        }
    }

    fn mark(&self) {
        let mut marked = 0;
        for tracked in self.arena.lock().iter_mut() {
            if tracked.ttl > 0 {
                tracked.object.try_mark();
                tracked.ttl -= 1;
                marked += 1;
            }
        }
        log::debug!("marked {marked} roots");
        self.heap.prepare_for_gc();
    }

    fn sweep_objects(&self) {
        let mut arena = self.arena.lock();
        let before = arena.len();
        arena.retain(|tracked| {
            let survives = tracked.object.try_reset_mark();
            debug_assert!(
                survives || !tracked.object.has_extra_object(),
                "freeing an object that still has extra data"
            );
            survives
        });
        let freed = before - arena.len();
        self.report.lock().objects_freed += freed;
        log::debug!("freed {freed} objects, {} alive", arena.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(finalizable_percent: u8, stack_percent: u8) -> SimConfig {
        SimConfig {
            threads: 3,
            objects: 200,
            cycles: 3,
            finalizable_percent,
            stack_percent,
            heap: HeapSettings::default(),
        }
    }

    #[test]
    fn every_finalizable_object_is_disposed_once() {
        let report = Simulation::new(small(30, 10)).run();

        assert_eq!(report.objects_allocated, 3 * 200 * 3);
        assert!(report.finalizable_allocated > 0);
        assert_eq!(
            report.cleaners_disposed + report.worker_refs_disposed,
            report.finalizable_allocated
        );
        assert_eq!(report.sweep.finalizers_scheduled, report.finalizable_allocated);
        assert_eq!(
            report.objects_freed,
            report.objects_allocated - report.stack_objects,
            "every heap object is eventually collected"
        );
        assert!(report.pages_live > 0, "stack-object records stay resident");
    }

    #[test]
    fn plain_heap_releases_every_page() {
        let report = Simulation::new(small(0, 0)).run();
        assert_eq!(report.cleaners_disposed, 0);
        assert_eq!(report.worker_refs_disposed, 0);
        assert_eq!(report.sweep.finalizers_scheduled, 0);
        assert_eq!(report.objects_freed, report.objects_allocated);
        assert_eq!(report.pages_live, 0);
        assert!(report.sweep.pages_released > 0);
    }

    #[test]
    fn single_thread() {
        let config = SimConfig {
            threads: 1,
            ..small(50, 0)
        };
        let report = Simulation::new(config).run();
        assert_eq!(
            report.cleaners_disposed + report.worker_refs_disposed,
            report.finalizable_allocated
        );
    }

    #[test]
    fn config_validation() {
        assert!(SimConfig::default().validate().is_ok());

        let config = SimConfig {
            threads: 0,
            ..SimConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NoThreads)));

        let config = SimConfig {
            finalizable_percent: 101,
            ..SimConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Percent { value: 101, .. })
        ));

        let config = SimConfig {
            finalizable_percent: 60,
            stack_percent: 60,
            ..SimConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::PercentSum)));

        let mut config = SimConfig::default();
        config.heap.finalizer.thread_name.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Heap(SettingsError::EmptyThreadName))
        ));
    }
}
