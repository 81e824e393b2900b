use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
};

use object::{FinalizerKind, ObjHeader};
use parking_lot::{Condvar, Mutex};

use crate::{ExtraObjectFlags, FinalizerQueue, settings::FinalizerSettings};

/// GC cycle number published by the collector.
pub type Epoch = u64;

/// Invoked on the finalizer thread once all records queued up to an epoch
/// have been processed. Must not call back into the processor.
pub type EpochDoneCallback = Box<dyn Fn(Epoch) + Send + Sync>;

/// Runs the built-in finalizer routine an object's type declares.
pub trait Disposer: Send + Sync {
    fn dispose(&self, kind: FinalizerKind, object: &ObjHeader);
}

/// Disposer for runtimes whose finalizable types need no extra work.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDisposer;

impl Disposer for NoopDisposer {
    fn dispose(&self, _kind: FinalizerKind, _object: &ObjHeader) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// No thread.
    Stopped,
    /// Thread spawned, handshake pending.
    Starting,
    /// Waiting for work, an epoch change or shutdown.
    Idle,
    /// Working through the queue.
    Draining,
    /// Leaving the loop.
    ShuttingDown,
}

struct Control {
    state: ProcessorState,
    /// Last epoch published by the collector.
    epoch: Epoch,
    /// Last epoch the thread finished. Survives restarts.
    serviced: Epoch,
    shutdown: bool,
    new_tasks_allowed: bool,
}

struct Shared {
    queue: FinalizerQueue,
    control: Mutex<Control>,
    wake: Condvar,
    initialized: Mutex<bool>,
    initialized_changed: Condvar,
    disposer: Arc<dyn Disposer>,
    epoch_done: EpochDoneCallback,
}

impl Shared {
    fn run(&self) {
        log::debug!("finalizer thread started");
        self.set_initialized(true);

        loop {
            let epoch = {
                let mut control = self.control.lock();
                control.state = ProcessorState::Idle;
                while self.queue.is_empty()
                    && control.epoch == control.serviced
                    && !control.shutdown
                {
                    self.wake.wait(&mut control);
                }
                if self.queue.is_empty() && control.epoch == control.serviced {
                    assert!(
                        control.shutdown,
                        "finalizer thread woke up without work or shutdown request"
                    );
                    control.new_tasks_allowed = false;
                    control.state = ProcessorState::ShuttingDown;
                    break;
                }
                control.state = ProcessorState::Draining;
                control.epoch
            };

            let finalized = self.drain();
            log::debug!("finalized {finalized} extra objects for epoch {epoch}");
            self.control.lock().serviced = epoch;
            (self.epoch_done)(epoch);
        }

        self.set_initialized(false);
        log::debug!("finalizer thread finished");
    }

    /// Pops until the queue is empty, including records pushed meanwhile.
    fn drain(&self) -> usize {
        let mut finalized = 0;
        while let Some(record) = self.queue.pop() {
            // SAFETY: queued records stay resident until flagged FINALIZED
            let record = unsafe { record.as_ref() };
            if let Some(owner) = record.base_object() {
                // SAFETY: sweep keeps the owner alive while its record is
                // queued
                let owner = unsafe { owner.as_ref() };
                if let Some(kind) = owner.type_info().finalizer() {
                    self.disposer.dispose(kind, owner);
                }
            }
            record.uninstall();
            // last access, the next sweep may reclaim the cell
            record.set_flag(ExtraObjectFlags::FINALIZED);
            finalized += 1;
        }
        finalized
    }

    fn set_initialized(&self, value: bool) {
        *self.initialized.lock() = value;
        self.initialized_changed.notify_all();
    }
}

/// Owns the finalizer thread and the queue feeding it.
///
/// Sweep pushes records onto [`queue`](Self::queue); the collector then
/// publishes the finished cycle with [`set_epoch`](Self::set_epoch). The
/// thread disposes each record's owner, retires the record and reports the
/// epoch back through the callback.
pub struct FinalizerProcessor {
    shared: Arc<Shared>,
    settings: FinalizerSettings,
    /// Creation lock, also held across join.
    thread: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    spawned: AtomicUsize,
}

impl FinalizerProcessor {
    pub fn new<F>(
        settings: FinalizerSettings,
        disposer: Arc<dyn Disposer>,
        epoch_done: F,
    ) -> Self
    where
        F: Fn(Epoch) + Send + Sync + 'static,
    {
        settings.validate().expect("Invalid Finalizer Settings");
        Self {
            shared: Arc::new(Shared {
                queue: FinalizerQueue::new(),
                control: Mutex::new(Control {
                    state: ProcessorState::Stopped,
                    epoch: 0,
                    serviced: 0,
                    shutdown: false,
                    new_tasks_allowed: true,
                }),
                wake: Condvar::new(),
                initialized: Mutex::new(false),
                initialized_changed: Condvar::new(),
                disposer,
                epoch_done: Box::new(epoch_done),
            }),
            settings,
            thread: Mutex::new(None),
            running: AtomicBool::new(false),
            spawned: AtomicUsize::new(0),
        }
    }

    /// The queue sweep hands records to.
    #[inline]
    pub fn queue(&self) -> &FinalizerQueue {
        &self.shared.queue
    }

    pub fn start_finalizer_thread_if_none(&self) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }

        self.shared.control.lock().state = ProcessorState::Starting;
        let shared = self.shared.clone();
        let mut builder =
            thread::Builder::new().name(self.settings.thread_name.clone());
        if let Some(stack_size) = self.settings.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let handle = builder
            .spawn(move || shared.run())
            .expect("spawn finalizer thread");

        *thread = Some(handle);
        self.running.store(true, Ordering::Release);
        self.spawned.fetch_add(1, Ordering::Relaxed);
        log::debug!("spawned finalizer thread {:?}", self.settings.thread_name);
    }

    /// Publishes a finished GC cycle, starting the thread if needed.
    ///
    /// Republishing the last serviced epoch with nothing queued does not
    /// trigger a drain or a callback.
    pub fn set_epoch(&self, epoch: Epoch) {
        self.start_finalizer_thread_if_none();
        let mut control = self.shared.control.lock();
        control.epoch = epoch;
        self.shared.wake.notify_all();
        log::trace!("published epoch {epoch}");
    }

    /// Stops and joins the thread. Nothing happens if none is running.
    ///
    /// The queue must be empty by the time the thread exits; callers publish
    /// the epoch of the last sweep before stopping.
    pub fn stop_finalizer_thread(&self) {
        let mut thread = self.thread.lock();
        let Some(handle) = thread.take() else {
            return;
        };

        {
            let mut control = self.shared.control.lock();
            control.shutdown = true;
            self.shared.wake.notify_all();
        }
        if handle.join().is_err() {
            log::error!("finalizer thread panicked");
        }
        self.running.store(false, Ordering::Release);

        {
            let mut control = self.shared.control.lock();
            control.shutdown = false;
            control.new_tasks_allowed = true;
            control.state = ProcessorState::Stopped;
        }
        assert!(
            self.shared.queue.is_empty(),
            "finalizer queue must be empty when the finalizer thread stops"
        );
        log::debug!("finalizer thread stopped");
    }

    /// Blocks until the thread has finished its startup handshake.
    pub fn wait_finalizer_thread_initialized(&self) {
        let mut initialized = self.shared.initialized.lock();
        while !*initialized {
            self.shared.initialized_changed.wait(&mut initialized);
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ProcessorState {
        self.shared.control.lock().state
    }

    /// Cleared while the thread is shutting down.
    pub fn new_tasks_allowed(&self) -> bool {
        self.shared.control.lock().new_tasks_allowed
    }

    /// Finalizer threads spawned over the processor's lifetime.
    pub fn threads_spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn last_serviced_epoch(&self) -> Epoch {
        self.shared.control.lock().serviced
    }
}

impl Drop for FinalizerProcessor {
    fn drop(&mut self) {
        self.stop_finalizer_thread();
    }
}

impl fmt::Debug for FinalizerProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let control = self.shared.control.lock();
        f.debug_struct("FinalizerProcessor")
            .field("state", &control.state)
            .field("epoch", &control.epoch)
            .field("serviced", &control.serviced)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExtraObjectData;
    use object::{CLEANER_TYPE, PLAIN_TYPE, WORKER_BOUND_REFERENCE_TYPE};
    use std::{
        ptr::NonNull,
        time::{Duration, Instant},
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct EpochLog {
        seen: Mutex<Vec<Epoch>>,
        changed: Condvar,
    }

    impl EpochLog {
        fn record(&self, epoch: Epoch) {
            self.seen.lock().push(epoch);
            self.changed.notify_all();
        }

        fn wait_for(&self, epoch: Epoch) -> bool {
            let deadline = Instant::now() + TIMEOUT;
            let mut seen = self.seen.lock();
            while !seen.contains(&epoch) {
                if self.changed.wait_until(&mut seen, deadline).timed_out() {
                    return false;
                }
            }
            true
        }

        fn snapshot(&self) -> Vec<Epoch> {
            self.seen.lock().clone()
        }
    }

    #[derive(Default)]
    struct CountingDisposer {
        cleaners: AtomicUsize,
        worker_refs: AtomicUsize,
    }

    impl Disposer for CountingDisposer {
        fn dispose(&self, kind: FinalizerKind, _object: &ObjHeader) {
            match kind {
                FinalizerKind::Cleaner => &self.cleaners,
                FinalizerKind::WorkerBoundReference => &self.worker_refs,
            }
            .fetch_add(1, Ordering::SeqCst);
        }
    }

    fn new_processor(
        disposer: Arc<dyn Disposer>,
    ) -> (FinalizerProcessor, Arc<EpochLog>) {
        let log = Arc::new(EpochLog::default());
        let sink = log.clone();
        let processor = FinalizerProcessor::new(
            FinalizerSettings::default(),
            disposer,
            move |epoch| sink.record(epoch),
        );
        (processor, log)
    }

    fn enqueue(processor: &FinalizerProcessor, record: &ExtraObjectData) {
        record.set_flag(ExtraObjectFlags::IN_FINALIZER_QUEUE);
        unsafe { processor.queue().push(NonNull::from(record)) };
    }

    #[test]
    fn stop_without_start_is_noop() {
        let (processor, log) = new_processor(Arc::new(NoopDisposer));
        assert!(!processor.is_running());
        processor.stop_finalizer_thread();
        assert!(!processor.is_running());
        assert_eq!(processor.state(), ProcessorState::Stopped);
        assert!(log.snapshot().is_empty());
    }

    #[test]
    fn start_is_idempotent_and_handshakes() {
        let (processor, _log) = new_processor(Arc::new(NoopDisposer));
        processor.start_finalizer_thread_if_none();
        processor.start_finalizer_thread_if_none();
        processor.wait_finalizer_thread_initialized();
        assert!(processor.is_running());
        assert!(processor.new_tasks_allowed());

        processor.stop_finalizer_thread();
        assert!(!processor.is_running());
        assert!(!*processor.shared.initialized.lock(), "thread has exited");
        assert_eq!(processor.state(), ProcessorState::Stopped);
        assert!(processor.new_tasks_allowed(), "re-enabled after stop");
    }

    #[test]
    fn concurrent_starts_spawn_one_thread() {
        let (processor, _log) = new_processor(Arc::new(NoopDisposer));
        let processor = Arc::new(processor);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let processor = processor.clone();
                thread::spawn(move || processor.start_finalizer_thread_if_none())
            })
            .collect();
        for h in handles {
            h.join().expect("starter panicked");
        }
        processor.wait_finalizer_thread_initialized();
        assert!(processor.is_running());
        assert_eq!(processor.threads_spawned(), 1, "racing starts spawn once");
        processor.stop_finalizer_thread();
    }

    #[test]
    fn new_epoch_triggers_one_callback() {
        let (processor, log) = new_processor(Arc::new(NoopDisposer));
        processor.set_epoch(1);
        assert!(log.wait_for(1), "epoch 1 never reported");
        assert_eq!(processor.last_serviced_epoch(), 1);

        processor.set_epoch(2);
        assert!(log.wait_for(2), "epoch 2 never reported");
        assert_eq!(log.snapshot(), vec![1, 2]);
        processor.stop_finalizer_thread();
    }

    #[test]
    fn same_epoch_with_empty_queue_is_ignored() {
        let (processor, log) = new_processor(Arc::new(NoopDisposer));
        processor.set_epoch(7);
        assert!(log.wait_for(7));

        processor.set_epoch(7);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(log.snapshot(), vec![7], "no drain for an unchanged epoch");
        processor.stop_finalizer_thread();
    }

    #[test]
    fn drain_dispatches_and_retires_records() {
        let disposer = Arc::new(CountingDisposer::default());
        let (processor, log) = new_processor(disposer.clone());

        let cleaner = ObjHeader::new_heap(&CLEANER_TYPE);
        let worker_ref = ObjHeader::new_heap(&WORKER_BOUND_REFERENCE_TYPE);
        let plain = ObjHeader::new_heap(&PLAIN_TYPE);
        let records: Vec<_> = [&cleaner, &worker_ref, &plain]
            .into_iter()
            .map(|object| {
                let record = Box::new(ExtraObjectData::new());
                record.install(object);
                record
            })
            .collect();
        for record in &records {
            enqueue(&processor, record);
        }

        processor.set_epoch(1);
        assert!(log.wait_for(1));
        assert_eq!(disposer.cleaners.load(Ordering::SeqCst), 1);
        assert_eq!(disposer.worker_refs.load(Ordering::SeqCst), 1);
        for record in &records {
            assert!(record.has_flag(ExtraObjectFlags::FINALIZED));
        }
        assert!(!cleaner.has_extra_object());
        assert!(!plain.has_extra_object());
        assert!(processor.queue().is_empty());
        processor.stop_finalizer_thread();
    }

    #[test]
    fn concurrent_pushes_are_all_finalized() {
        let threads = 4usize;
        let per_thread = 250usize;
        let disposer = Arc::new(CountingDisposer::default());
        let (processor, log) = new_processor(disposer.clone());
        let processor = Arc::new(processor);

        let objects: Arc<Vec<ObjHeader>> = Arc::new(
            (0..threads * per_thread)
                .map(|_| ObjHeader::new_heap(&CLEANER_TYPE))
                .collect(),
        );
        let records: Arc<Vec<ExtraObjectData>> = Arc::new(
            (0..objects.len()).map(|_| ExtraObjectData::new()).collect(),
        );
        for (object, record) in objects.iter().zip(records.iter()) {
            record.install(object);
        }

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let processor = processor.clone();
                let records = records.clone();
                thread::spawn(move || {
                    for record in &records[t * per_thread..(t + 1) * per_thread] {
                        enqueue(&processor, record);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("pusher panicked");
        }

        processor.set_epoch(1);
        assert!(log.wait_for(1));
        assert_eq!(
            disposer.cleaners.load(Ordering::SeqCst),
            threads * per_thread,
            "every queued record disposed exactly once"
        );
        assert!(
            records
                .iter()
                .all(|r| r.has_flag(ExtraObjectFlags::FINALIZED))
        );
        processor.stop_finalizer_thread();
    }

    #[test]
    fn restart_after_stop() {
        let (processor, log) = new_processor(Arc::new(NoopDisposer));
        processor.set_epoch(1);
        assert!(log.wait_for(1));
        processor.stop_finalizer_thread();
        assert!(!processor.is_running());

        processor.set_epoch(2);
        processor.wait_finalizer_thread_initialized();
        assert!(processor.is_running());
        assert!(log.wait_for(2));
        assert_eq!(log.snapshot(), vec![1, 2]);
        processor.stop_finalizer_thread();
    }

    #[test]
    fn explicit_start_after_stop() {
        let (processor, log) = new_processor(Arc::new(NoopDisposer));
        processor.start_finalizer_thread_if_none();
        processor.wait_finalizer_thread_initialized();
        processor.stop_finalizer_thread();
        assert!(!processor.is_running());
        assert!(!*processor.shared.initialized.lock());

        processor.start_finalizer_thread_if_none();
        processor.wait_finalizer_thread_initialized();
        assert!(processor.is_running());
        assert!(*processor.shared.initialized.lock(), "handshake completed");
        assert_eq!(processor.threads_spawned(), 2);
        assert_ne!(processor.state(), ProcessorState::Stopped);

        // the new thread services work like the first one did
        processor.set_epoch(1);
        assert!(log.wait_for(1), "restarted thread never reported epoch 1");
        processor.stop_finalizer_thread();
        assert_eq!(processor.state(), ProcessorState::Stopped);
    }

    #[test]
    fn serviced_epoch_survives_restart() {
        let (processor, log) = new_processor(Arc::new(NoopDisposer));
        processor.set_epoch(3);
        assert!(log.wait_for(3));
        processor.stop_finalizer_thread();

        processor.set_epoch(3);
        processor.wait_finalizer_thread_initialized();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(log.snapshot(), vec![3]);
        processor.stop_finalizer_thread();
    }
}
