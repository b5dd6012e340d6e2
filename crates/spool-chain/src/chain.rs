use std::{
    any::Any,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
};

use once_cell::sync::Lazy;
use tracing::{debug, info_span, warn};

use crate::{ChainError, Pop, Queue, StageError, SyncArgs};

pub type StepId = usize;

/// Registered once, process-wide: a handler whose only job is to exist, so
/// that a SIGUSR1 aimed at a stage thread makes its blocking syscall return
/// EINTR instead of being ignored. Closing a descriptor does not wake
/// sibling threads already blocked on it on Linux; the signal does.
static KICK_SIGNAL: Lazy<()> = Lazy::new(|| {
    let res = unsafe { signal_hook::low_level::register(signal_hook::consts::SIGUSR1, || {}) };
    if let Err(e) = res {
        warn!(%e, "couldn't register the syscall-kick handler, cancellation may hang on blocked I/O");
    }
});

/// Producer-side handle on the queue between two stages.
pub struct Outq<T> {
    q: Queue<T>,
}

impl<T> Outq<T> {
    /// `false` means downstream is gone; the stage should wrap up.
    #[inline]
    pub fn push(&self, item: T) -> bool {
        self.q.push(item)
    }
}

/// Consumer-side handle on the queue between two stages.
pub struct Inq<T> {
    q: Queue<T>,
}

impl<T> Inq<T> {
    /// `None` means upstream is gone and the backlog is drained.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.q.pop()
    }

    #[inline]
    pub fn pop_deadline(&self, timeout: std::time::Duration) -> Pop<T> {
        self.q.pop_deadline(timeout)
    }
}

type SpawnFn = Box<dyn FnOnce(Arc<Shared>) -> std::io::Result<JoinHandle<()>> + Send>;
type Thunk = Box<dyn Fn() + Send + Sync>;

struct Shared {
    errors: Mutex<Vec<String>>,
}

struct StepSlot {
    name: String,
    sync_any: Arc<dyn Any + Send + Sync>,
    /// flips the stage's cancelled flag and wakes its condvar
    cancel_sync: Thunk,
    /// user-registered: closes descriptors so blocking syscalls die
    cancel_thunk: Option<Thunk>,
    cancel_done: bool,
    drain_out: Option<Thunk>,
    kill_out: Option<Thunk>,
    spawn: Option<SpawnFn>,
    handle: Option<JoinHandle<()>>,
    /// kernel thread id once running, 0 before and after
    tid: Arc<AtomicU64>,
}

#[derive(PartialEq)]
enum Phase {
    Built,
    Running,
    Stopped,
}

struct ChainState {
    slots: Vec<StepSlot>,
    phase: Phase,
}

/// An ordered pipeline of stages joined by bounded queues, one OS thread
/// per stage. Built through [`Chain::builder`]; source and sink types are
/// checked at compile time, adjacent stages share exactly one queue.
///
/// Clones share the same underlying chain, so a detached guard thread can
/// [`wait`](Self::wait) while the supervisor keeps its own handle around
/// for [`stop`](Self::stop).
#[derive(Clone)]
pub struct Chain {
    state: Arc<Mutex<ChainState>>,
    shared: Arc<Shared>,
}

impl Chain {
    pub fn builder() -> ChainBuilder<()> {
        ChainBuilder { slots: Vec::new(), link: None }
    }

    /// Start every stage on its own named thread. Calling it again while
    /// running is a no-op; a chain that already stopped stays stopped.
    pub fn run(&self) -> Result<(), ChainError> {
        let mut st = self.state.lock().unwrap();
        match st.phase {
            Phase::Running => return Ok(()),
            Phase::Stopped => return Err(ChainError::Finished),
            Phase::Built => {}
        }
        for slot in &mut st.slots {
            let spawn = slot.spawn.take().expect("built chain has spawners");
            let handle = spawn(Arc::clone(&self.shared))
                .map_err(|e| ChainError::Stage(format!("spawning {}: {e}", slot.name)))?;
            slot.handle = Some(handle);
        }
        st.phase = Phase::Running;
        Ok(())
    }

    /// Orderly teardown. First every stage is cancelled source to sink
    /// (cancel flag, registered thunk, signal kick); a cancelled stage that
    /// wakes from its syscall may still flush buffered tail data downstream
    /// while the queues are alive. Each stage then gets a bounded grace to
    /// exit on its own before its outbound queue is delayed-disabled and
    /// the thread joined - the disable is what frees a producer stuck in a
    /// blocking push, so teardown cannot deadlock on a full queue. Returns
    /// only when every stage thread has exited; reports the recorded stage
    /// failures if there were any.
    pub fn stop(&self) -> Result<(), ChainError> {
        const GRACE: std::time::Duration = std::time::Duration::from_millis(500);

        let mut st = self.state.lock().unwrap();
        st.phase = Phase::Stopped;
        for slot in &mut st.slots {
            if !slot.cancel_done {
                slot.cancel_done = true;
                (slot.cancel_sync)();
                if let Some(thunk) = &slot.cancel_thunk {
                    thunk();
                }
                kick_thread(slot);
            }
        }
        for i in 0..st.slots.len() {
            {
                let slot = &st.slots[i];
                if let Some(handle) = &slot.handle {
                    let deadline = std::time::Instant::now() + GRACE;
                    while !handle.is_finished() && std::time::Instant::now() < deadline {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                }
                if let Some(drain) = &slot.drain_out {
                    drain();
                }
            }
            // stage threads never take the chain lock, joining under it is fine
            if let Some(handle) = st.slots[i].handle.take() {
                let _ = handle.join();
            }
            st.slots[i].tid.store(0, Ordering::Release);
        }
        for slot in &st.slots {
            if let Some(kill) = &slot.kill_out {
                kill();
            }
        }
        drop(st);
        self.take_errors()
    }

    /// Block until the sink exits of its own accord (drained input). Does
    /// not cancel anything.
    pub fn wait(&self) -> Result<(), ChainError> {
        let handles: Vec<_> = {
            let mut st = self.state.lock().unwrap();
            st.slots.iter_mut().filter_map(|s| s.handle.take()).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
        self.state.lock().unwrap().phase = Phase::Stopped;
        self.take_errors()
    }

    /// Type-safe side channel into a running stage's userdata, under that
    /// stage's lock. Waking waiters is part of the deal, so setting a run
    /// flag here releases a parked generator.
    pub fn communicate<A, R>(
        &self,
        step: StepId,
        f: impl FnOnce(&mut A) -> R,
    ) -> Result<R, ChainError>
    where
        A: Send + 'static,
    {
        let sync = {
            let st = self.state.lock().unwrap();
            let slot = st.slots.get(step).ok_or(ChainError::NoSuchStep(step))?;
            Arc::clone(&slot.sync_any)
        };
        let sync = sync
            .downcast::<SyncArgs<A>>()
            .map_err(|_| ChainError::WrongUserdata(step))?;
        Ok(sync.with(f))
    }

    /// Attach a thunk that forcibly terminates whatever blocking syscall
    /// the stage may sit in - typically by closing its descriptor.
    pub fn register_cancel(
        &self,
        step: StepId,
        thunk: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), ChainError> {
        let mut st = self.state.lock().unwrap();
        let slot = st.slots.get_mut(step).ok_or(ChainError::NoSuchStep(step))?;
        slot.cancel_thunk = Some(Box::new(thunk));
        Ok(())
    }

    pub fn num_steps(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }

    fn take_errors(&self) -> Result<(), ChainError> {
        let mut errors = self.shared.errors.lock().unwrap();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ChainError::Stage(errors.drain(..).collect::<Vec<_>>().join("; ")))
        }
    }
}

#[cfg(unix)]
fn kick_thread(slot: &StepSlot) {
    let tid = slot.tid.load(Ordering::Acquire);
    let alive = slot.handle.as_ref().is_some_and(|h| !h.is_finished());
    if tid != 0 && alive {
        unsafe {
            libc::pthread_kill(tid as libc::pthread_t, libc::SIGUSR1);
        }
    }
}

#[cfg(not(unix))]
fn kick_thread(_slot: &StepSlot) {}

/// Typed, compile-time checked chain construction. The type parameter is
/// the element type flowing out of the most recently added stage.
pub struct ChainBuilder<T> {
    slots: Vec<StepSlot>,
    link: Option<Queue<T>>,
}

impl<T> ChainBuilder<T> {
    /// Id of the most recently added step.
    pub fn last_step(&self) -> StepId {
        self.slots.len() - 1
    }

    pub fn register_cancel(&mut self, step: StepId, thunk: impl Fn() + Send + Sync + 'static) {
        self.slots[step].cancel_thunk = Some(Box::new(thunk));
    }
}

impl ChainBuilder<()> {
    /// First stage: produces elements into a fresh queue of depth `qdepth`.
    pub fn source<A, O, F>(self, name: &str, qdepth: usize, args: A, f: F) -> ChainBuilder<O>
    where
        A: Send + 'static,
        O: Send + 'static,
        F: FnOnce(&Outq<O>, &SyncArgs<A>) -> Result<(), StageError> + Send + 'static,
    {
        let mut slots = self.slots;
        let outq = Queue::<O>::new(qdepth);
        let sync = Arc::new(SyncArgs::new(args));
        let tid = Arc::new(AtomicU64::new(0));

        let spawn: SpawnFn = Box::new({
            let outq = outq.clone();
            let sync = Arc::clone(&sync);
            let tid = Arc::clone(&tid);
            let name = name.to_string();
            move |shared: Arc<Shared>| {
                let thread_name = name.clone();
                spool_utils::spawn_stage(&thread_name, move || {
                    stage_main(&name, &tid, &shared, || f(&Outq { q: outq.clone() }, &sync));
                    outq.delayed_disable();
                })
            }
        });

        slots.push(StepSlot {
            name: name.to_string(),
            cancel_sync: cancel_thunk_for(&sync),
            sync_any: sync,
            cancel_thunk: None,
            cancel_done: false,
            drain_out: Some(drain_thunk(&outq)),
            kill_out: Some(kill_thunk(&outq)),
            spawn: Some(spawn),
            handle: None,
            tid,
        });
        ChainBuilder { slots, link: Some(outq) }
    }
}

impl<T: Send + 'static> ChainBuilder<T> {
    /// Intermediate stage: consumes the previous stage's queue, produces
    /// into a fresh one of depth `qdepth`.
    pub fn step<A, O, F>(self, name: &str, qdepth: usize, args: A, f: F) -> ChainBuilder<O>
    where
        A: Send + 'static,
        O: Send + 'static,
        F: FnOnce(&Inq<T>, &Outq<O>, &SyncArgs<A>) -> Result<(), StageError> + Send + 'static,
    {
        let mut slots = self.slots;
        let inq = self.link.expect("step follows a source");
        let outq = Queue::<O>::new(qdepth);
        let sync = Arc::new(SyncArgs::new(args));
        let tid = Arc::new(AtomicU64::new(0));

        let spawn: SpawnFn = Box::new({
            let inq = inq.clone();
            let outq = outq.clone();
            let sync = Arc::clone(&sync);
            let tid = Arc::clone(&tid);
            let name = name.to_string();
            move |shared: Arc<Shared>| {
                let thread_name = name.clone();
                spool_utils::spawn_stage(&thread_name, move || {
                    let failed = stage_main(&name, &tid, &shared, || {
                        f(&Inq { q: inq.clone() }, &Outq { q: outq.clone() }, &sync)
                    });
                    if failed {
                        inq.disable();
                    }
                    outq.delayed_disable();
                })
            }
        });

        slots.push(StepSlot {
            name: name.to_string(),
            cancel_sync: cancel_thunk_for(&sync),
            sync_any: sync,
            cancel_thunk: None,
            cancel_done: false,
            drain_out: Some(drain_thunk(&outq)),
            kill_out: Some(kill_thunk(&outq)),
            spawn: Some(spawn),
            handle: None,
            tid,
        });
        ChainBuilder { slots, link: Some(outq) }
    }

    /// Final stage: consumes the previous stage's queue. Seals the chain.
    pub fn sink<A, F>(self, name: &str, args: A, f: F) -> Chain
    where
        A: Send + 'static,
        F: FnOnce(&Inq<T>, &SyncArgs<A>) -> Result<(), StageError> + Send + 'static,
    {
        let mut slots = self.slots;
        let inq = self.link.expect("sink follows a source");
        let sync = Arc::new(SyncArgs::new(args));
        let tid = Arc::new(AtomicU64::new(0));

        let spawn: SpawnFn = Box::new({
            let inq = inq.clone();
            let sync = Arc::clone(&sync);
            let tid = Arc::clone(&tid);
            let name = name.to_string();
            move |shared: Arc<Shared>| {
                let thread_name = name.clone();
                spool_utils::spawn_stage(&thread_name, move || {
                    let failed =
                        stage_main(&name, &tid, &shared, || f(&Inq { q: inq.clone() }, &sync));
                    if failed {
                        inq.disable();
                    }
                })
            }
        });

        slots.push(StepSlot {
            name: name.to_string(),
            cancel_sync: cancel_thunk_for(&sync),
            sync_any: sync,
            cancel_thunk: None,
            cancel_done: false,
            drain_out: None,
            kill_out: None,
            spawn: Some(spawn),
            handle: None,
            tid,
        });
        Chain {
            state: Arc::new(Mutex::new(ChainState { slots, phase: Phase::Built })),
            shared: Arc::new(Shared { errors: Mutex::new(Vec::new()) }),
        }
    }
}

/// Common per-thread preamble/postamble. Returns whether the stage failed.
fn stage_main(
    name: &str,
    tid: &Arc<AtomicU64>,
    shared: &Arc<Shared>,
    body: impl FnOnce() -> Result<(), StageError>,
) -> bool {
    Lazy::force(&KICK_SIGNAL);
    #[cfg(unix)]
    tid.store(unsafe { libc::pthread_self() } as u64, Ordering::Release);
    let span = info_span!("stage", name = %name);
    let _guard = span.enter();
    match body() {
        Ok(()) => {
            debug!("stage finished");
            false
        }
        Err(e) => {
            warn!(%e, "stage failed");
            shared.errors.lock().unwrap().push(format!("{name}: {e}"));
            true
        }
    }
}

fn cancel_thunk_for<A: Send + 'static>(sync: &Arc<SyncArgs<A>>) -> Thunk {
    let sync = Arc::clone(sync);
    Box::new(move || sync.cancel())
}

fn drain_thunk<T: Send + 'static>(q: &Queue<T>) -> Thunk {
    let q = q.clone();
    Box::new(move || q.delayed_disable())
}

fn kill_thunk<T: Send + 'static>(q: &Queue<T>) -> Thunk {
    let q = q.clone();
    Box::new(move || q.disable())
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct NoArgs;

    #[test]
    fn pipeline_preserves_order_end_to_end() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink_vec = Arc::clone(&collected);

        let chain = Chain::builder()
            .source("numbers", 4, NoArgs, |out, _| {
                for i in 0..100u64 {
                    if !out.push(i) {
                        break;
                    }
                }
                Ok(())
            })
            .step("doubler", 4, NoArgs, |inq, out, _| {
                while let Some(v) = inq.pop() {
                    if !out.push(v * 2) {
                        break;
                    }
                }
                Ok(())
            })
            .sink("collect", NoArgs, move |inq, _| {
                while let Some(v) = inq.pop() {
                    sink_vec.lock().unwrap().push(v);
                }
                Ok(())
            });

        chain.run().unwrap();
        chain.wait().unwrap();

        let got = collected.lock().unwrap();
        assert_eq!(got.len(), 100);
        assert!(got.iter().enumerate().all(|(i, v)| *v == 2 * i as u64));
    }

    #[test]
    fn stop_joins_threads_and_fires_cancel_thunks_once() {
        struct Waiting {
            run: bool,
        }

        let fired = Arc::new(AtomicUsize::new(0));
        let chain = Chain::builder()
            .source("stuck", 2, Waiting { run: false }, |out, sync| {
                // parked until run or cancel; never produces
                if sync.wait(|a| a.run) {
                    out.push(1u32);
                }
                Ok(())
            })
            .sink("swallow", NoArgs, |inq, _| {
                while inq.pop().is_some() {}
                Ok(())
            });

        let f = Arc::clone(&fired);
        chain.register_cancel(0, move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        chain.run().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        chain.stop().unwrap();
        // second stop must not re-fire the thunks
        let _ = chain.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_is_idempotent_and_rerun_is_refused() {
        let chain = Chain::builder()
            .source("one", 1, NoArgs, |out, _| {
                out.push(1u8);
                Ok(())
            })
            .sink("eat", NoArgs, |inq, _| {
                while inq.pop().is_some() {}
                Ok(())
            });
        chain.run().unwrap();
        chain.run().unwrap();
        chain.wait().unwrap();
        assert!(matches!(chain.run(), Err(ChainError::Finished)));
    }

    #[test]
    fn communicate_reaches_a_parked_stage() {
        struct Gen {
            run: bool,
            count: u32,
        }

        let chain = Chain::builder()
            .source("gen", 2, Gen { run: false, count: 0 }, |out, sync| {
                if !sync.wait(|a| a.run) {
                    return Ok(());
                }
                let n = sync.with(|a| a.count);
                for i in 0..n {
                    if !out.push(i) {
                        break;
                    }
                }
                Ok(())
            })
            .sink("count", Arc::new(AtomicUsize::new(0)), |inq, sync| {
                while inq.pop().is_some() {
                    sync.with(|c| c.fetch_add(1, Ordering::Relaxed));
                }
                Ok(())
            });

        chain.run().unwrap();
        // wrong type is reported, not a panic
        assert!(matches!(
            chain.communicate::<u64, _>(0, |_| ()),
            Err(ChainError::WrongUserdata(0))
        ));
        chain
            .communicate::<Gen, _>(0, |a| {
                a.count = 17;
                a.run = true;
            })
            .unwrap();
        chain.wait().unwrap();
        let total = chain.communicate::<Arc<AtomicUsize>, _>(1, |c| c.load(Ordering::Relaxed)).unwrap();
        assert_eq!(total, 17);
    }

    #[test]
    fn failing_stage_surfaces_at_stop() {
        let chain = Chain::builder()
            .source("boom", 1, NoArgs, |_: &Outq<u64>, _| Err(StageError::msg("deliberate")))
            .sink("eat", NoArgs, |inq, _| {
                while inq.pop().is_some() {}
                Ok(())
            });
        chain.run().unwrap();
        let err = chain.wait().unwrap_err();
        assert!(err.to_string().contains("deliberate"));
    }
}
