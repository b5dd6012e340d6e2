use std::thread;

use core_affinity::CoreId;
use tracing::warn;

/// Scheduling request for a stage thread. Anything other than `OsDefault`
/// asks for `SCHED_FIFO` (needs CAP_SYS_NICE); on refusal the thread simply
/// stays under the default scheduler.
#[derive(Clone, Copy, Debug, Default)]
pub enum ThreadPriority {
    #[default]
    OsDefault,
    Realtime(i32),
}

#[cfg(target_os = "linux")]
fn set_thread_prio(prio: ThreadPriority) {
    let ThreadPriority::Realtime(sched_priority) = prio else {
        return;
    };
    let param = libc::sched_param { sched_priority };
    let code = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if code != 0 {
        warn!(%code, sched_priority, "couldn't set SCHED_FIFO, staying on default scheduler");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_thread_prio(prio: ThreadPriority) {
    if !matches!(prio, ThreadPriority::OsDefault) {
        warn!(?prio, "thread priority setting only supported on linux");
    }
}

/// Pin + prioritise the calling thread. Stage threads call this first,
/// before touching their queues.
pub fn thread_boot(core: Option<usize>, prio: ThreadPriority) {
    if let Some(id) = core {
        if !core_affinity::set_for_current(CoreId { id }) {
            warn!(core = id, "couldn't set core affinity");
        }
    }
    set_thread_prio(prio);
}

/// Spawn an OS thread carrying the given stage name (visible in ps/gdb).
pub fn spawn_stage<F>(name: &str, f: F) -> std::io::Result<thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(f)
}
