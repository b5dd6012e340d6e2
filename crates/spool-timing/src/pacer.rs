use crate::{Duration, Instant};

/// Absolute-time packet pacing.
///
/// The sender computes, before each send, when the packet is *allowed* to
/// leave, and busy-waits until the monotonic clock has passed that point.
/// The next start-of-packet is then scheduled one inter-packet delay after
/// the observed send time. Scheduling absolute times instead of sleeping a
/// relative delay after each send keeps the long-term rate exact even when
/// individual sends jitter.
#[derive(Clone, Copy, Debug, Default)]
pub struct Pacer {
    start_of_packet: Option<Instant>,
}

impl Pacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Busy-wait until the scheduled start-of-packet time, then advance the
    /// schedule by `ipd`. A zero `ipd` sends immediately and resets the
    /// schedule.
    #[inline]
    pub fn pace(&mut self, ipd: Duration) {
        if ipd == Duration::ZERO {
            self.start_of_packet = None;
            return;
        }
        let mut now = Instant::now();
        if let Some(sop) = self.start_of_packet {
            while now < sop {
                std::hint::spin_loop();
                now = Instant::now();
            }
        }
        self.start_of_packet = Some(now + ipd);
    }
}
