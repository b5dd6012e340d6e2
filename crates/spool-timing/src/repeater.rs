use crate::{Duration, Instant};

/// Fires at most once per interval. Used to throttle the "data is being
/// lost" style reports to one every couple of seconds.
#[derive(Clone, Copy, Debug)]
pub struct Repeater {
    interval: Duration,
    last_acted: Option<Instant>,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: None }
    }

    /// Run `f` if the interval has passed since the last firing (or if this
    /// repeater never fired). `f` receives the elapsed time.
    #[inline]
    pub fn maybe<F>(&mut self, mut f: F)
    where
        F: FnMut(Duration),
    {
        if let Some(el) = self.check() {
            f(el);
        }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        self.check().is_some()
    }

    fn check(&mut self) -> Option<Duration> {
        let el = match self.last_acted {
            None => Duration::MAX,
            Some(t) => t.elapsed(),
        };
        if el >= self.interval {
            self.last_acted = Some(Instant::now());
            Some(el)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.last_acted = Some(Instant::now());
    }
}
