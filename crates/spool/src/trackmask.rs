use std::thread::JoinHandle;

use spool_format::Codec;
use tracing::{debug, warn};

/// Progress of the asynchronous compression solve. Building the bit-move
/// schedule for a trackmask is deliberately off-thread: the command
/// channel answers "busy" instead of stalling while it runs.
pub enum TrackmaskStatus {
    Idle,
    Busy,
    Ready { mask: u64 },
    Failed(String),
}

#[derive(Default)]
pub struct TrackmaskState {
    solving: Option<(u64, JoinHandle<Result<Codec, String>>)>,
    solution: Option<(u64, Codec)>,
    failure: Option<String>,
    pub signmag_distance: i32,
}

impl TrackmaskState {
    /// Kick off a solve; any previous solution is superseded.
    pub fn start(&mut self, mask: u64, signmag_distance: i32) {
        self.signmag_distance = signmag_distance;
        self.solution = None;
        self.failure = None;
        let handle = std::thread::spawn(move || {
            Codec::solve(mask).map_err(|e| e.to_string())
        });
        self.solving = Some((mask, handle));
        debug!(mask = format_args!("{mask:#x}"), "trackmask solve started");
    }

    /// Harvest a finished solve if there is one, then report where we are.
    pub fn poll(&mut self) -> TrackmaskStatus {
        if let Some((mask, handle)) = self.solving.take() {
            if handle.is_finished() {
                match handle.join() {
                    Ok(Ok(codec)) => {
                        self.solution = Some((mask, codec));
                    }
                    Ok(Err(e)) => {
                        warn!(%e, "trackmask solve failed");
                        self.failure = Some(e);
                    }
                    Err(_) => {
                        self.failure = Some("solver thread panicked".to_string());
                    }
                }
            } else {
                self.solving = Some((mask, handle));
                return TrackmaskStatus::Busy;
            }
        }
        if let Some(e) = &self.failure {
            return TrackmaskStatus::Failed(e.clone());
        }
        match &self.solution {
            Some((mask, _)) => TrackmaskStatus::Ready { mask: *mask },
            None => TrackmaskStatus::Idle,
        }
    }

    /// The codec of the completed solve, if any. `None` also while a solve
    /// is still running.
    pub fn codec(&self) -> Option<Codec> {
        self.solution.as_ref().map(|(_, c)| *c)
    }

    /// Fraction of the input that survives compression (1.0 = no
    /// compression configured).
    pub fn compression_factor(&self) -> f64 {
        match &self.solution {
            Some((_, codec)) => codec.kept() as f64 / 64.0,
            None => 1.0,
        }
    }

    pub fn clear(&mut self) {
        self.solving = None;
        self.solution = None;
        self.failure = None;
    }
}
