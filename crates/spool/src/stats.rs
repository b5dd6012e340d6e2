use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use std::time::{SystemTime, UNIX_EPOCH};

use spool_timing::Instant;

use crate::TransferMode;

struct Step {
    name: String,
    bytes: Arc<AtomicU64>,
}

struct Snapshot {
    at: Instant,
    values: Vec<u64>,
}

/// Per-transfer byte counters, owned here and handed to stages as shared
/// cells at chain-build time (stages never reach back into the runtime).
/// The `tstat?` reply reports per-step rates since the previous query; the
/// `tstat=` form dumps raw counters with a timestamp and leaves the
/// arithmetic to the caller.
#[derive(Default)]
pub struct CounterRegistry {
    steps: Mutex<Vec<Step>>,
    last: Mutex<Option<Snapshot>>,
}

impl CounterRegistry {
    /// New counter for the step named `name`; position in the report
    /// follows registration order.
    pub fn register(&self, name: &str) -> Arc<AtomicU64> {
        let bytes = Arc::new(AtomicU64::new(0));
        self.steps
            .lock()
            .unwrap()
            .push(Step { name: name.to_string(), bytes: Arc::clone(&bytes) });
        bytes
    }

    /// Forget the previous transfer's steps.
    pub fn clear(&self) {
        self.steps.lock().unwrap().clear();
        *self.last.lock().unwrap() = None;
    }

    fn read_all(&self) -> (Vec<String>, Vec<u64>) {
        let steps = self.steps.lock().unwrap();
        let names = steps.iter().map(|s| s.name.clone()).collect();
        let values = steps.iter().map(|s| s.bytes.load(Ordering::Relaxed)).collect();
        (names, values)
    }

    /// Fields of the `tstat?` reply: elapsed seconds, transfer name, one
    /// `step : rate bps` pair per step, closed by the fifo fill.
    pub fn rates(&self, mode: TransferMode, fifo_fill: f64) -> Vec<String> {
        let (names, values) = self.read_all();
        let now = Instant::now();

        let mut last = self.last.lock().unwrap();
        let mut fields = Vec::new();
        match last.as_ref().filter(|s| s.values.len() == values.len()) {
            Some(prev) => {
                let dt = (now - prev.at).as_secs_f64().max(1e-9);
                fields.push(format!("{dt:.2}s"));
                fields.push(mode.to_string());
                for (i, name) in names.iter().enumerate() {
                    let delta = values[i].saturating_sub(prev.values[i]);
                    let bps = delta as f64 * 8.0 / dt;
                    fields.push(format!("{name} {}", format_rate(bps)));
                }
            }
            None => {
                fields.push("0.00s".to_string());
                fields.push(mode.to_string());
                for name in &names {
                    fields.push(format!("{name} 0bps"));
                }
            }
        }
        fields.push(format!("F {:.1}%", fifo_fill * 100.0));
        *last = Some(Snapshot { at: now, values });
        fields
    }

    /// Fields of the `tstat=` form: UNIX timestamp, transfer name, then
    /// `step : bytes` raw counters.
    pub fn raw(&self, mode: TransferMode) -> Vec<String> {
        let (names, values) = self.read_all();
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let mut fields = vec![format!("{unix:.3}"), mode.to_string()];
        for (name, value) in names.iter().zip(&values) {
            fields.push(format!("{name} {value}"));
        }
        fields
    }
}

fn format_rate(bps: f64) -> String {
    if bps >= 1e9 {
        format!("{:.2}Gbps", bps / 1e9)
    } else if bps >= 1e6 {
        format!("{:.2}Mbps", bps / 1e6)
    } else if bps >= 1e3 {
        format!("{:.2}kbps", bps / 1e3)
    } else {
        format!("{bps:.0}bps")
    }
}
