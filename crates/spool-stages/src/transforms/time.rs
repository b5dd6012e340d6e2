use std::time::{SystemTime, UNIX_EPOCH};

use spool_chain::{Inq, Outq, StageError, SyncArgs};
use spool_format::FrameTime;
use tracing::info;

use crate::Frame;

/// Last (wall-clock, data-time) pair observed, retrievable over the side
/// channel - the answer to "mem2time?".
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeGrab {
    pub os_sec: i64,
    pub data: FrameTime,
}

#[derive(Default)]
pub struct TimeGrabArgs {
    pub last: Option<TimeGrab>,
}

/// Terminal observer recording the timestamp of every frame that passes.
pub fn timegrabber(inq: &Inq<Frame>, sync: &SyncArgs<TimeGrabArgs>) -> Result<(), StageError> {
    while let Some(f) = inq.pop() {
        let os_sec = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        sync.with(|a| a.last = Some(TimeGrab { os_sec, data: f.time }));
    }
    Ok(())
}

/// Log each frame's decoded timestamp; purely diagnostic.
pub fn timeprinter(inq: &Inq<Frame>, _sync: &SyncArgs<()>) -> Result<(), StageError> {
    while let Some(f) = inq.pop() {
        info!(
            format = %f.format,
            sec = f.time.sec,
            ns = f.time.ns,
            "frame time"
        );
    }
    Ok(())
}

/// Pass-through observer variant for mid-chain use.
pub fn timedecoder(
    inq: &Inq<Frame>,
    out: &Outq<Frame>,
    _sync: &SyncArgs<()>,
) -> Result<(), StageError> {
    while let Some(f) = inq.pop() {
        info!(sec = f.time.sec, ns = f.time.ns, "frame time");
        if !out.push(f) {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use spool_blocks::Blockpool;
    use spool_chain::Chain;
    use spool_format::TrackFormat;

    use super::*;

    #[test]
    fn grabber_exposes_last_frame_time() {
        let pool = Blockpool::new(16, 2);
        let chain = Chain::builder()
            .source("feed", 2, pool, |out, sync| {
                sync.with(|pool| {
                    for sec in [100i64, 200, 300] {
                        let frame = Frame {
                            format: TrackFormat::Mark5B,
                            ntrack: 32,
                            time: FrameTime { sec, ns: 125 },
                            data: pool.get(),
                        };
                        if !out.push(frame) {
                            break;
                        }
                    }
                });
                Ok(())
            })
            .sink("grab", TimeGrabArgs::default(), timegrabber);
        chain.run().unwrap();
        chain.wait().unwrap();

        let grabbed = chain
            .communicate::<TimeGrabArgs, _>(1, |a| a.last)
            .unwrap()
            .expect("frames were seen");
        assert_eq!(grabbed.data.sec, 300);
        assert_eq!(grabbed.data.ns, 125);
        assert!(grabbed.os_sec > 0);
    }
}
