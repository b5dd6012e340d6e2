use std::sync::{Arc, atomic::{AtomicU64, Ordering}};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use spool_blocks::{Block, Blockpool};
use spool_chain::{Inq, Outq, Pop, StageError, SyncArgs};
use spool_format::{FakeFrame, TrackFormat};
use tracing::{debug, info, warn};

pub struct FakerArgs {
    pub format: TrackFormat,
    pub ntrack: u32,
    pub counter: Arc<AtomicU64>,
}

/// Keep a correlator input alive through source outages: pass real blocks
/// through, but once the input has been silent for two pop timeouts
/// (about two seconds) start injecting header-valid synthesised frames
/// stamped with the wall clock.
pub fn faker(
    inq: &Inq<Block>,
    out: &Outq<Block>,
    sync: &SyncArgs<FakerArgs>,
) -> Result<(), StageError> {
    let (format, ntrack, counter) = sync.with(|a| (a.format, a.ntrack, Arc::clone(&a.counter)));
    let Some(mut fake) = FakeFrame::new(format, ntrack) else {
        warn!(%format, "no fake frames for this format, passing through only");
        while let Some(b) = inq.pop() {
            if !out.push(b) {
                break;
            }
        }
        return Ok(());
    };
    let pool = Blockpool::new(fake.size(), 4);

    info!(%format, size = fake.size(), "faker standing by");
    let mut ntimeouts = 0u32;
    loop {
        match inq.pop_deadline(Duration::from_secs(1)) {
            Pop::Disabled => break,
            Pop::Popped(b) => {
                ntimeouts = 0;
                counter.fetch_add(b.len() as u64, Ordering::Relaxed);
                if !out.push(b) {
                    break;
                }
            }
            Pop::TimedOut => {
                ntimeouts += 1;
                if ntimeouts <= 2 {
                    continue;
                }
                let clock = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                fake.update(clock);
                // fresh block from our own pool so refcounting of the real
                // stream is untouched
                let mut b = pool.get();
                b.as_mut_slice().copy_from_slice(fake.bytes());
                debug!(clock, "input silent, injecting synthesised frame");
                if !out.push(b) {
                    break;
                }
            }
        }
    }
    debug!("faker stopping");
    Ok(())
}

#[cfg(test)]
mod test {
    use spool_chain::{Chain, Queue};
    use spool_format::MK5B_SYNCWORD;

    use super::*;

    #[test]
    fn injects_after_silence_and_passes_real_data() {
        let feed: Queue<Block> = Queue::new(4);
        let collected = Arc::new(std::sync::Mutex::new(Vec::<Block>::new()));
        let sink = Arc::clone(&collected);

        let args = FakerArgs {
            format: TrackFormat::Mark5B,
            ntrack: 32,
            counter: Arc::new(AtomicU64::new(0)),
        };
        let feed2 = feed.clone();
        let chain = Chain::builder()
            .source("relay", 4, feed2, |out, sync| {
                let q = sync.with(|q| q.clone());
                while let Some(b) = q.pop() {
                    if !out.push(b) {
                        break;
                    }
                }
                Ok(())
            })
            .step("faker", 4, args, faker)
            .sink("collect", (), move |inq, _| {
                while let Some(b) = inq.pop() {
                    sink.lock().unwrap().push(b);
                }
                Ok(())
            });
        chain.run().unwrap();

        // feed one real block
        let pool = Blockpool::new(64, 2);
        let mut real = pool.get();
        real.as_mut_slice().fill(0x77);
        feed.push(real);

        // then silence long enough for the faker to step in
        std::thread::sleep(std::time::Duration::from_millis(3400));
        feed.delayed_disable();
        chain.wait().unwrap();

        let got = collected.lock().unwrap();
        assert!(got.len() >= 2, "expected the real block plus at least one fake");
        assert!(got[0].as_slice().iter().all(|&b| b == 0x77));
        // a fake is sixteen valid Mark5B frames
        let fake = &got[1];
        assert_eq!(&fake.as_slice()[0..4], &MK5B_SYNCWORD);
    }
}
