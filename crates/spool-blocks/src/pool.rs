use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::{Block, block::Backing};

/// Past this many live generations we assume blocks are leaking somewhere
/// downstream and start complaining.
const GENERATION_CAP: usize = 32;

struct PoolInner {
    bufsize: usize,
    nper: usize,
    generations: Vec<Vec<Arc<Backing>>>,
    // where the last get() left off, so steady-state reuse cycles instead
    // of rescanning from the front
    cursor: usize,
    warned: bool,
}

impl PoolInner {
    /// Find a buffer nothing references anymore, newest generation first.
    fn take_free(&mut self) -> Option<Arc<Backing>> {
        let r#gen = self.generations.last()?;
        let n = r#gen.len();
        for i in 0..n {
            let idx = (self.cursor + i) % n;
            if Arc::strong_count(&r#gen[idx]) == 1 {
                self.cursor = (idx + 1) % n;
                return Some(Arc::clone(&r#gen[idx]));
            }
        }
        // nothing free in the current generation; check the older ones
        for r#gen in self.generations.iter().rev().skip(1) {
            for buf in r#gen {
                if Arc::strong_count(buf) == 1 {
                    return Some(Arc::clone(buf));
                }
            }
        }
        None
    }

    fn grow(&mut self) {
        // an old generation whose buffers are all free can go back to the
        // allocator before we ask it for a new one
        if self.generations.len() > 1 {
            let keep = self.generations.len() - 1;
            self.generations[..keep]
                .iter_mut()
                .for_each(|g| g.retain(|b| Arc::strong_count(b) > 1));
            self.generations.retain(|g| !g.is_empty());
        }

        let mut r#gen = Vec::with_capacity(self.nper);
        for _ in 0..self.nper {
            r#gen.push(Backing::new(self.bufsize));
        }
        self.generations.push(r#gen);
        self.cursor = 0;

        if self.generations.len() > GENERATION_CAP && !self.warned {
            self.warned = true;
            warn!(
                generations = self.generations.len(),
                bufsize = self.bufsize,
                "blockpool keeps growing, downstream is probably leaking blocks"
            );
        }
    }
}

/// Slab allocator handing out equally-sized [`Block`]s, growing a
/// generation of `nper` buffers at a time. Steady state allocates nothing:
/// freed buffers are recycled in cycling order. The pool may be dropped
/// while blocks are still in flight; their memory lives until the last view
/// goes.
#[derive(Clone)]
pub struct Blockpool {
    inner: Arc<Mutex<PoolInner>>,
    bufsize: usize,
}

impl Blockpool {
    pub fn new(bufsize: usize, nper: usize) -> Self {
        assert!(bufsize > 0 && nper > 0);
        Blockpool {
            inner: Arc::new(Mutex::new(PoolInner {
                bufsize,
                nper,
                generations: Vec::new(),
                cursor: 0,
                warned: false,
            })),
            bufsize,
        }
    }

    /// Next free buffer as a full-size block. Never blocks: exhaustion
    /// allocates a fresh generation instead of waiting for a free buffer.
    pub fn get(&self) -> Block {
        let mut inner = self.inner.lock().unwrap();
        if let Some(buf) = inner.take_free() {
            return Block::whole(buf);
        }
        inner.grow();
        let buf = inner.take_free().expect("fresh generation has free buffers");
        Block::whole(buf)
    }

    pub fn bufsize(&self) -> usize {
        self.bufsize
    }

    /// Buffers currently out with callers.
    pub fn in_use(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .generations
            .iter()
            .flatten()
            .filter(|b| Arc::strong_count(b) > 1)
            .count()
    }

    /// Total buffers allocated over all generations.
    pub fn capacity(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.generations.iter().map(Vec::len).sum()
    }
}
