//! Reader pool: one thread per enabled cache entry.
//!
//! The pool is elastic: it grows to the number of enabled cache entries of
//! the current request (bounded by the request cap, which the controller
//! enforces before dispatch) and never shrinks. Each reader sleeps on its
//! condition variable until the controller hands it a cache entry, performs
//! the read appropriate to the request kind, stores the result in the
//! entry's slot, and signals completion.

use crate::geometry::{Extent, Point3};
use crate::io::SharedEntry;
use anyhow::{Context, Result};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// What a reader does with its assigned cache entry.
#[derive(Debug, Clone, Copy)]
pub enum ReadTask {
    /// Sample the raster at a point (point requests)
    Sample(Point3),
    /// Read the pixel rectangle overlapping an extent (AOI requests)
    Subset(Extent),
}

enum SlotState {
    Idle,
    Pending(SharedEntry, ReadTask),
    Done,
}

struct Slot {
    state: SlotState,
    run: bool,
}

type Shared = Arc<(Mutex<Slot>, Condvar, Condvar)>;

struct Reader {
    shared: Shared,
    thread: Option<JoinHandle<()>>,
}

/// Elastic pool of raster reader threads.
pub struct ReaderPool {
    readers: Vec<Reader>,
    sys_timeout: Duration,
}

impl ReaderPool {
    pub fn new(sys_timeout: Duration) -> Self {
        Self {
            readers: Vec::new(),
            sys_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Grow the pool to at least `count` threads.
    pub fn ensure(&mut self, count: usize) -> Result<()> {
        while self.readers.len() < count {
            let i = self.readers.len();
            let shared: Shared = Arc::new((
                Mutex::new(Slot {
                    state: SlotState::Idle,
                    run: true,
                }),
                Condvar::new(),
                Condvar::new(),
            ));
            let worker_shared = shared.clone();
            let sys_timeout = self.sys_timeout;
            let thread = std::thread::Builder::new()
                .name(format!("reader-{i}"))
                .spawn(move || reader_thread(worker_shared, sys_timeout))
                .context("Failed to create reader thread")?;
            self.readers.push(Reader {
                shared,
                thread: Some(thread),
            });
        }
        Ok(())
    }

    /// Hand each entry to its reader and wait for every read to finish.
    ///
    /// The caller must have grown the pool to at least `entries.len()`.
    pub fn dispatch(&self, entries: &[SharedEntry], task: ReadTask) {
        let count = entries.len().min(self.readers.len());

        for (reader, entry) in self.readers.iter().zip(entries.iter()).take(count) {
            let (lock, task_ready, _) = &*reader.shared;
            let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
            slot.state = SlotState::Pending(entry.clone(), task);
            task_ready.notify_one();
        }

        for reader in self.readers.iter().take(count) {
            let (lock, _, task_done) = &*reader.shared;
            let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                match std::mem::replace(&mut slot.state, SlotState::Idle) {
                    SlotState::Done => break,
                    other => slot.state = other,
                }
                slot = task_done
                    .wait_timeout(slot, self.sys_timeout)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
        }
    }
}

impl Drop for ReaderPool {
    fn drop(&mut self) {
        for reader in &self.readers {
            let (lock, task_ready, _) = &*reader.shared;
            let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
            slot.run = false;
            task_ready.notify_one();
        }
        for reader in &mut self.readers {
            if let Some(thread) = reader.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

fn reader_thread(shared: Shared, sys_timeout: Duration) {
    let (lock, task_ready, task_done) = &*shared;

    loop {
        let (entry, task) = {
            let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if !slot.run {
                    return;
                }
                match std::mem::replace(&mut slot.state, SlotState::Idle) {
                    SlotState::Pending(entry, task) => break (entry, task),
                    other => slot.state = other,
                }
                slot = task_ready
                    .wait_timeout(slot, sys_timeout)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
        };

        {
            let mut entry = entry.lock().unwrap_or_else(|e| e.into_inner());
            match task {
                ReadTask::Sample(point) => {
                    entry.sample = entry.handle.sample(&point);
                }
                ReadTask::Subset(extent) => {
                    entry.subset = entry.handle.subset(&extent);
                }
            }
        }

        let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
        slot.state = SlotState::Done;
        task_done.notify_one();
    }
}
