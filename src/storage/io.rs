//! # Asynchronous I/O Queue
//!
//! Page reads and writes are not performed by the caller. They are pushed
//! onto a single submission queue served by a fixed pool of worker threads,
//! which gives the storage engine an io_uring-style submit / complete split
//! on top of ordinary positional I/O.
//!
//! ## Design Overview
//!
//! ```text
//! load miss ───┐                              ┌──> worker 0 ──┐
//! prefetch ────┼──> submission queue ─────────┼──> worker 1 ──┼──> completion
//! write batch ─┘    Mutex<VecDeque> + Condvar └──> worker N ──┘    (ticket or
//!                                                                   callback)
//! ```
//!
//! `depth` workers means at most `depth` requests are in flight against the
//! file at once; everything else waits in FIFO order. Requests carry an
//! `Arc<PageBuf>`: a read fills it (it must be uniquely owned), a write sends
//! its contents.
//!
//! ## Completion
//!
//! Each request completes exactly once, in one of two ways:
//!
//! - **Ticket**: the submitter holds an [`IoTicket`] and blocks in
//!   [`IoTicket::wait`] until the worker hands back the [`IoCompletion`].
//! - **Callback**: the worker invokes a boxed closure with the completion.
//!   Prefetch uses this to install pages into the cache without anyone
//!   waiting.
//!
//! Waits are unbounded; no request is ever cancelled.
//!
//! ## Shutdown
//!
//! Dropping the queue marks it shut down and joins the workers. Workers only
//! exit once the queue is empty, so every submitted request still completes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{bail, ensure, eyre, Result, WrapErr};
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use super::file::PageFile;
use super::page::PageBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

/// Outcome of one request, handed back with the buffer it used.
#[derive(Debug)]
pub struct IoCompletion {
    pub kind: IoKind,
    pub sector: u64,
    pub buf: Arc<PageBuf>,
    pub result: Result<()>,
}

pub type IoCallback = Box<dyn FnOnce(IoCompletion) + Send + 'static>;

enum Completion {
    Ticket(Arc<TicketSlot>),
    Callback(IoCallback),
}

struct IoRequest {
    kind: IoKind,
    sector: u64,
    buf: Arc<PageBuf>,
    completion: Completion,
}

struct TicketSlot {
    done: Mutex<Option<IoCompletion>>,
    ready: Condvar,
}

/// Handle to a submitted request.
pub struct IoTicket {
    slot: Arc<TicketSlot>,
}

impl IoTicket {
    /// Blocks until the request completes.
    pub fn wait(self) -> IoCompletion {
        let mut done = self.slot.done.lock();
        loop {
            if let Some(completion) = done.take() {
                return completion;
            }
            self.slot.ready.wait(&mut done);
        }
    }
}

/// Counters for completed requests.
#[derive(Debug, Default)]
pub struct IoStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub failures: AtomicU64,
}

struct QueueState {
    pending: VecDeque<IoRequest>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    work_available: Condvar,
    file: Arc<PageFile>,
    stats: IoStats,
}

pub struct IoQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl IoQueue {
    pub fn new(file: Arc<PageFile>, depth: usize) -> Result<Self> {
        ensure!(depth > 0, "I/O queue depth must be at least 1");

        let mut queue = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    pending: VecDeque::with_capacity(depth * 4),
                    shutdown: false,
                }),
                work_available: Condvar::new(),
                file,
                stats: IoStats::default(),
            }),
            workers: Vec::with_capacity(depth),
        };

        for id in 0..depth {
            let shared = Arc::clone(&queue.shared);
            let handle = std::thread::Builder::new()
                .name(format!("cowtree-io-{}", id))
                .spawn(move || worker_loop(&shared))
                .wrap_err_with(|| format!("failed to spawn I/O worker {}", id))?;
            queue.workers.push(handle);
        }

        Ok(queue)
    }

    pub fn submit_read(&self, sector: u64, buf: Arc<PageBuf>) -> Result<IoTicket> {
        self.submit_ticket(IoKind::Read, sector, buf)
    }

    pub fn submit_write(&self, sector: u64, buf: Arc<PageBuf>) -> Result<IoTicket> {
        self.submit_ticket(IoKind::Write, sector, buf)
    }

    /// Submits a read whose completion is delivered to `callback` on the
    /// worker thread. Returns as soon as the request is queued.
    pub fn submit_read_with(
        &self,
        sector: u64,
        buf: Arc<PageBuf>,
        callback: IoCallback,
    ) -> Result<()> {
        self.push(IoRequest {
            kind: IoKind::Read,
            sector,
            buf,
            completion: Completion::Callback(callback),
        })
    }

    fn submit_ticket(&self, kind: IoKind, sector: u64, buf: Arc<PageBuf>) -> Result<IoTicket> {
        let slot = Arc::new(TicketSlot {
            done: Mutex::new(None),
            ready: Condvar::new(),
        });

        self.push(IoRequest {
            kind,
            sector,
            buf,
            completion: Completion::Ticket(Arc::clone(&slot)),
        })?;

        Ok(IoTicket { slot })
    }

    fn push(&self, request: IoRequest) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                bail!("I/O queue is shut down");
            }
            trace!(sector = request.sector, kind = ?request.kind, "submit I/O");
            state.pending.push_back(request);
        }
        self.shared.work_available.notify_one();
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> &IoStats {
        &self.shared.stats
    }

    pub fn file(&self) -> &Arc<PageFile> {
        &self.shared.file
    }
}

impl Drop for IoQueue {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work_available.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("I/O worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let request = {
            let mut state = shared.state.lock();
            loop {
                if let Some(request) = state.pending.pop_front() {
                    break request;
                }
                if state.shutdown {
                    return;
                }
                shared.work_available.wait(&mut state);
            }
        };

        let IoRequest {
            kind,
            sector,
            mut buf,
            completion,
        } = request;

        let result = perform(&shared.file, kind, sector, &mut buf);

        match (&result, kind) {
            (Err(e), _) => {
                shared.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(sector, kind = ?kind, error = %e, "I/O request failed");
            }
            (Ok(()), IoKind::Read) => {
                shared.stats.reads.fetch_add(1, Ordering::Relaxed);
            }
            (Ok(()), IoKind::Write) => {
                shared.stats.writes.fetch_add(1, Ordering::Relaxed);
            }
        }

        let done = IoCompletion {
            kind,
            sector,
            buf,
            result,
        };

        match completion {
            Completion::Ticket(slot) => {
                *slot.done.lock() = Some(done);
                slot.ready.notify_all();
            }
            Completion::Callback(callback) => callback(done),
        }
    }
}

fn perform(file: &PageFile, kind: IoKind, sector: u64, buf: &mut Arc<PageBuf>) -> Result<()> {
    match kind {
        IoKind::Read => {
            let page = Arc::get_mut(buf)
                .ok_or_else(|| eyre!("read buffer for sector {} is shared", sector))?;
            file.read_page(sector, page)
        }
        IoKind::Write => file.write_page(sector, buf),
    }
}
