//! Loop dispatcher.
//!
//! Popup tracking has to happen on a thread that owns a message target and
//! pumps its messages. [`LoopDispatcher`] owns one such thread and runs queued
//! work on it, one job at a time, in submission order. Callers either block
//! for the result ([`LoopDispatcher::run_blocking`]) or get a future that
//! resolves on their own runtime ([`LoopDispatcher::run_nonblocking`]).

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, Thread, ThreadId};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::config::MenuConfig;
use crate::platform::{MessageTarget, PlatformError};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The loop thread is gone; nothing was run
    #[error("menu loop is not running")]
    Unavailable,

    /// The job was accepted but never delivered a result
    #[error("menu loop dropped the request before completing it")]
    Dropped,

    /// A blocking call was made from the loop thread itself
    #[error("blocking dispatch called from the menu loop thread")]
    Reentrant,

    #[error("menu loop failed to start: {0}")]
    Startup(PlatformError),

    #[error("failed to spawn menu loop thread: {0}")]
    Spawn(#[source] io::Error),
}

// ============================================================================
// Message Loop
// ============================================================================

/// Native wait primitive owned by the loop thread.
pub trait MessageLoop {
    /// Handle popups should report to
    fn target(&self) -> MessageTarget;

    /// Block until woken, pumping native messages meanwhile.
    /// Returns `false` once the loop has been asked to quit.
    fn wait(&mut self) -> bool;
}

/// Cross-thread half of a [`MessageLoop`]
pub trait LoopWaker: Send + Sync {
    /// Nudge the loop out of `wait`. Returns `false` if it can no longer be reached.
    fn wake(&self) -> bool;

    fn quit(&self);
}

pub type LoopParts = (Box<dyn MessageLoop>, Arc<dyn LoopWaker>);

struct ParkSignal {
    thread: Thread,
    pending: AtomicBool,
    quit: AtomicBool,
}

struct ParkingLoop {
    signal: Arc<ParkSignal>,
}

impl MessageLoop for ParkingLoop {
    fn target(&self) -> MessageTarget {
        MessageTarget::default()
    }

    fn wait(&mut self) -> bool {
        loop {
            if self.signal.quit.load(Ordering::Acquire) {
                return false;
            }
            if self.signal.pending.swap(false, Ordering::AcqRel) {
                return true;
            }
            thread::park();
        }
    }
}

struct ParkingWaker {
    signal: Arc<ParkSignal>,
}

impl LoopWaker for ParkingWaker {
    fn wake(&self) -> bool {
        if self.signal.quit.load(Ordering::Acquire) {
            return false;
        }
        self.signal.pending.store(true, Ordering::Release);
        self.signal.thread.unpark();
        true
    }

    fn quit(&self) {
        self.signal.quit.store(true, Ordering::Release);
        self.signal.thread.unpark();
    }
}

/// Loop without a native message queue, parked between jobs.
///
/// Must be called on the thread that will run the loop.
pub fn parking_loop() -> Result<LoopParts, PlatformError> {
    let signal = Arc::new(ParkSignal {
        thread: thread::current(),
        pending: AtomicBool::new(false),
        quit: AtomicBool::new(false),
    });
    Ok((
        Box::new(ParkingLoop {
            signal: signal.clone(),
        }),
        Arc::new(ParkingWaker { signal }),
    ))
}

/// The message loop for this OS: a hidden window on Windows, a parking
/// loop elsewhere.
pub fn native_loop() -> Result<LoopParts, PlatformError> {
    #[cfg(target_os = "windows")]
    {
        crate::os_windows::create_loop()
    }

    #[cfg(not(target_os = "windows"))]
    {
        parking_loop()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// What a job can see of the loop it runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopContext {
    target: MessageTarget,
    thread_id: ThreadId,
}

impl LoopContext {
    pub fn target(&self) -> MessageTarget {
        self.target
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

type Job = Box<dyn FnOnce(&LoopContext) + Send>;

/// Runs work on a dedicated message-loop thread
pub struct LoopDispatcher {
    jobs: Mutex<Option<Sender<Job>>>,
    waker: Arc<dyn LoopWaker>,
    context: LoopContext,
    thread: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LoopDispatcher {
    /// Start the loop thread with the native message loop
    pub fn spawn(config: &MenuConfig) -> Result<Self, DispatchError> {
        Self::spawn_with(&config.thread_name, native_loop)
    }

    /// Start the loop thread, building its message loop with `factory` on
    /// that thread. Returns once the loop is ready to accept work.
    pub fn spawn_with<F>(name: &str, factory: F) -> Result<Self, DispatchError>
    where
        F: FnOnce() -> Result<LoopParts, PlatformError> + Send + 'static,
    {
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded::<Job>();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let (mut message_loop, waker) = match factory() {
                    Ok(parts) => parts,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let context = LoopContext {
                    target: message_loop.target(),
                    thread_id: thread::current().id(),
                };
                if ready_tx.send(Ok((waker, context))).is_err() {
                    return;
                }
                run_loop(message_loop.as_mut(), &jobs_rx, &context);
            })
            .map_err(DispatchError::Spawn)?;

        match ready_rx.recv() {
            Ok(Ok((waker, context))) => {
                debug!(thread = name, "menu loop started");
                Ok(Self {
                    jobs: Mutex::new(Some(jobs_tx)),
                    waker,
                    context,
                    thread: Mutex::new(Some(handle)),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(DispatchError::Startup(e))
            }
            Err(_) => {
                let _ = handle.join();
                Err(DispatchError::Unavailable)
            }
        }
    }

    /// Whether the loop thread is still there to run jobs. A job that
    /// panics takes the thread down with it.
    pub fn is_running(&self) -> bool {
        lock(&self.jobs).is_some()
            && lock(&self.thread)
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    pub fn loop_thread_id(&self) -> ThreadId {
        self.context.thread_id
    }

    /// Queue `work` for the loop thread; its value is handed to `deliver`,
    /// also on the loop thread.
    pub fn post<T, W, D>(&self, work: W, deliver: D) -> Result<(), DispatchError>
    where
        W: FnOnce(&LoopContext) -> T + Send + 'static,
        D: FnOnce(T) + Send + 'static,
        T: 'static,
    {
        let sender = lock(&self.jobs)
            .as_ref()
            .cloned()
            .ok_or(DispatchError::Unavailable)?;

        let job: Job = Box::new(move |context| deliver(work(context)));
        sender.send(job).map_err(|_| DispatchError::Unavailable)?;

        if !self.waker.wake() {
            warn!("menu loop did not accept wake-up");
        }
        trace!("job posted to menu loop");
        Ok(())
    }

    /// Run `work` on the loop thread and wait for its result.
    pub fn run_blocking<T, W>(&self, work: W) -> Result<T, DispatchError>
    where
        W: FnOnce(&LoopContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        if thread::current().id() == self.context.thread_id {
            return Err(DispatchError::Reentrant);
        }

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.post(work, move |value| {
            let _ = reply_tx.send(value);
        })?;
        reply_rx.recv().map_err(|_| DispatchError::Dropped)
    }

    /// Queue `work` and return immediately. The returned future resolves to
    /// `continuation(result)`, evaluated wherever the future is polled.
    ///
    /// Dropping the future does not cancel the job; its result is discarded.
    pub fn run_nonblocking<T, R, W, C>(
        &self,
        work: W,
        continuation: C,
    ) -> impl Future<Output = Result<R, DispatchError>> + Send + 'static
    where
        W: FnOnce(&LoopContext) -> T + Send + 'static,
        T: Send + 'static,
        C: FnOnce(T) -> R + Send + 'static,
        R: 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let posted = self.post(work, move |value| {
            let _ = reply_tx.send(value);
        });

        async move {
            posted?;
            let value = reply_rx.await.map_err(|_| DispatchError::Dropped)?;
            Ok::<R, DispatchError>(continuation(value))
        }
    }

    /// Stop accepting work, let queued jobs finish and join the loop thread.
    pub fn shutdown(&self) {
        if lock(&self.jobs).take().is_none() {
            return;
        }
        self.waker.quit();

        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if thread::current().id() == self.context.thread_id {
                return;
            }
            if handle.join().is_err() {
                warn!("menu loop thread panicked");
            }
        }
        debug!("menu loop stopped");
    }
}

impl Drop for LoopDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(message_loop: &mut dyn MessageLoop, jobs: &Receiver<Job>, context: &LoopContext) {
    loop {
        loop {
            match jobs.try_recv() {
                Ok(job) => job(context),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }
        if !message_loop.wait() {
            // Drain whatever was queued before the quit request
            while let Ok(job) = jobs.try_recv() {
                job(context);
            }
            return;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
