//! Cooperative cancellation of blocked network work.
//!
//! A [`CancelableWork`] belongs to exactly one race participant. The
//! participant registers the socket it is currently blocked on with
//! [`watch_stream`](CancelableWork::watch_stream) or
//! [`watch_socket`](CancelableWork::watch_socket); [`cancel`](CancelableWork::cancel)
//! raises the flag, shuts that socket down so any in-flight I/O fails, and wakes
//! every future parked in [`guard`](CancelableWork::guard).

use std::future::Future;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{SockRef, Socket};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Notify;

use crate::error::{Error, Result};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Phase {
    Idle,
    Running,
    Succeeded,
    Canceled,
    TimedOut,
}

struct WorkState {
    phase: Phase,
    // duplicate of the descriptor the owner is blocked on; shutdown(2) acts on
    // the shared socket, so shutting the duplicate down unblocks the owner
    handle: Option<Socket>,
}

pub struct CancelableWork {
    cancelled: AtomicBool,
    notify: Notify,
    state: Mutex<WorkState>,
}

impl Default for CancelableWork {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelableWork {
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
            state: Mutex::new(WorkState {
                phase: Phase::Idle,
                handle: None,
            }),
        }
    }
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }
    /// `Idle -> Running`. Returns false when the work was cancelled before it started.
    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        if self.is_cancelled() {
            return false;
        }
        if state.phase == Phase::Idle {
            state.phase = Phase::Running;
        }
        true
    }
    /// Move a running work into a terminal phase; terminal phases are sticky.
    pub fn finish(&self, phase: Phase) {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Idle | Phase::Running) {
            state.phase = phase;
        }
    }
    /// Idempotent and infallible. Errors from shutting the handle down are swallowed.
    pub fn cancel(&self) {
        let handle = {
            let mut state = self.state.lock();
            self.cancelled.store(true, Ordering::Release);
            if matches!(state.phase, Phase::Idle | Phase::Running) {
                state.phase = Phase::Canceled;
            }
            state.handle.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.shutdown(Shutdown::Both) {
                log::trace!("shutdown on cancel {e:?}");
            }
        }
        self.notify.notify_waiters();
    }
    pub fn watch_stream(&self, stream: &TcpStream) -> Result<()> {
        let handle = SockRef::from(stream).try_clone()?;
        self.watch(handle)
    }
    pub fn watch_socket(&self, socket: &TcpSocket) -> Result<()> {
        let handle = SockRef::from(socket).try_clone()?;
        self.watch(handle)
    }
    fn watch(&self, handle: Socket) -> Result<()> {
        let mut state = self.state.lock();
        // checked under the lock, so a concurrent cancel either sees the new
        // handle or has already raised the flag
        if self.is_cancelled() {
            drop(state);
            _ = handle.shutdown(Shutdown::Both);
            return Err(Error::Cancelled);
        }
        state.handle = Some(handle);
        Ok(())
    }
    /// Stop watching without touching the socket; used when ownership of the
    /// connection moves to the caller.
    pub fn release(&self) {
        self.state.lock().handle.take();
    }
    /// Run `fut` until it completes or the work is cancelled.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = notified => Err(Error::Cancelled),
            output = fut => Ok(output),
        }
    }
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.guard(tokio::time::sleep(duration)).await
    }
}
