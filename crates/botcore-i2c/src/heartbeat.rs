//! Keep-alive actions issued when the engine has been idle for longer than
//! the configured heartbeat interval.

use crate::window::ReadWindow;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::trace;

/// What to do when a heartbeat is due. Checked in declaration order: the
/// first applicable action wins.
///
/// `reread_last_read` and `rewrite_last_written` ride the port's existing
/// buffers and cost nothing extra; `read_window` performs a full read from a
/// dedicated worker thread so it cannot entangle the callback state machine.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatAction {
    /// If the port is in read mode, re-fire the last read transaction.
    pub reread_last_read: bool,
    /// If the port is in write mode, re-send the last written bytes.
    pub rewrite_last_written: bool,
    /// Fall back to reading this window, as an ordinary client would.
    pub read_window: Option<Arc<ReadWindow>>,
}

impl HeartbeatAction {
    /// Heartbeat that re-issues whichever transaction the port last carried.
    pub fn refresh_last_transaction() -> Self {
        Self {
            reread_last_read: true,
            rewrite_last_written: true,
            read_window: None,
        }
    }

    pub fn read_window(window: ReadWindow) -> Self {
        Self {
            reread_last_read: false,
            rewrite_last_written: false,
            read_window: Some(Arc::new(window)),
        }
    }
}

/// Spawns the window-heartbeat worker.
///
/// The channel holds at most one job: if a heartbeat read is still running
/// when the next heartbeat comes due, the new job is simply skipped. Dropping
/// the sender shuts the worker down; callers join the returned handle.
pub(crate) fn spawn_worker<F>(tag: &str, handler: F) -> (Sender<Arc<ReadWindow>>, Option<JoinHandle<()>>)
where
    F: Fn(Arc<ReadWindow>) + Send + 'static,
{
    let (tx, rx): (Sender<Arc<ReadWindow>>, Receiver<Arc<ReadWindow>>) = bounded(1);
    let thread_tag = tag.to_owned();
    let handle = thread::Builder::new()
        .name(format!("{tag}-heartbeat"))
        .spawn(move || {
            while let Ok(window) = rx.recv() {
                trace!(tag = %thread_tag, "heartbeat window read");
                handler(window);
            }
        })
        .ok();
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::ReadMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_worker_runs_jobs_and_joins_on_sender_drop() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let (tx, handle) = spawn_worker("test", move |window| {
            assert_eq!(window.register_count(), 2);
            ran2.fetch_add(1, Ordering::AcqRel);
        });
        let window = Arc::new(ReadWindow::new(0, 2, ReadMode::Repeat).unwrap());
        tx.send(window).unwrap();

        // dropping the sender is the shutdown signal
        drop(tx);
        handle.unwrap().join().unwrap();
        assert_eq!(ran.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_full_queue_drops_new_jobs() {
        let (tx, handle) = spawn_worker("test", move |_| {
            thread::sleep(Duration::from_millis(50));
        });
        let window = || Arc::new(ReadWindow::new(0, 1, ReadMode::Repeat).unwrap());
        tx.send(window()).unwrap();
        tx.send(window()).unwrap(); // sits in the one-slot buffer
        assert!(tx.try_send(window()).is_err());
        drop(tx);
        handle.unwrap().join().unwrap();
    }
}
