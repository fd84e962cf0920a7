//! Background thread that writes entries left dirty too long and runs
//! periodic reclaim.

use crate::journal::Journal;
use crate::writer::JournalWriter;
use lfs_error::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

/// Handle to the timer thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct WriteTimer {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl WriteTimer {
    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.cond.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WriteTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start the timer. Every `write_delay` it checks the open entry; one seen
/// dirty at the same seq on two consecutive ticks is closed and written.
/// Reclaim runs every `reclaim_delay`.
pub fn spawn_write_timer<W>(journal: Arc<Journal<W>>) -> Result<WriteTimer>
where
    W: JournalWriter + 'static,
{
    let signal = Arc::new(StopSignal::default());
    let tick = journal.config().write_delay();
    let reclaim_every = journal.config().reclaim_delay();
    let thread_signal = Arc::clone(&signal);
    let handle = std::thread::Builder::new()
        .name("lfs-journal-timer".to_owned())
        .spawn(move || {
            debug!(target: "lfs::journal", tick_ms = tick.as_millis(), "journal_timer_started");
            let mut seen = None;
            let mut since_reclaim = Duration::ZERO;
            loop {
                {
                    let mut stopped = thread_signal.stopped.lock();
                    if !*stopped {
                        thread_signal.cond.wait_for(&mut stopped, tick);
                    }
                    if *stopped {
                        break;
                    }
                }
                if journal.is_halted() {
                    break;
                }
                journal.timer_tick(&mut seen);
                since_reclaim += tick;
                if since_reclaim >= reclaim_every {
                    journal.reclaim();
                    since_reclaim = Duration::ZERO;
                }
            }
            debug!(target: "lfs::journal", "journal_timer_stopped");
        })?;
    Ok(WriteTimer {
        signal,
        handle: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalConfig;
    use crate::ring::JournalRing;
    use crate::writer::MemWriter;
    use lfs_types::{BucketNumber, DeviceIdx};
    use std::time::Instant;

    #[test]
    fn dirty_entry_is_written_without_flush() {
        let config = JournalConfig {
            entry_size_max: 512,
            write_delay_ms: 5,
            reclaim_delay_ms: 5,
            ..JournalConfig::default()
        };
        let ring = JournalRing::new(DeviceIdx(0), (0..4).map(BucketNumber).collect(), 8).unwrap();
        let journal = Arc::new(Journal::new(config, ring, MemWriter::new()).unwrap());
        let timer = spawn_write_timer(Arc::clone(&journal)).unwrap();

        let res = journal.res_get(1).unwrap();
        journal.res_put(res);

        let deadline = Instant::now() + Duration::from_secs(5);
        while journal.seq_ondisk() < 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        timer.stop();
        assert_eq!(journal.seq_ondisk(), 1);
        assert_eq!(journal.writer().len(), 1);
    }

    #[test]
    fn idle_journal_writes_nothing() {
        let config = JournalConfig {
            write_delay_ms: 2,
            ..JournalConfig::default()
        };
        let ring = JournalRing::new(DeviceIdx(0), (0..4).map(BucketNumber).collect(), 8).unwrap();
        let journal = Arc::new(Journal::new(config, ring, MemWriter::new()).unwrap());
        let timer = spawn_write_timer(Arc::clone(&journal)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        drop(timer);
        assert!(journal.writer().is_empty());
    }
}
