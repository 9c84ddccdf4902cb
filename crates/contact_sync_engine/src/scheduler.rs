//! Debounced backup scheduling.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

type FireFn = dyn Fn() + Send + Sync;

struct Armed {
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    armed: Option<Armed>,
    next_generation: u64,
}

/// A single-shot timer that coalesces backup requests.
///
/// At most one timer is armed at a time. Arming while armed is a no-op.
/// When the timer fires, the schedule is cleared before the action runs,
/// so the action may arm the scheduler again.
#[derive(Clone)]
pub struct BackupScheduler {
    slot: Arc<Mutex<Slot>>,
    delay: Duration,
    runtime: Handle,
    fire: Arc<FireFn>,
}

impl BackupScheduler {
    /// Creates a disarmed scheduler that runs `fire` on `runtime` once
    /// `delay` has passed after arming.
    pub fn new(delay: Duration, runtime: Handle, fire: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            delay,
            runtime,
            fire: Arc::new(fire),
        }
    }

    /// Returns the delay between arming and firing.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arms the timer. Returns false if it was already armed.
    pub fn arm(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.armed.is_some() {
            return false;
        }

        let generation = slot.next_generation;
        slot.next_generation += 1;

        let delay = self.delay;
        let shared = Arc::clone(&self.slot);
        let fire = Arc::clone(&self.fire);
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            {
                let mut slot = shared.lock();
                if slot.armed.as_ref().map(|armed| armed.generation) != Some(generation) {
                    return;
                }
                slot.armed = None;
            }

            tracing::debug!("backup timer fired");
            fire();
        });

        slot.armed = Some(Armed { generation, timer });
        tracing::debug!(delay_secs = delay.as_secs(), "backup timer armed");
        true
    }

    /// Returns true if a timer is armed.
    pub fn is_armed(&self) -> bool {
        self.slot.lock().armed.is_some()
    }

    /// Disarms the timer without firing. Returns true if one was armed.
    pub fn clear(&self) -> bool {
        match self.slot.lock().armed.take() {
            Some(armed) => {
                armed.timer.abort();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for BackupScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupScheduler")
            .field("delay", &self.delay)
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_scheduler(delay: Duration) -> (BackupScheduler, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let scheduler = BackupScheduler::new(delay, Handle::current(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (scheduler, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn arming_is_coalesced() {
        let delay = Duration::from_secs(600);
        let (scheduler, fired) = counting_scheduler(delay);

        assert!(scheduler.arm());
        assert!(!scheduler.arm());
        assert!(scheduler.is_armed());

        tokio::time::sleep(delay + Duration::from_millis(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_fire_early() {
        let delay = Duration::from_secs(600);
        let (scheduler, fired) = counting_scheduler(delay);

        scheduler.arm();
        tokio::time::sleep(delay - Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_after_fire() {
        let delay = Duration::from_secs(10);
        let (scheduler, fired) = counting_scheduler(delay);

        scheduler.arm();
        tokio::time::sleep(delay + Duration::from_millis(1)).await;
        assert!(scheduler.arm());
        tokio::time::sleep(delay + Duration::from_millis(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_prevents_fire() {
        let delay = Duration::from_secs(10);
        let (scheduler, fired) = counting_scheduler(delay);

        scheduler.arm();
        assert!(scheduler.clear());
        assert!(!scheduler.clear());

        tokio::time::sleep(delay * 2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
