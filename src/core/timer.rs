//! Capture timer
//!
//! Single-shot timer driving the auto-stop of a timed capture.

use super::error::NotchError;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Single-shot timer
///
/// Once the deadline passes, the callback runs to completion even if the
/// timer is cancelled or dropped meanwhile.
#[derive(Debug, Default)]
pub struct CaptureTimer {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

impl CaptureTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer to run `on_fire` after `duration`
    pub fn schedule<F, Fut>(
        &mut self,
        duration: Duration,
        on_fire: F,
    ) -> Result<Instant, NotchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_armed() {
            return Err(NotchError::TimerAlreadyArmed);
        }

        let token = CancellationToken::new();
        let deadline = Instant::now() + duration;
        let cancelled = token.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    debug!("capture timer disarmed");
                    return;
                }
                _ = sleep_until(deadline) => {}
            }
            debug!("capture timer fired");
            on_fire().await;
        });

        self.token = Some(token);
        self.deadline = Some(deadline);
        self.task = Some(task);
        Ok(deadline)
    }

    /// Disarm the timer
    ///
    /// Returns `true` if a pending timer was disarmed. Idempotent.
    pub fn cancel(&mut self) -> bool {
        let armed = self.is_armed();
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.deadline = None;
        self.task = None;
        armed
    }

    /// Check if the timer is waiting to fire
    pub fn is_armed(&self) -> bool {
        match (&self.token, &self.task, self.deadline) {
            (Some(token), Some(task), Some(deadline)) => {
                !token.is_cancelled() && !task.is_finished() && Instant::now() < deadline
            }
            _ => false,
        }
    }

    /// Scheduled fire instant
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the timer fires
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .filter(|_| self.is_armed())
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

impl Drop for CaptureTimer {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (
        Arc<AtomicUsize>,
        impl FnOnce() -> futures::future::Ready<()> + Send + 'static,
    ) {
        let fired = Arc::new(AtomicUsize::new(0));
        let hits = fired.clone();
        (fired, move || {
            hits.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_duration() {
        let mut timer = CaptureTimer::new();
        let (fired, on_fire) = counter();

        let deadline = timer.schedule(Duration::from_millis(500), on_fire).unwrap();
        assert_eq!(timer.deadline(), Some(deadline));
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_schedule_while_armed_fails() {
        let mut timer = CaptureTimer::new();
        let (_, first) = counter();
        let (_, second) = counter();

        timer.schedule(Duration::from_secs(1), first).unwrap();
        assert!(matches!(
            timer.schedule(Duration::from_secs(1), second),
            Err(NotchError::TimerAlreadyArmed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let mut timer = CaptureTimer::new();
        let (fired, on_fire) = counter();

        timer.schedule(Duration::from_millis(100), on_fire).unwrap();
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert_eq!(timer.remaining(), None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let (_, again) = counter();
        assert!(timer.schedule(Duration::from_millis(100), again).is_ok());
    }
}
