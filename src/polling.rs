use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::config::PollPolicy;
use crate::error::Result;
use crate::session::Session;

/// Consecutive samples at or above `target`. Any sample below target resets
/// the streak, so a count that touches the target once and falls back is never
/// mistaken for completion.
#[derive(Debug, Clone)]
pub struct StabilityCounter {
    target: u64,
    required: u32,
    last_observed: Option<u64>,
    streak: u32,
    resets: u32,
}

impl StabilityCounter {
    pub fn new(target: u64, required: u32) -> Self {
        Self {
            target,
            required: required.max(1),
            last_observed: None,
            streak: 0,
            resets: 0,
        }
    }

    /// Feed one sample; true once the streak reaches the required length.
    pub fn observe(&mut self, count: u64) -> bool {
        self.last_observed = Some(count);
        if count >= self.target {
            self.streak += 1;
        } else {
            if self.streak > 0 {
                self.resets += 1;
            }
            self.streak = 0;
        }
        self.is_stable()
    }

    pub fn is_stable(&self) -> bool {
        self.streak >= self.required
    }

    pub fn last_observed(&self) -> Option<u64> {
        self.last_observed
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Complete { count: u64, samples: u32 },
    /// The poll timed out. Not a failure by itself: callers may accept a
    /// partial import.
    Incomplete { last_count: u64, samples: u32 },
}

/// Sample the counter labelled `label` every `policy.interval` until it has
/// read at least `target` for `policy.stable_samples` samples in a row.
pub async fn poll_until_stable(
    session: &mut Session,
    label: &str,
    target: u64,
    policy: &PollPolicy,
) -> Result<PollOutcome> {
    let mut counter = StabilityCounter::new(target, policy.stable_samples);
    let deadline = Instant::now() + policy.timeout;
    let mut samples = 0u32;
    info!(label, target, required = policy.stable_samples, "polling for a stable count");
    loop {
        let snap = session.snapshot().await?;
        let count = snap.counter(label).unwrap_or(0);
        samples += 1;
        let stable = counter.observe(count);
        debug!(label, count, streak = counter.streak(), "poll sample");
        if stable {
            info!(label, count, samples, "count stable");
            return Ok(PollOutcome::Complete { count, samples });
        }
        if Instant::now() >= deadline {
            warn!(label, count, target, samples, "polling timed out before the count settled");
            return Ok(PollOutcome::Incomplete {
                last_count: counter.last_observed().unwrap_or(0),
                samples,
            });
        }
        sleep(policy.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CondenserLimits, RetryPolicy, SessionPolicy};
    use crate::driver::{DriverFactory, LaunchParams, UiDriver};
    use crate::snapshot::RawSnapshot;
    use crate::types::Action;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Shows one table caption per snapshot; the last one sticks.
    struct TableDriver {
        captions: Arc<Mutex<VecDeque<String>>>,
    }

    #[async_trait]
    impl UiDriver for TableDriver {
        async fn open(&mut self, _url: &str) -> Result<()> {
            Ok(())
        }
        async fn snapshot(&mut self) -> Result<RawSnapshot> {
            let mut captions = self.captions.lock().unwrap();
            let caption = if captions.len() > 1 {
                captions.pop_front().unwrap_or_default()
            } else {
                captions.front().cloned().unwrap_or_default()
            };
            Ok(RawSnapshot {
                url: "https://app.example.com/table".into(),
                texts: vec![caption],
                ..RawSnapshot::default()
            })
        }
        async fn act(&mut self, _action: &Action) -> Result<()> {
            Ok(())
        }
        async fn screenshot(&mut self) -> Result<Vec<u8>> {
            Ok(vec![])
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct TableFactory {
        captions: Arc<Mutex<VecDeque<String>>>,
    }

    #[async_trait]
    impl DriverFactory for TableFactory {
        async fn launch(&self, _params: &LaunchParams) -> Result<Box<dyn UiDriver>> {
            Ok(Box::new(TableDriver {
                captions: self.captions.clone(),
            }))
        }
    }

    async fn table_session(captions: &[&str]) -> Session {
        let factory = Arc::new(TableFactory {
            captions: Arc::new(Mutex::new(captions.iter().map(|c| c.to_string()).collect())),
        });
        let policy = SessionPolicy {
            recycle_every_turns: 0,
            profile_dir: None,
            ..SessionPolicy::default()
        };
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let mut session = Session::new(factory, policy, retry, CondenserLimits::default());
        session.launch().await.unwrap();
        session
    }

    fn fast_poll(timeout_ms: u64) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            stable_samples: 3,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn progress_caption_stuck_below_target_is_incomplete() {
        let mut session = table_session(&["Imported 22 of 100 rows"]).await;
        let outcome = poll_until_stable(&mut session, "rows", 100, &fast_poll(40)).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Incomplete { last_count: 22, .. }), "{outcome:?}");
    }

    #[tokio::test]
    async fn progress_caption_completes_once_done_reaches_target() {
        let mut session = table_session(&[
            "Imported 22 of 100 rows",
            "Imported 85/100 rows",
            "Imported 100 of 100 rows",
        ])
        .await;
        let outcome = poll_until_stable(&mut session, "rows", 100, &fast_poll(2_000)).await.unwrap();
        assert_eq!(outcome, PollOutcome::Complete { count: 100, samples: 5 });
    }

    fn feed(counter: &mut StabilityCounter, samples: &[u64]) -> Option<usize> {
        samples.iter().position(|&n| counter.observe(n))
    }

    #[test]
    fn regression_below_target_resets_the_streak() {
        let mut counter = StabilityCounter::new(100, 3);
        let done_at = feed(&mut counter, &[100, 100, 22, 100, 100, 100]);
        assert_eq!(done_at, Some(5));
        assert_eq!(counter.resets(), 1);
    }

    #[test]
    fn rising_count_completes_after_k_samples_at_target() {
        let mut counter = StabilityCounter::new(100, 3);
        assert_eq!(feed(&mut counter, &[40, 85, 100, 100, 100]), Some(4));
        assert_eq!(counter.last_observed(), Some(100));
    }

    #[test]
    fn plateau_below_target_never_completes() {
        let mut counter = StabilityCounter::new(100, 2);
        assert_eq!(feed(&mut counter, &[22, 22, 22, 22, 22]), None);
        assert_eq!(counter.streak(), 0);
    }

    #[test]
    fn overshoot_counts_as_at_target() {
        let mut counter = StabilityCounter::new(100, 2);
        assert_eq!(feed(&mut counter, &[101, 120]), Some(1));
    }
}
