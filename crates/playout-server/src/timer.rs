/// Drift-free periodic scheduling. Each deadline is an absolute multiple
/// of the period past an immutable start reference, so the average
/// interval is exactly the period regardless of tick-handler duration or
/// timer jitter. Naive fixed-delay loops accumulate both.

use std::time::Duration;

use tokio::time::Instant;

pub struct DriftFreeTimer {
    start: Instant,
    period: Duration,
}

impl DriftFreeTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            start: Instant::now(),
            period,
        }
    }

    /// Sleep until the next period boundary past `start`.
    pub async fn tick(&self) {
        let next = next_boundary(self.start.elapsed(), self.period);
        tokio::time::sleep_until(self.start + next).await;
    }
}

/// Absolute offset of the next whole-period boundary. A boundary hit
/// exactly schedules the one after it, so a tick never fires twice.
fn next_boundary(elapsed: Duration, period: Duration) -> Duration {
    let period_ns = period.as_nanos().max(1);
    Duration::from_nanos(((elapsed.as_nanos() / period_ns + 1) * period_ns) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_next_boundary_fills_the_current_period() {
        assert_eq!(next_boundary(ms(0), ms(500)), ms(500));
        assert_eq!(next_boundary(ms(120), ms(500)), ms(500));
        assert_eq!(next_boundary(ms(499), ms(500)), ms(500));
        assert_eq!(next_boundary(ms(501), ms(500)), ms(1000));
    }

    #[test]
    fn test_boundary_hit_schedules_next_period() {
        assert_eq!(next_boundary(ms(500), ms(500)), ms(1000));
        assert_eq!(next_boundary(ms(1000), ms(500)), ms(1500));
    }

    #[test]
    fn test_long_handler_skips_to_future_boundary() {
        // A handler that overran two periods lands on the next real
        // boundary instead of firing a burst.
        assert_eq!(next_boundary(ms(1250), ms(500)), ms(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_average_interval_is_exact() {
        let timer = DriftFreeTimer::new(ms(100));
        let begin = Instant::now();
        for _ in 0..10 {
            timer.tick().await;
            // Simulated jittery work inside the loop.
            tokio::time::sleep(ms(37)).await;
        }
        // Ten ticks land exactly on the 1000 ms boundary; only the
        // trailing work extends past it.
        let elapsed = begin.elapsed();
        assert!(elapsed >= ms(1000) && elapsed < ms(1100), "{elapsed:?}");
    }
}
