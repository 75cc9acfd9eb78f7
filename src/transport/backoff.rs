use std::time::Duration;

/// Exponential reconnect delay: `initial`, then multiplied after every failed
/// attempt, capped at `max`. Reset on a successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
  initial: Duration,
  max: Duration,
  multiplier: u32,
  current: Duration,
  attempts: u32,
}

impl Backoff {
  pub fn new(initial: Duration, max: Duration, multiplier: u32) -> Self {
    let initial = initial.min(max);
    Self {
      initial,
      max,
      multiplier: multiplier.max(1),
      current: initial,
      attempts: 0,
    }
  }

  /// Delay to wait before the next attempt; advances the schedule.
  pub fn next_delay(&mut self) -> Duration {
    let delay = self.current;
    self.attempts = self.attempts.saturating_add(1);
    self.current = self
      .current
      .checked_mul(self.multiplier)
      .unwrap_or(self.max)
      .min(self.max);
    delay
  }

  pub fn reset(&mut self) {
    self.current = self.initial;
    self.attempts = 0;
  }

  /// Reconnect attempts scheduled since the last reset.
  pub fn attempts(&self) -> u32 {
    self.attempts
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
  }

  #[test]
  fn test_doubles_until_cap() {
    let mut backoff = Backoff::new(secs(1), secs(30), 2);
    let delays: Vec<_> = (0..8).map(|_| backoff.next_delay()).collect();
    assert_eq!(
      delays,
      vec![secs(1), secs(2), secs(4), secs(8), secs(16), secs(30), secs(30), secs(30)]
    );
    assert_eq!(backoff.attempts(), 8);
  }

  #[test]
  fn test_nth_delay_matches_formula() {
    let initial = Duration::from_millis(250);
    let max = secs(30);
    let mut backoff = Backoff::new(initial, max, 2);
    for n in 1..=20u32 {
      let expected = initial
        .checked_mul(2u32.saturating_pow(n - 1))
        .unwrap_or(max)
        .min(max);
      assert_eq!(backoff.next_delay(), expected, "attempt {}", n);
    }
  }

  #[test]
  fn test_reset_returns_to_initial() {
    let mut backoff = Backoff::new(secs(1), secs(30), 2);
    backoff.next_delay();
    backoff.next_delay();
    backoff.reset();
    assert_eq!(backoff.attempts(), 0);
    assert_eq!(backoff.next_delay(), secs(1));
  }
}
