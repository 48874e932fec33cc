//! Connection liveness monitoring.
//!
//! [`LivenessTracker`] is a pure decision function over elapsed times. The
//! call manager ticks it on a fixed period while connected and carries out
//! the returned [`MonitorAction`].

use std::time::Duration;

use super::types::EndCallReason;

/// Configuration for the connection monitor.
#[derive(Debug, Clone)]
pub struct ConnectionMonitorConfig {
    /// Tick period.
    pub period: Duration,
    /// No action is taken this soon after connecting.
    pub grace: Duration,
    /// Silence after which the connection counts as degraded.
    pub degraded_after: Duration,
    /// Silence after which the call is ended.
    pub lost_after: Duration,
    /// Delay before the first reconnection attempt.
    pub backoff_base: Duration,
    /// Upper bound on the delay between attempts.
    pub backoff_max: Duration,
    pub max_attempts: u32,
}

impl Default for ConnectionMonitorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(500),
            grace: Duration::from_secs(20),
            degraded_after: Duration::from_secs(5),
            lost_after: Duration::from_secs(45),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(8),
            max_attempts: 8,
        }
    }
}

/// What the caller should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    Idle,
    /// Audio stopped arriving. Reported once per silent period.
    Degraded { silent_for: Duration },
    /// Try to re-establish the locked path.
    Reconnect { attempt: u32 },
    ForceEnd(EndCallReason),
}

#[derive(Debug)]
pub struct LivenessTracker {
    config: ConnectionMonitorConfig,
    degraded: bool,
    attempts: u32,
    /// Connection age at which the next attempt is due.
    next_attempt_at: Option<Duration>,
}

impl LivenessTracker {
    pub fn new(config: ConnectionMonitorConfig) -> Self {
        Self {
            config,
            degraded: false,
            attempts: 0,
            next_attempt_at: None,
        }
    }

    pub fn config(&self) -> &ConnectionMonitorConfig {
        &self.config
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Decide what to do given how long the call has been connected and how
    /// long since audio last arrived.
    pub fn evaluate(&mut self, since_connect: Duration, since_last_audio: Duration) -> MonitorAction {
        if since_connect < self.config.grace {
            return MonitorAction::Idle;
        }
        if since_last_audio >= self.config.lost_after {
            return MonitorAction::ForceEnd(EndCallReason::ConnectionLost);
        }
        if since_last_audio < self.config.degraded_after {
            return MonitorAction::Idle;
        }

        if !self.degraded {
            self.degraded = true;
            self.next_attempt_at = Some(since_connect + self.backoff(0));
            return MonitorAction::Degraded {
                silent_for: since_last_audio,
            };
        }

        match self.next_attempt_at {
            Some(due) if since_connect >= due => {
                if self.attempts >= self.config.max_attempts {
                    return MonitorAction::ForceEnd(EndCallReason::ConnectionLost);
                }
                self.attempts += 1;
                self.next_attempt_at = Some(since_connect + self.backoff(self.attempts));
                MonitorAction::Reconnect {
                    attempt: self.attempts,
                }
            }
            _ => MonitorAction::Idle,
        }
    }

    /// Audio arrived. Returns whether the connection was degraded.
    pub fn on_audio(&mut self) -> bool {
        let was_degraded = self.degraded;
        self.degraded = false;
        self.attempts = 0;
        self.next_attempt_at = None;
        was_degraded
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.config
            .backoff_base
            .saturating_mul(factor)
            .min(self.config.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_grace_period_suppresses_everything() {
        let mut tracker = LivenessTracker::new(ConnectionMonitorConfig::default());
        assert_eq!(tracker.evaluate(secs(19.5), secs(19.5)), MonitorAction::Idle);
        assert!(!tracker.is_degraded());
    }

    #[test]
    fn test_healthy_call_stays_idle() {
        let mut tracker = LivenessTracker::new(ConnectionMonitorConfig::default());
        assert_eq!(tracker.evaluate(secs(60.0), secs(0.1)), MonitorAction::Idle);
        assert_eq!(tracker.evaluate(secs(60.5), secs(4.9)), MonitorAction::Idle);
    }

    #[test]
    fn test_degraded_then_backoff() {
        let mut tracker = LivenessTracker::new(ConnectionMonitorConfig::default());

        assert_eq!(
            tracker.evaluate(secs(30.0), secs(5.0)),
            MonitorAction::Degraded {
                silent_for: secs(5.0)
            }
        );
        assert_eq!(tracker.evaluate(secs(30.5), secs(5.5)), MonitorAction::Idle);
        assert_eq!(
            tracker.evaluate(secs(31.0), secs(6.0)),
            MonitorAction::Reconnect { attempt: 1 }
        );
        // Next attempt 2s later.
        assert_eq!(tracker.evaluate(secs(32.5), secs(7.5)), MonitorAction::Idle);
        assert_eq!(
            tracker.evaluate(secs(33.0), secs(8.0)),
            MonitorAction::Reconnect { attempt: 2 }
        );
        // Then 4s.
        assert_eq!(tracker.evaluate(secs(36.5), secs(11.5)), MonitorAction::Idle);
        assert_eq!(
            tracker.evaluate(secs(37.0), secs(12.0)),
            MonitorAction::Reconnect { attempt: 3 }
        );
    }

    #[test]
    fn test_audio_clears_degraded_state() {
        let mut tracker = LivenessTracker::new(ConnectionMonitorConfig::default());
        tracker.evaluate(secs(30.0), secs(6.0));
        tracker.evaluate(secs(31.0), secs(7.0));
        assert_eq!(tracker.attempts(), 1);

        assert!(tracker.on_audio());
        assert!(!tracker.is_degraded());
        assert_eq!(tracker.attempts(), 0);
        assert!(!tracker.on_audio());

        // A new silent period reports degraded again.
        assert!(matches!(
            tracker.evaluate(secs(50.0), secs(5.0)),
            MonitorAction::Degraded { .. }
        ));
    }

    #[test]
    fn test_long_silence_forces_end() {
        let mut tracker = LivenessTracker::new(ConnectionMonitorConfig::default());
        assert_eq!(
            tracker.evaluate(secs(60.0), secs(45.0)),
            MonitorAction::ForceEnd(EndCallReason::ConnectionLost)
        );
    }

    #[test]
    fn test_attempts_are_bounded() {
        let config = ConnectionMonitorConfig {
            max_attempts: 2,
            lost_after: secs(1000.0),
            ..Default::default()
        };
        let mut tracker = LivenessTracker::new(config);
        let mut t = 30.0;
        let mut actions = Vec::new();
        while t < 60.0 {
            let action = tracker.evaluate(secs(t), secs(t - 20.0));
            if action != MonitorAction::Idle {
                actions.push(action);
            }
            if matches!(action, MonitorAction::ForceEnd(_)) {
                break;
            }
            t += 0.5;
        }
        assert_eq!(
            actions,
            vec![
                MonitorAction::Degraded {
                    silent_for: secs(10.0)
                },
                MonitorAction::Reconnect { attempt: 1 },
                MonitorAction::Reconnect { attempt: 2 },
                MonitorAction::ForceEnd(EndCallReason::ConnectionLost),
            ]
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        let tracker = LivenessTracker::new(ConnectionMonitorConfig::default());
        assert_eq!(tracker.backoff(0), secs(1.0));
        assert_eq!(tracker.backoff(2), secs(4.0));
        assert_eq!(tracker.backoff(5), secs(8.0));
        assert_eq!(tracker.backoff(40), secs(8.0));
    }
}
