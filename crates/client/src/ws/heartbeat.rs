//! Application-level heartbeat for an open project socket.

use std::time::Duration;

use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

/// Heartbeat timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between `{"type":"ping"}` frames.
    pub ping_interval: Duration,
    /// How long a ping may go unanswered before the socket is considered dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatEvent {
    /// Time to send a ping.
    Ping,
    /// The last ping went unanswered for the whole pong timeout.
    PongOverdue,
}

/// Ping timer plus pong deadline for one open connection.
///
/// Created when the socket opens and dropped when it leaves the open state,
/// which tears down both timers.
#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    pong_timeout: Duration,
    ticker: Interval,
    pong_deadline: Option<Instant>,
    last_pong_at: Option<Instant>,
}

impl HeartbeatMonitor {
    /// Start the monitor; the first ping is due one full interval from now.
    pub(crate) fn start(config: &HeartbeatConfig) -> Self {
        let mut ticker = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            pong_timeout: config.pong_timeout,
            ticker,
            pong_deadline: None,
            last_pong_at: None,
        }
    }

    /// Wait for the next heartbeat event. Cancel safe.
    pub(crate) async fn next_event(&mut self) -> HeartbeatEvent {
        match self.pong_deadline {
            Some(deadline) => tokio::select! {
                _ = self.ticker.tick() => HeartbeatEvent::Ping,
                _ = sleep_until(deadline) => HeartbeatEvent::PongOverdue,
            },
            None => {
                self.ticker.tick().await;
                HeartbeatEvent::Ping
            }
        }
    }

    /// Arm the pong deadline after a ping went out. An already armed deadline
    /// is kept so an unanswered ping cannot be masked by the next one.
    pub(crate) fn ping_sent(&mut self) {
        if self.pong_deadline.is_none() {
            self.pong_deadline = Some(Instant::now() + self.pong_timeout);
        }
    }

    pub(crate) fn pong_received(&mut self) {
        self.pong_deadline = None;
        self.last_pong_at = Some(Instant::now());
    }

    pub(crate) fn awaiting_pong(&self) -> bool {
        self.pong_deadline.is_some()
    }

    pub(crate) fn last_pong_at(&self) -> Option<Instant> {
        self.last_pong_at
    }
}
