use std::time::Duration;

const FAST_RETRY: Duration = Duration::from_secs(2);
const SLOW_RETRY: Duration = Duration::from_secs(5);

/// Delay schedule for transport-level reconnection after a dropped socket.
///
/// The first retry is immediate, the next two wait 2s, every later one 5s.
/// This is separate from the session's own reconnect scheduling, which uses a
/// fixed delay after the transport has given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconnectPolicy {
    max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// `None` retries forever.
    pub fn new(max_attempts: Option<u32>) -> Self {
        Self { max_attempts }
    }

    /// The delay before retry number `attempt` (zero-based), or `None` once
    /// the policy has given up.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        Some(match attempt {
            0 => Duration::ZERO,
            1 | 2 => FAST_RETRY,
            _ => SLOW_RETRY,
        })
    }
}
