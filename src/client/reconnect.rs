use serde::Serialize;
use std::time::Duration;

const NORMAL_CLOSURE: u16 = 1000;
const GOING_AWAY: u16 = 1001;

/// Capped exponential backoff: 1s, 2s, 4s, 8s, then 10s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    ReconnectPolicy::default().delay(attempt)
}

/// Whether a closed signaling connection should be retried.
///
/// `None` means the connection dropped without a close frame.
pub fn should_reconnect(close_code: Option<u16>, close_reason: &str) -> bool {
    if matches!(close_code, Some(NORMAL_CLOSURE) | Some(GOING_AWAY)) {
        return false;
    }

    let reason = close_reason.to_ascii_lowercase();
    !(reason.contains("authentication") || reason.contains("unauthorized"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    pub fn exhausted(&self, attempts_made: u32) -> bool {
        attempts_made >= self.max_attempts
    }
}

/// Signaling connection status shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        #[serde(with = "millis")]
        next_retry_in: Duration,
    },
    Failed {
        reason: String,
    },
    Closed,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    /// No further reconnect attempts will be made.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Failed { .. } | ConnectionStatus::Closed)
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backoff_sequence() {
        let delays: Vec<u64> = (0..6).map(|n| reconnect_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(reconnect_delay(64), Duration::from_secs(10));
    }

    #[test]
    fn test_should_reconnect() {
        assert!(!should_reconnect(Some(1000), ""));
        assert!(!should_reconnect(Some(1001), "going away"));
        assert!(!should_reconnect(Some(4001), "authentication failed"));
        assert!(!should_reconnect(Some(1008), "Unauthorized"));
        assert!(should_reconnect(Some(1006), "abnormal closure"));
        assert!(should_reconnect(None, ""));
    }

    #[test]
    fn test_attempts_are_bounded() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }

    #[test]
    fn test_status_wire_shape() {
        let status = ConnectionStatus::Reconnecting {
            attempt: 2,
            max_attempts: 5,
            next_retry_in: Duration::from_secs(2),
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({"status": "reconnecting", "attempt": 2, "maxAttempts": 5, "nextRetryIn": 2000})
        );
        assert!(!status.is_terminal());
        assert!(ConnectionStatus::Closed.is_terminal());
    }
}
