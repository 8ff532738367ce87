use std::fmt;
use std::io;
use std::time::Duration;

use tokio::time::Instant;

use crate::resolve::ResolveError;

/// Knobs recognized at the transfer API. Block size is fixed at 512 and is
/// not negotiable.
#[derive(Clone, Copy, Debug)]
pub struct TransferOptions {
    /// Consecutive retransmissions of one packet before the transfer fails.
    pub max_retries: u32,

    /// Floor for the smoothed RTT estimate.
    pub timeout_min: Duration,

    /// Ceiling for the smoothed RTT estimate; also its initial value.
    pub timeout_max: Duration,

    /// Retransmission interval is this multiple of the RTT estimate on uploads.
    pub upload_rtx_mult: u32,

    /// Same, for downloads. Larger because the client is passive after the
    /// request and the server paces the transfer.
    pub download_rtx_mult: u32,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            max_retries: 5,
            timeout_min: Duration::from_millis(2),
            timeout_max: Duration::from_millis(200),
            upload_rtx_mult: 2,
            download_rtx_mult: 5,
        }
    }
}

/// Round-trip statistics for one transfer: when the last outbound packet
/// left, and the smoothed RTT estimate driving retransmission timeouts.
#[derive(Clone, Copy, Debug)]
pub struct TransferStats {
    start_time: Instant,
    avg_rtt: Duration,
}

impl TransferStats {
    /// Starts pessimistic: the estimate begins at `timeout_max` so the first
    /// retransmission is late rather than eager.
    pub fn new(opts: &TransferOptions) -> TransferStats {
        TransferStats {
            start_time: Instant::now(),
            avg_rtt: opts.timeout_max,
        }
    }

    pub fn avg_rtt(&self) -> Duration {
        self.avg_rtt
    }

    /// Stamps the departure of an outbound packet.
    pub fn mark_sent(&mut self) {
        self.start_time = Instant::now();
    }

    /// Records the completion of a round trip begun at the last `mark_sent`.
    pub fn observe_round_trip(&mut self, opts: &TransferOptions) {
        let now = Instant::now();
        self.observe(now - self.start_time, opts);
        self.start_time = now;
    }

    // 3/4 old + 1/4 new, clamped into the configured window.
    fn observe(&mut self, rtt: Duration, opts: &TransferOptions) {
        self.avg_rtt = (self.avg_rtt * 3 + rtt) / 4;
        self.avg_rtt = self.avg_rtt.clamp(opts.timeout_min, opts.timeout_max);
    }
}

/// The protocol-level outcome of a transfer: a numeric TFTP error code and a
/// human-readable message. `{0, ""}` is success.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub message: String,
}

impl Status {
    pub fn success() -> Status {
        Status {
            code: 0,
            message: String::new(),
        }
    }

    pub fn timed_out() -> Status {
        Status {
            code: 0,
            message: "Timed out".to_string(),
        }
    }

    pub fn cancelled() -> Status {
        Status {
            code: 0,
            message: "Cancelled".to_string(),
        }
    }

    /// The terminal status for a reply that failed packet validation.
    pub fn invalid_response() -> Status {
        Status {
            code: crate::tftp::ErrorCode::Illegal.as_u16(),
            message: "Invalid server response.".to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0 && self.message.is_empty()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// System-level failures, as opposed to protocol-level `Status` outcomes.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("name resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> TransferOptions {
        TransferOptions::default()
    }

    #[test]
    fn test_estimate_starts_at_ceiling() {
        let opts = options();
        let stats = TransferStats::new(&opts);
        assert_eq!(stats.avg_rtt(), opts.timeout_max);
    }

    #[test]
    fn test_observe_applies_weighted_average() {
        let opts = options();
        let mut stats = TransferStats::new(&opts);

        // (3 * 200ms + 20ms) / 4 = 155ms
        stats.observe(Duration::from_millis(20), &opts);
        assert_eq!(stats.avg_rtt(), Duration::from_millis(155));

        // (3 * 155ms + 15ms) / 4 = 120ms
        stats.observe(Duration::from_millis(15), &opts);
        assert_eq!(stats.avg_rtt(), Duration::from_millis(120));
    }

    #[test]
    fn test_observe_clamps_to_floor() {
        let opts = options();
        let mut stats = TransferStats::new(&opts);

        for _ in 0..32 {
            stats.observe(Duration::ZERO, &opts);
        }
        assert_eq!(stats.avg_rtt(), opts.timeout_min);
    }

    #[test]
    fn test_observe_clamps_to_ceiling() {
        let opts = options();
        let mut stats = TransferStats::new(&opts);

        stats.observe(Duration::from_secs(30), &opts);
        assert_eq!(stats.avg_rtt(), opts.timeout_max);
    }

    #[test]
    fn test_status_success_is_exactly_zero_and_empty() {
        assert!(Status::success().is_success());
        assert!(!Status::timed_out().is_success());
        assert!(!Status::cancelled().is_success());
        assert!(!Status::invalid_response().is_success());
    }
}
