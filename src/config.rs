use std::time::Duration;

/// Knobs the original teacher crate hardcoded inline. Pulled out so a
/// `NetStack` can be tuned without touching the state machine.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Advertised receive window for new connections, and the capacity of
    /// the receive ring buffer.
    pub rcv_wnd: u16,

    /// Maximum segment size assumed for the peer when none is advertised.
    pub default_mss: u16,

    /// Fixed retransmission timeout. This core implements window-based flow
    /// control only (see spec Non-goals): there is no RTT-estimated RTO, so
    /// every outstanding segment is retried on the same fixed interval.
    pub rto: Duration,

    /// 2*MSL dwell time for TIME_WAIT and LAST_ACK.
    pub time_wait: Duration,

    /// Upper bound on the number of out-of-order segments kept per
    /// connection. A segment that would exceed this is dropped, matching
    /// the "allocation failure" branch of the error taxonomy.
    pub max_ofo_segments: usize,

    /// Upper bound on the number of unacknowledged segments kept per
    /// connection for retransmission.
    pub send_buf_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rcv_wnd: 64240,
            default_mss: 536,
            rto: Duration::from_millis(1000),
            time_wait: Duration::from_secs(2 * 2 * 60),
            max_ofo_segments: 64,
            send_buf_capacity: 256,
        }
    }
}
