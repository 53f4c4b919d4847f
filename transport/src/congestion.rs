//! Send-rate estimation and pacing for lossless traffic.
//!
//! Every [AVERAGE_INTERVAL] the estimator samples the send queue length and how many packets were
//! sent and resent since the last sample. From a window of recent samples it derives the slowest
//! rate the path has sustained and sets the send rate relative to it: below it when the queue is
//! backing up, above it when nothing has been lost for a while. Two token buckets turn the rates
//! into per-tick budgets, one for new packets and one for retransmissions.

/// Milliseconds between samples.
pub const AVERAGE_INTERVAL: u64 = 50;

/// Lowest send rate, in packets per second.
pub const MIN_RATE: f64 = 4.0;

/// Queue length below which the queue is never considered backed up. Also the initial budget.
pub const MIN_QUEUE_LENGTH: u32 = 64;

/// Queue length (in seconds at the sustained rate) above which the send rate is cut.
pub const SEND_QUEUE_RATIO: f64 = 2.0;

/// Milliseconds a congestion event suppresses rate increases.
pub const CONGESTION_EVENT_TIMEOUT: u64 = 1000;

/// Number of queue length samples kept.
const QUEUE_WINDOW: usize = 12;

/// Number of sent/resent samples kept.
const SENT_WINDOW: usize = 24;

/// Scale of the receive-rate driven request interval.
const REQUEST_COMPARE: f64 = 12.5;

/// Congestion state of a single connection.
#[derive(Clone, Debug)]
pub struct Congestion {
    // Receive side
    received: u32,
    sampled_at: u64,
    recv_rate: f64,

    // Send side
    sent: u32,
    resent: u32,
    queue_sizes: [u32; QUEUE_WINDOW],
    sent_history: [u32; SENT_WINDOW],
    resent_history: [u32; SENT_WINDOW],
    samples: usize,
    send_rate: f64,
    send_rate_requested: f64,
    last_congestion_event: u64,

    // Token buckets
    packets_left: u32,
    packets_left_requested: u32,
    refilled_at: Option<u64>,
    refill_rem: f64,
    requested_refilled_at: u64,
    requested_refill_rem: f64,
}

impl Congestion {
    pub fn new(now: u64) -> Self {
        Self {
            received: 0,
            sampled_at: now,
            recv_rate: 0.0,
            sent: 0,
            resent: 0,
            queue_sizes: [0; QUEUE_WINDOW],
            sent_history: [0; SENT_WINDOW],
            resent_history: [0; SENT_WINDOW],
            samples: 0,
            send_rate: MIN_RATE,
            send_rate_requested: MIN_RATE,
            last_congestion_event: 0,
            packets_left: MIN_QUEUE_LENGTH,
            packets_left_requested: MIN_QUEUE_LENGTH,
            refilled_at: None,
            refill_rem: 0.0,
            requested_refilled_at: now,
            requested_refill_rem: 0.0,
        }
    }

    /// Current send rate in packets per second.
    pub fn send_rate(&self) -> f64 {
        self.send_rate
    }

    /// Current retransmission rate in packets per second.
    pub fn send_rate_requested(&self) -> f64 {
        self.send_rate_requested
    }

    /// Lossless packets received per second over the last sample.
    pub fn recv_rate(&self) -> f64 {
        self.recv_rate
    }

    /// New packets that may be sent right now.
    pub fn packets_left(&self) -> u32 {
        self.packets_left
    }

    /// Retransmissions that may be sent right now.
    pub fn packets_left_requested(&self) -> u32 {
        self.packets_left_requested
    }

    /// Record a received lossless packet.
    pub fn on_received(&mut self) {
        self.received = self.received.saturating_add(1);
    }

    /// Record a new lossless packet queued under congestion control.
    pub fn on_queued(&mut self) {
        self.packets_left = self.packets_left.saturating_sub(1);
        self.packets_left_requested = self.packets_left_requested.saturating_sub(1);
        self.sent = self.sent.saturating_add(1);
    }

    /// Record `count` retransmissions sent at `now`.
    ///
    /// Retransmitting at least as many packets as the new-packet budget allows counts as a
    /// congestion event and empties that budget.
    pub fn on_resent(&mut self, count: u32, now: u64) {
        self.packets_left_requested = self.packets_left_requested.saturating_sub(count);
        self.resent = self.resent.saturating_add(count);
        if count < self.packets_left {
            self.packets_left -= count;
        } else {
            self.last_congestion_event = now;
            self.packets_left = 0;
        }
    }

    /// Take a sample if [AVERAGE_INTERVAL] has elapsed and recompute the send rates.
    ///
    /// `queue` is the number of packets in the send array. When `hold` is set the sample is
    /// recorded but the rates are left alone.
    pub fn update(&mut self, now: u64, queue: u32, rtt: u64, hold: bool) {
        if self.sampled_at + AVERAGE_INTERVAL >= now {
            return;
        }
        let dt = (now - self.sampled_at) as f64;
        self.recv_rate = self.received as f64 / (dt / 1000.0);
        self.received = 0;
        self.sampled_at = now;

        let sent = std::mem::take(&mut self.sent);
        let resent = std::mem::take(&mut self.resent);

        let pos = self.samples % QUEUE_WINDOW;
        self.queue_sizes[pos] = queue;
        let growth = queue as i64 - self.queue_sizes[(pos + 1) % QUEUE_WINDOW] as i64;

        let sent_pos = self.samples % SENT_WINDOW;
        self.sent_history[sent_pos] = sent;
        self.resent_history[sent_pos] = resent;
        self.samples = (self.samples + 1) % (QUEUE_WINDOW * SENT_WINDOW);

        if hold {
            return;
        }

        // Line the sent window up with the queue window, shifted back by one round trip
        let slack = SENT_WINDOW - QUEUE_WINDOW;
        let delay = ((rtt as f64 / AVERAGE_INTERVAL as f64 + 0.5) as usize).min(slack);
        let mut total_sent: i64 = 0;
        let mut total_resent: i64 = 0;
        for j in 0..QUEUE_WINDOW {
            let index = (j + (slack - delay) + sent_pos) % SENT_WINDOW;
            total_sent += self.sent_history[index] as i64;
            total_resent += self.resent_history[index] as i64;
        }
        if growth > 0 {
            total_sent -= growth;
        } else if total_resent > -growth {
            total_resent = -growth;
        }

        let window = QUEUE_WINDOW as f64 * AVERAGE_INTERVAL as f64;
        let min_speed = (1000.0 * total_sent as f64 / window).max(MIN_RATE);
        let min_speed_request = 1000.0 * (total_sent + total_resent) as f64 / window;

        let ratio = queue as f64 / min_speed;
        let rate = if ratio > SEND_QUEUE_RATIO && queue > MIN_QUEUE_LENGTH {
            min_speed / ratio
        } else if self.last_congestion_event + CONGESTION_EVENT_TIMEOUT < now {
            min_speed * 1.2
        } else {
            min_speed * 0.9
        };
        self.send_rate = rate.max(MIN_RATE);
        self.send_rate_requested = (min_speed_request * 1.2).max(self.send_rate);
    }

    /// Refill both token buckets for the time elapsed since the last refill.
    pub fn refill(&mut self, now: u64) {
        let Some(refilled_at) = self.refilled_at else {
            self.refilled_at = Some(now);
            self.requested_refilled_at = now;
            self.packets_left = MIN_QUEUE_LENGTH;
            self.packets_left_requested = MIN_QUEUE_LENGTH;
            return;
        };

        if period(self.send_rate) + refilled_at <= now {
            let n = self.send_rate * ((now - refilled_at) as f64 / 1000.0) + self.refill_rem;
            let whole = n as u32;
            let cap = whole.saturating_mul(4).saturating_add(MIN_QUEUE_LENGTH);
            self.packets_left = self.packets_left.saturating_add(whole).min(cap);
            self.refilled_at = Some(now);
            self.refill_rem = n - whole as f64;
        }

        if period(self.send_rate_requested) + self.requested_refilled_at <= now {
            let n = self.send_rate_requested
                * ((now - self.requested_refilled_at) as f64 / 1000.0)
                + self.requested_refill_rem;
            let whole = n as u32;
            self.packets_left_requested = whole;
            self.requested_refilled_at = now;
            self.requested_refill_rem = n - whole as f64;
        }

        if self.packets_left > self.packets_left_requested {
            self.packets_left_requested = self.packets_left;
        }
    }

    /// How often request packets should be sent, given the receive window length.
    ///
    /// Returns `None` while the peer is sending slower than [MIN_RATE], in which case the regular
    /// `interval` applies.
    pub fn request_interval(&self, recv_len: u32, interval: u64) -> Option<u64> {
        if self.recv_rate <= MIN_RATE {
            return None;
        }
        let by_window = REQUEST_COMPARE / ((recv_len as f64 + 1.0) / (self.recv_rate + 1.0));
        let by_rate =
            (MIN_RATE / self.recv_rate) * interval as f64 + AVERAGE_INTERVAL as f64;
        let chosen = by_window
            .min(by_rate)
            .clamp(AVERAGE_INTERVAL as f64, interval as f64);
        Some(chosen as u64)
    }

    /// When the estimator next needs to run.
    pub fn next_sample(&self) -> u64 {
        self.sampled_at + AVERAGE_INTERVAL + 1
    }
}

/// Milliseconds per packet at `rate`, rounded.
fn period(rate: f64) -> u64 {
    (1000.0 / rate + 0.5) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_budget() {
        let mut congestion = Congestion::new(0);
        assert_eq!(congestion.packets_left(), MIN_QUEUE_LENGTH);
        assert_eq!(congestion.send_rate(), MIN_RATE);

        congestion.refill(10);
        assert_eq!(congestion.packets_left(), MIN_QUEUE_LENGTH);

        for _ in 0..MIN_QUEUE_LENGTH {
            congestion.on_queued();
        }
        assert_eq!(congestion.packets_left(), 0);
    }

    #[test]
    fn test_refill() {
        let mut congestion = Congestion::new(0);
        congestion.refill(0);
        for _ in 0..MIN_QUEUE_LENGTH {
            congestion.on_queued();
        }

        // Less than one packet period at the minimum rate
        congestion.refill(200);
        assert_eq!(congestion.packets_left(), 0);

        // One second at 4 packets per second
        congestion.refill(1000);
        assert_eq!(congestion.packets_left(), 4);
    }

    #[test]
    fn test_refill_capped() {
        let mut congestion = Congestion::new(0);
        congestion.refill(0);

        // Frequent refills at the minimum rate add one packet each until the cap
        for k in 1..=20 {
            congestion.refill(250 * k);
        }
        assert_eq!(congestion.packets_left(), 4 + MIN_QUEUE_LENGTH);
    }

    #[test]
    fn test_rate_grows_without_loss() {
        let mut congestion = Congestion::new(0);
        let mut now = 0;
        for _ in 0..100 {
            now += AVERAGE_INTERVAL + 1;
            for _ in 0..10 {
                congestion.on_queued();
            }
            congestion.update(now, 0, 0, false);
        }

        // 10 packets per 51ms is ~196 per second
        assert!(congestion.send_rate() > 150.0);
    }

    #[test]
    fn test_rate_floor_under_loss() {
        let mut congestion = Congestion::new(0);
        let mut now = 0;
        let mut queue = 0;
        for i in 0..1_000u32 {
            now += AVERAGE_INTERVAL + 1;
            queue += 50;
            congestion.on_resent(1_000, now);
            if i % 3 == 0 {
                congestion.on_queued();
            }
            congestion.update(now, queue, 2_000, false);
            assert!(congestion.send_rate() >= MIN_RATE);
            assert!(congestion.send_rate_requested() >= congestion.send_rate());
        }
        assert_eq!(congestion.send_rate(), MIN_RATE);
    }

    #[test]
    fn test_hold_keeps_rate() {
        let mut congestion = Congestion::new(0);
        for _ in 0..10 {
            congestion.on_queued();
        }
        congestion.update(AVERAGE_INTERVAL + 1, 0, 0, true);
        assert_eq!(congestion.send_rate(), MIN_RATE);
    }

    #[test]
    fn test_congestion_event() {
        let mut congestion = Congestion::new(0);
        congestion.refill(0);
        congestion.on_resent(MIN_QUEUE_LENGTH, 500);
        assert_eq!(congestion.packets_left(), 0);

        // Within the event timeout the rate shrinks relative to the sustained rate
        congestion.update(AVERAGE_INTERVAL + 1, 0, 0, false);
        assert_eq!(congestion.send_rate(), MIN_RATE);

        let mut congestion = Congestion::new(0);
        congestion.on_resent(3, 500);
        assert_eq!(congestion.packets_left(), MIN_QUEUE_LENGTH - 3);
    }

    #[test]
    fn test_request_interval() {
        let mut congestion = Congestion::new(0);
        assert_eq!(congestion.request_interval(0, 1000), None);

        // 100 packets in 100ms
        for _ in 0..100 {
            congestion.on_received();
        }
        congestion.update(100, 0, 0, false);
        assert!((congestion.recv_rate() - 1000.0).abs() < 1e-6);

        // An empty window is bounded by the rate term
        assert_eq!(congestion.request_interval(0, 1000), Some(54));

        // A long window means many holes, so request as often as allowed
        assert_eq!(
            congestion.request_interval(10_000, 1000),
            Some(AVERAGE_INTERVAL)
        );
    }
}
