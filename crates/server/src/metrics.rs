use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    frames_ingress: AtomicU64,
    frames_egress: AtomicU64,
    messages_accepted: AtomicU64,
    messages_delivered: AtomicU64,
    group_fanouts: AtomicU64,
    resend_replayed: AtomicU64,
    kicks_issued: AtomicU64,
    backpressure_closes: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_ingress(&self) {
        self.frames_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.frames_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_accepted(&self) {
        self.messages_accepted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_group_fanout(&self) {
        self.group_fanouts.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_resend(&self, count: u64) {
        self.resend_replayed.fetch_add(count, Ordering::SeqCst);
    }

    pub fn mark_kick(&self) {
        self.kicks_issued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_backpressure_close(&self) {
        self.backpressure_closes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE wiregate_connections_active gauge\nwiregate_connections_active {}\n# TYPE wiregate_frames_ingress counter\nwiregate_frames_ingress {}\n# TYPE wiregate_frames_egress counter\nwiregate_frames_egress {}\n# TYPE wiregate_messages_accepted counter\nwiregate_messages_accepted {}\n# TYPE wiregate_messages_delivered counter\nwiregate_messages_delivered {}\n# TYPE wiregate_group_fanouts counter\nwiregate_group_fanouts {}\n# TYPE wiregate_resend_replayed counter\nwiregate_resend_replayed {}\n# TYPE wiregate_kicks_issued counter\nwiregate_kicks_issued {}\n# TYPE wiregate_backpressure_closes counter\nwiregate_backpressure_closes {}\n",
            self.connections_active.load(Ordering::SeqCst),
            self.frames_ingress.load(Ordering::SeqCst),
            self.frames_egress.load(Ordering::SeqCst),
            self.messages_accepted.load(Ordering::SeqCst),
            self.messages_delivered.load(Ordering::SeqCst),
            self.group_fanouts.load(Ordering::SeqCst),
            self.resend_replayed.load(Ordering::SeqCst),
            self.kicks_issued.load(Ordering::SeqCst),
            self.backpressure_closes.load(Ordering::SeqCst)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_output_carries_counters() {
        let metrics = Metrics::new();
        metrics.incr_connections();
        metrics.mark_delivered();
        metrics.mark_resend(3);
        let text = metrics.encode_prometheus();
        assert!(text.contains("wiregate_connections_active 1"));
        assert!(text.contains("wiregate_messages_delivered 1"));
        assert!(text.contains("wiregate_resend_replayed 3"));
    }
}
