use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static FRAMES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("sandpolis_frames_total", "Frames written or read by sessions"),
        &["direction"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static FRAME_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "sandpolis_frame_errors_total",
            "Inbound frames that failed to frame or decode",
        ),
        &["reason"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "sandpolis_requests_total",
            "Correlated requests by how they resolved",
        ),
        &["outcome"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static UNMATCHED_RESPONSES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "sandpolis_unmatched_responses_total",
            "Responses that arrived with no pending request",
        ),
        &["payload"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static STREAM_PAYLOADS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "sandpolis_stream_payloads_total",
            "Stream data payloads by dispatch result",
        ),
        &["result"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static STREAM_RESYNCS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "sandpolis_stream_resyncs_total",
        "Snapshots resent to sync streams that fell behind",
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SESSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("sandpolis_sessions_total", "Sessions by role and final state"),
        &["role", "state"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static OPEN_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("sandpolis_open_sessions", "Sessions currently established")
        .expect("valid metric");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn record_frame(direction: &str) {
    FRAMES.with_label_values(&[direction]).inc();
}

pub fn record_frame_error(reason: &str) {
    FRAME_ERRORS.with_label_values(&[reason]).inc();
}

pub fn record_request(outcome: &str) {
    REQUESTS.with_label_values(&[outcome]).inc();
}

pub fn record_unmatched_response(payload: &str) {
    UNMATCHED_RESPONSES.with_label_values(&[payload]).inc();
}

pub fn record_stream_payload(result: &str) {
    STREAM_PAYLOADS.with_label_values(&[result]).inc();
}

pub fn record_stream_resync() {
    STREAM_RESYNCS.inc();
}

pub fn record_session(role: &str, state: &str) {
    SESSIONS.with_label_values(&[role, state]).inc();
}

/// Text exposition of every registered metric.
pub fn render() -> String {
    use prometheus::Encoder;
    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
