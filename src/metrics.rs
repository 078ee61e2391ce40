use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, TextEncoder, register_counter, register_gauge,
    register_histogram,
};

lazy_static! {
    pub static ref ADMISSION_CHECKS: Counter =
        register_counter!("verse_gate_admission_checks_total", "Total admission checks")
            .expect("metric registers once");
    pub static ref RATE_LIMITED: Counter =
        register_counter!("verse_gate_rate_limited_total", "Checks denied by the window limit")
            .expect("metric registers once");
    pub static ref CAPTCHA_BLOCKED: Counter = register_counter!(
        "verse_gate_captcha_blocked_total",
        "Checks denied pending CAPTCHA verification"
    )
    .expect("metric registers once");
    pub static ref REQUESTS_RECORDED: Counter =
        register_counter!("verse_gate_requests_recorded_total", "Admitted requests recorded")
            .expect("metric registers once");
    pub static ref REQUESTS_REFUNDED: Counter = register_counter!(
        "verse_gate_requests_refunded_total",
        "Admissions given back after the guarded handler failed"
    )
    .expect("metric registers once");
    pub static ref LIMIT_RESETS: Counter =
        register_counter!("verse_gate_limit_resets_total", "Administrative limit resets")
            .expect("metric registers once");
    pub static ref CAPTCHA_CHALLENGES: Counter = register_counter!(
        "verse_gate_captcha_challenges_total",
        "Identifiers moved into the CAPTCHA-required state"
    )
    .expect("metric registers once");
    pub static ref CAPTCHA_VERIFIED: Counter =
        register_counter!("verse_gate_captcha_verified_total", "Successful CAPTCHA verifications")
            .expect("metric registers once");
    pub static ref CAPTCHA_FAILED: Counter =
        register_counter!("verse_gate_captcha_failed_total", "Failed CAPTCHA verifications")
            .expect("metric registers once");
    pub static ref CAPTCHA_LATENCY: Histogram = register_histogram!(
        "verse_gate_captcha_verify_seconds",
        "CAPTCHA verification round trip in seconds"
    )
    .expect("metric registers once");
    pub static ref ACTIVE_ACTORS: Gauge =
        register_gauge!("verse_gate_active_actors", "Per-identifier actors currently running")
            .expect("metric registers once");
}

// Text exposition of everything in the default registry
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
