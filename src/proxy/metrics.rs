use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};

// Terminal routing outcomes: forward, forbidden, unavailable, not_found
pub static ROUTE_DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pingroute_route_decisions_total",
        "Routing decisions by outcome",
        &["outcome"]
    )
    .unwrap()
});

pub static HEALTH_CHECKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pingroute_health_checks_total",
        "Backend health checks by result",
        &["result"]
    )
    .unwrap()
});

pub static BACKEND_SELECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pingroute_backend_selections_total",
        "Backends chosen per selection algorithm",
        &["algorithm"]
    )
    .unwrap()
});
