use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "gateway.request.duration",
    metric_type: MetricType::Histogram,
    description: "SDK request duration in seconds. Tagged with handler, status.",
};

pub const REGISTER_EVENTS_HANDLED: MetricDef = MetricDef {
    name: "gateway.register_events.handled",
    metric_type: MetricType::Counter,
    description: "Per-event outcomes of RegisterEvents. Tagged with code.",
};

pub const ALL_METRICS: &[MetricDef] = &[REQUEST_DURATION, REGISTER_EVENTS_HANDLED];
