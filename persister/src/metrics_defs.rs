use shared::metrics_defs::{MetricDef, MetricType};

pub const RECEIVED: MetricDef = MetricDef {
    name: "persister.received",
    metric_type: MetricType::Counter,
    description: "Messages received from the bus.",
};

pub const HANDLED: MetricDef = MetricDef {
    name: "persister.handled",
    metric_type: MetricType::Counter,
    description: "Message outcomes. Tagged with code: ok, repeatable_error, \
                  non_repeatable_error, bad_message, missing_id, duplicate_id.",
};

pub const FLUSH_SIZE: MetricDef = MetricDef {
    name: "persister.flush.size",
    metric_type: MetricType::Histogram,
    description: "Number of messages per flush.",
};

pub const ALL_METRICS: &[MetricDef] = &[RECEIVED, HANDLED, FLUSH_SIZE];
