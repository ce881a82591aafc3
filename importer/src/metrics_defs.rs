//! Metrics definitions for the importer.

use shared::metrics_defs::{MetricDef, MetricType};

pub const USERS_PROCESSED: MetricDef = MetricDef {
    name: "import.users.processed",
    metric_type: MetricType::Counter,
    description: "Number of usernames processed, tagged by outcome",
};

pub const VEHICLES_IMPORTED: MetricDef = MetricDef {
    name: "import.vehicles.imported",
    metric_type: MetricType::Counter,
    description: "Number of vehicles written by imports",
};

pub const USER_DURATION: MetricDef = MetricDef {
    name: "import.user.duration",
    metric_type: MetricType::Histogram,
    description: "Time to import a single username in seconds",
};

pub const USER_RETRIES: MetricDef = MetricDef {
    name: "import.user.retries",
    metric_type: MetricType::Counter,
    description: "Number of retries spent on user imports",
};

pub const ROLLBACKS: MetricDef = MetricDef {
    name: "import.rollbacks",
    metric_type: MetricType::Counter,
    description: "Number of user transactions rolled back, tagged by outcome",
};

pub const ALERTS: MetricDef = MetricDef {
    name: "import.alerts",
    metric_type: MetricType::Counter,
    description: "Number of alerts raised during imports, tagged by kind",
};

pub const JOBS_FINISHED: MetricDef = MetricDef {
    name: "import.jobs.finished",
    metric_type: MetricType::Counter,
    description: "Number of import jobs that reached a final status, tagged by status",
};

pub const ACTIVE_WORKERS: MetricDef = MetricDef {
    name: "import.workers.active",
    metric_type: MetricType::Gauge,
    description: "Number of batch workers currently running",
};

pub const API_RATE_LIMITED: MetricDef = MetricDef {
    name: "api.rate_limited",
    metric_type: MetricType::Counter,
    description: "Number of job API requests rejected by the per-caller limiter",
};

pub const ALL_METRICS: &[MetricDef] = &[
    USERS_PROCESSED,
    VEHICLES_IMPORTED,
    USER_DURATION,
    USER_RETRIES,
    ROLLBACKS,
    ALERTS,
    JOBS_FINISHED,
    ACTIVE_WORKERS,
    API_RATE_LIMITED,
];
