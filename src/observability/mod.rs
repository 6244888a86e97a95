pub mod metrics;
pub mod monitor;

pub use metrics::StageMetrics;
pub use monitor::{sensor_of, ExperimentMonitor, MonitorEvent, MonitorQuantity};
