pub mod maintenance;
pub mod monitor;

pub use maintenance::{Alert, AlertEvent, EvaluatorSettings, MaintenanceEvaluator, MaintenanceService};
pub use monitor::{
    ContinuousMonitor, MonitorHandle, MonitorSettings, MonitorState, MonitorStats, MonitorStatus, RecordSink,
    TickRecord,
};
