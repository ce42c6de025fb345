pub mod settings;

pub use settings::{
    Config,
    DatabaseSettings,
    FileOutputSettings,
    MaintenanceSettings,
    MotorSettings,
    OutputFormat,
    OutputSettings,
    ParityConfig,
    ScorerKind,
    ScoringSettings,
    SerialSettings,
};
