pub mod config;
pub mod config_loader;
pub mod error;
pub mod escalation;
pub mod events;
pub mod metrics;
pub mod metrics_formatter;
pub mod store;
pub mod traits;
pub mod types;

pub use config::{AppConfig, DispatchConfig, ExecutionConfig, RetryConfig, RuntimeConfig};
pub use config_loader::ConfigLoader;
pub use error::CoreError;
pub use escalation::{LogEscalation, RecordingEscalation};
pub use events::{AbandonReason, CycleOutcome, Escalation, ExecutionEvent, LegResult, Severity};
pub use metrics::{Counter, ExecutionMetrics, MetricsSnapshot};
pub use metrics_formatter::MetricsFormatter;
pub use store::InMemoryLegStore;
pub use traits::{BetExecutionAdapter, EscalationSink, LegStore, OddsStream, OpportunitySource, Placement};
pub use types::{
    Leg, LegHandle, LegQuote, LegStatus, OddsEvent, Opportunity, OpportunityId, OutcomeId,
    OutcomeOdds, Platform,
};
