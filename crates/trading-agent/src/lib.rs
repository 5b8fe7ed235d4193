//! Order-admission pipeline for a perpetual-futures trading agent.
//!
//! Decides, for every candidate signal, whether an order may reach the
//! exchange, and throttles submission from observed fills and failures.

pub mod admission;
pub mod config;
pub mod metrics;
pub mod notifier;
pub mod paper_exchange;
pub mod pipeline;
pub mod quality_gate;
pub mod runtime;
pub mod stats;
pub mod trade_executor;
pub mod types;


pub use admission::{AdmissionDecision, OrderSlot, SignalAdmissionController, SignalFingerprint};
pub use config::AgentConfig;
pub use pipeline::{Pipeline, PipelineOutcome};
pub use quality_gate::{QualityAssessment, QualityRejection, SignalQualityGate};
pub use runtime::SignalRouter;
pub use stats::{AdmissionStats, PipelineStats, VerdictCounts};
pub use trade_executor::{
    AntiChurnStats, ExecutionClient, ExecutionPhase, SubmitOutcome, SubmitReport,
};
pub use types::{EmergencyStop, InboundSignal, MarketContext};
