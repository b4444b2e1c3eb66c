//! Issue triage runners: configuration, the per-issue orchestrator and the
//! batch driver.
mod batch;
mod config;
mod orchestrator;
mod output;
#[cfg(test)]
mod test_support;

pub use batch::{run_batch, BatchReport, FailureRecord, IssueResult};
pub use config::{BatchConfig, ConfigError, TriageConfig, DEFAULT_MAX_CONCURRENCY};
pub use orchestrator::{build_triage_prompt, AnalysisReport, RunnerFailure, RunnerOrchestrator};
pub use output::{triage_output_schema, TriageCategory, TriageOutput};
