use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use triage_agent_core::{AgentInvoker, Telemetry, TelemetryEvent, ToolLoopBackend};
use triage_ai::{
    AdapterRegistry, LlmClient, ModelRef, OpenAiApiMode, OpenAiClient, OpenAiConfig,
};
use triage_github_issues::{load_issues_file, Issue};
use triage_memory::{
    precompute_shared_cache, AgentSymptomExtractor, KeywordSymptomExtractor, LocalCaseIndex,
    MemoryRetriever, SymptomExtractor, DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_MAX_SYMPTOM_TERMS,
};
use triage_runner::{run_batch, BatchReport, RunnerOrchestrator, TriageConfig};

use crate::cli_args::{AnalyzeArgs, CliApiMode, CliSymptomExtractor};

/// Loads the config file (if any) and applies CLI overrides.
pub(crate) fn resolve_config(args: &AnalyzeArgs) -> Result<TriageConfig> {
    let mut config = match &args.config {
        Some(path) => TriageConfig::load(path)?,
        None => TriageConfig::default(),
    };
    if let Some(enabled) = args.memory {
        config.memory.enabled = enabled;
    }
    if let Some(max_concurrency) = args.max_concurrency {
        config.batch.max_concurrency = max_concurrency;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.invoker.timeout_ms = timeout_ms;
    }
    if let Some(retries) = args.max_malformed_retries {
        config.invoker.max_malformed_retries = retries;
    }
    config.validate()?;
    Ok(config)
}

fn parse_models(raw: &[String]) -> Result<Vec<ModelRef>> {
    let models = raw
        .iter()
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            ModelRef::parse(entry).with_context(|| format!("invalid --model '{entry}'"))
        })
        .collect::<Result<Vec<_>>>()?;
    if models.is_empty() {
        bail!("at least one --model is required");
    }
    Ok(models)
}

fn build_client(args: &AnalyzeArgs, model: &ModelRef) -> Result<Arc<dyn LlmClient>> {
    let api_key = args
        .api_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| anyhow!("missing API key: pass --api-key or set TRIAGE_API_KEY"))?;
    let client = OpenAiClient::new(OpenAiConfig {
        api_base: args.api_base.clone(),
        api_key,
        api_mode: match args.api_mode {
            CliApiMode::Chat => OpenAiApiMode::ChatCompletions,
            CliApiMode::Responses => OpenAiApiMode::Responses,
        },
        ..OpenAiConfig::default()
    })
    .with_context(|| format!("failed to create client for {model}"))?;
    Ok(AdapterRegistry::global().adapt_client(model.family, Arc::new(client)))
}

fn telemetry_logger() -> Telemetry {
    Telemetry::new(|event: &TelemetryEvent| match event {
        TelemetryEvent::HistoryTrim(report) if report.truncated => {
            tracing::debug!(
                level = report.level.as_str(),
                kept = report.kept_messages,
                dropped = report.dropped_messages,
                "telemetry: history trimmed"
            );
        }
        TelemetryEvent::Invocation(metrics) => {
            tracing::debug!(
                model = %metrics.model,
                attempts = metrics.attempts,
                retries = metrics.retries,
                total_tokens = metrics.total_tokens,
                duration_ms = metrics.duration_ms,
                state = metrics.state.as_str(),
                "telemetry: invocation finished"
            );
        }
        TelemetryEvent::MemoryRetrieval(report) => {
            tracing::debug!(
                issue_id = report.issue_id,
                cache_hit = report.cache_hit,
                cases = report.cases_retrieved,
                avg_similarity = report.avg_similarity,
                "telemetry: memory retrieval"
            );
        }
        _ => {}
    })
}

async fn build_memory(
    args: &AnalyzeArgs,
    config: &TriageConfig,
    extractor_invoker: Arc<AgentInvoker>,
    issues: &[Issue],
    telemetry: &Telemetry,
) -> Result<Option<Arc<MemoryRetriever>>> {
    let Some(cases_path) = &args.cases else {
        if args.memory == Some(true) {
            bail!("--memory requires --cases");
        }
        return Ok(None);
    };
    if !config.memory.enabled {
        return Ok(None);
    }

    let index = LocalCaseIndex::load_jsonl(cases_path, DEFAULT_EMBEDDING_DIMENSIONS)?;
    let extractor: Arc<dyn SymptomExtractor> = match args.symptom_extractor {
        CliSymptomExtractor::Keyword => Arc::new(KeywordSymptomExtractor::default()),
        CliSymptomExtractor::Agent => Arc::new(AgentSymptomExtractor::new(
            extractor_invoker,
            DEFAULT_MAX_SYMPTOM_TERMS,
        )),
    };
    let search = Arc::new(index);
    let precompute =
        MemoryRetriever::new(search.clone(), extractor.clone(), config.memory.clone());
    let cache = precompute_shared_cache(&precompute, issues).await;
    let retriever = MemoryRetriever::new(search, extractor, config.memory.clone())
        .with_shared_cache(cache)
        .with_telemetry(telemetry.clone());
    Ok(Some(Arc::new(retriever)))
}

/// Runs `triage analyze` end to end and returns the batch report.
pub(crate) async fn run_analyze(args: &AnalyzeArgs) -> Result<BatchReport> {
    let config = resolve_config(args)?;
    let issues = load_issues_file(&args.issues)?;
    let models = parse_models(&args.model)?;
    let telemetry = telemetry_logger();

    let mut invokers = Vec::with_capacity(models.len());
    for model in &models {
        let client = build_client(args, model)?;
        let backend = ToolLoopBackend::new(client, model.clone(), config.backend.clone());
        let invoker = Arc::new(AgentInvoker::new(
            Arc::new(backend),
            config.invoker.clone(),
            telemetry.clone(),
        ));
        invokers.push((model.clone(), invoker));
    }
    let extractor_invoker = invokers
        .first()
        .map(|(_, invoker)| invoker.clone())
        .ok_or_else(|| anyhow!("at least one --model is required"))?;
    let memory = build_memory(args, &config, extractor_invoker, &issues, &telemetry).await?;

    let runners = invokers
        .into_iter()
        .map(|(model, invoker)| {
            let mut runner = RunnerOrchestrator::new(
                model.to_string(),
                invoker,
                config.token_budget_for(&model),
                telemetry.clone(),
            )
            .with_usage_limits(config.usage_limits.clone());
            if let Some(retriever) = &memory {
                runner = runner.with_memory(retriever.clone());
            }
            Arc::new(runner)
        })
        .collect::<Vec<_>>();

    Ok(run_batch(&runners, &issues, config.batch.max_concurrency).await)
}

pub(crate) fn write_report(args: &AnalyzeArgs, report: &BatchReport) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(report).context("failed to serialize batch report")?;
    match &args.output {
        Some(path) => std::fs::write(path, format!("{rendered}\n"))
            .with_context(|| format!("failed to write report {}", path.display()))?,
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{rendered}").context("failed to write report to stdout")?;
        }
    }
    eprintln!(
        "triaged {} issue run(s): {} succeeded, {} failed",
        report.results.len(),
        report.succeeded,
        report.failed
    );
    Ok(())
}
