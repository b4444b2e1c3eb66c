use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "triage",
    about = "LLM-assisted triage of GitHub support issues",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Triage every issue in a file with one runner per model.
    Analyze(AnalyzeArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliApiMode {
    Chat,
    Responses,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliSymptomExtractor {
    Keyword,
    Agent,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    #[arg(
        long,
        env = "TRIAGE_ISSUES",
        help = "Issue file: a GitHub REST issue array, {issue, comments} bundles or simplified records"
    )]
    pub issues: PathBuf,

    #[arg(
        long,
        env = "TRIAGE_CASES",
        help = "JSONL history of resolved cases used for similar-case memory"
    )]
    pub cases: Option<PathBuf>,

    #[arg(
        long,
        env = "TRIAGE_MODEL",
        value_delimiter = ',',
        default_value = "openai/gpt-4o-mini",
        help = "Model in provider/model format. Repeat or comma-separate to run one runner per model."
    )]
    pub model: Vec<String>,

    #[arg(
        long,
        env = "TRIAGE_API_BASE",
        default_value = "https://api.openai.com/v1",
        help = "Base URL for OpenAI-compatible APIs"
    )]
    pub api_base: String,

    #[arg(
        long,
        env = "TRIAGE_API_KEY",
        hide_env_values = true,
        help = "API key for the model endpoint"
    )]
    pub api_key: Option<String>,

    #[arg(
        long,
        env = "TRIAGE_API_MODE",
        value_enum,
        default_value_t = CliApiMode::Chat,
        help = "OpenAI API surface: chat completions or responses"
    )]
    pub api_mode: CliApiMode,

    #[arg(
        long,
        env = "TRIAGE_CONFIG",
        help = "TOML file with token budget, invoker, usage limit, memory and backend settings"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "TRIAGE_MEMORY",
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Enable similar-case memory injection (requires --cases). Overrides the config file."
    )]
    pub memory: Option<bool>,

    #[arg(
        long,
        env = "TRIAGE_SYMPTOM_EXTRACTOR",
        value_enum,
        default_value_t = CliSymptomExtractor::Keyword,
        help = "How symptoms are extracted for the memory query"
    )]
    pub symptom_extractor: CliSymptomExtractor,

    #[arg(
        long,
        env = "TRIAGE_MAX_CONCURRENCY",
        value_parser = parse_positive_usize,
        help = "Maximum concurrent (runner, issue) analyses. Overrides the config file."
    )]
    pub max_concurrency: Option<usize>,

    #[arg(
        long,
        env = "TRIAGE_TIMEOUT_MS",
        value_parser = parse_positive_u64,
        help = "Wall-clock ceiling per agent invocation in milliseconds. Overrides the config file."
    )]
    pub timeout_ms: Option<u64>,

    #[arg(
        long,
        env = "TRIAGE_MAX_MALFORMED_RETRIES",
        help = "Retries allowed after malformed provider responses. Overrides the config file."
    )]
    pub max_malformed_retries: Option<usize>,

    #[arg(
        long,
        env = "TRIAGE_OUTPUT",
        help = "Write the JSON batch report here instead of stdout"
    )]
    pub output: Option<PathBuf>,
}
