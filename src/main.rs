//! turnjudge CLI - Multi-turn inference and three-judge grading.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;
use turnjudge::{Config, InferencePipeline, JudgePipeline, RunStats};

#[derive(Parser)]
#[command(name = "turnjudge")]
#[command(version)]
#[command(about = "Concurrent multi-turn inference and three-judge grading")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration: a TOML file path or an inline JSON object
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a dataset through the configured backend
    Infer {
        /// Path to input dataset JSONL file
        #[arg(short, long)]
        dataset: PathBuf,

        /// Only load the first N records
        #[arg(long)]
        sample_cnt: Option<usize>,

        /// Output directory
        #[arg(short, long, default_value = "results/")]
        output_dir: PathBuf,
    },

    /// Grade an inference output file with three judge runs per turn
    Judge {
        /// Path to inference output JSONL file
        #[arg(short, long)]
        eval_file: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "eval_results/")]
        output_dir: PathBuf,
    },

    /// Validate configuration
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn load_config(arg: &str) -> Result<Config> {
    Config::load(arg).with_context(|| format!("Failed to load config from {arg:?}"))
}

fn print_stats(title: &str, stats: &RunStats, output: &Path) {
    println!("\n=== {title} ===");
    println!("Records:     {}", stats.records);
    println!("Turns:       {}", stats.turns);
    println!("Failed:      {}", stats.failed_turns);
    if let (Some(passed), Some(rate)) = (stats.passed_records, stats.pass_rate()) {
        println!("Passed:      {passed}");
        println!("Pass rate:   {:.1}%", rate * 100.0);
    }
    println!("Runtime:     {:.1}s", stats.runtime_secs());
    println!("Output:      {output:?}");
}

fn print_example_config() {
    let example = r#"# turnjudge configuration file

model_name = "gpt-4o"
# openai | anthropic | gemini | vllm
backend = "openai"
concurrency = 16
retry_backoff_ms = 1000

[sampling_params]
temperature = 0.0
max_tokens = 4096

[openai]
# serving = "azure"
# base_url = "https://my-resource.openai.azure.com"
# API key (can also use OPENAI_API_KEY env var, or "${MY_VAR}")
# api_key = "sk-..."
# tokenizer = "o200k_base"

# [anthropic]
# api_key_env = "ANTHROPIC_API_KEY"
# project_id = "my-gcp-project"   # Vertex AI instead of the direct API
# location = "global"

# [gemini]
# project_id = "my-gcp-project"
# location = "global"
# access_token_env = "GOOGLE_ACCESS_TOKEN"
# send_timeout_secs = 300

# [vllm]
# base_url = "http://localhost:8000"
# max_user_input_tokens = 30000
# response_prefix = "</think>"
# enable_thinking = true

[judge]
system_prompt = "prompts/judge_system.txt"
user_prompt = "prompts/judge_user.txt"
user_prompt_multiturn = "prompts/judge_user_multiturn.txt"
"#;
    println!("{example}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            // Builds the adaptor without sending anything; resolves credentials too.
            let adaptor = turnjudge::initialize(&config).context("Invalid configuration")?;
            adaptor.terminate();

            info!("Configuration is valid");
            info!("  Model: {}", config.model_name);
            info!("  Backend: {}", config.backend);
            info!("  Concurrency: {}", config.concurrency);
            info!("  Sampling params: {}", config.sampling_params.len());
            return Ok(());
        }

        Commands::Infer {
            dataset,
            sample_cnt,
            output_dir,
        } => {
            let config = load_config(&cli.config)?;
            let label = InferencePipeline::label_for(&cli.config, &config);
            let pipeline = InferencePipeline::new(config, label);

            let (stats, output) = pipeline
                .run(&dataset, sample_cnt, &output_dir)
                .await
                .with_context(|| format!("Inference failed for {dataset:?}"))?;

            print_stats("Inference Complete", &stats, &output);
        }

        Commands::Judge {
            eval_file,
            output_dir,
        } => {
            let config = load_config(&cli.config)?;
            let pipeline = JudgePipeline::new(config).context("Failed to set up judge")?;

            let (stats, output) = pipeline
                .run(&eval_file, &output_dir)
                .await
                .with_context(|| format!("Judging failed for {eval_file:?}"))?;

            print_stats("Judging Complete", &stats, &output);
        }
    }

    Ok(())
}
