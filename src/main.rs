use clap::{Parser, Subcommand};
use nomina::config::{self, BatchConfig};
use nomina::dispatch;
use nomina::resolve::{resolver_for, MissingFieldPolicy};
use nomina::schema;
use nomina::service::InferenceClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Batch payroll computation through a structured-output inference API
#[derive(Parser)]
#[command(name = "nomina")]
#[command(about = "Validate payroll records and batch-compute them via structured outputs", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch of payroll computations
    Run {
        /// Path to JSONL input, one payroll record per line
        #[arg(long)]
        input: PathBuf,

        /// Directory for result files and the error log
        #[arg(long, default_value = "outputs")]
        output_dir: PathBuf,

        /// Input schema the records must conform to
        #[arg(long, default_value = "schemas/payroll_input.schema.json")]
        input_schema: PathBuf,

        /// Result schema the service responses must conform to
        #[arg(long, default_value = "schemas/payroll_result.schema.json")]
        result_schema: PathBuf,

        /// Model identifier (overrides NOMINA_MODEL / OPENAI_MODEL)
        #[arg(long)]
        model: Option<String>,

        /// API base URL (overrides NOMINA_BASE_URL)
        #[arg(long)]
        base_url: Option<String>,

        /// Number of concurrent workers
        #[arg(short, long, default_value_t = config::DEFAULT_WORKERS)]
        workers: usize,

        /// How to resolve missing required fields
        #[arg(long, value_enum, default_value = "fail")]
        missing_policy: MissingFieldPolicy,

        /// Pin sampling temperature to zero for reproducible reruns
        #[arg(long)]
        deterministic: bool,

        /// Per-request timeout in seconds
        #[arg(long, default_value = "120")]
        timeout_secs: u64,

        /// Retries for transient service failures
        #[arg(long, default_value = "2")]
        max_retries: u32,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(cli.verbose >= 2)
        .init();

    debug!("nomina started with verbosity level: {}", cli.verbose);

    let result = match cli.command {
        Commands::Run {
            input,
            output_dir,
            input_schema,
            result_schema,
            model,
            base_url,
            workers,
            missing_policy,
            deterministic,
            timeout_secs,
            max_retries,
        } => {
            run_batch_command(BatchArgs {
                input,
                output_dir,
                input_schema,
                result_schema,
                model,
                base_url,
                workers,
                missing_policy,
                deterministic,
                timeout_secs,
                max_retries,
            })
            .await
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Fatal error: {}", e);
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

struct BatchArgs {
    input: PathBuf,
    output_dir: PathBuf,
    input_schema: PathBuf,
    result_schema: PathBuf,
    model: Option<String>,
    base_url: Option<String>,
    workers: usize,
    missing_policy: MissingFieldPolicy,
    deterministic: bool,
    timeout_secs: u64,
    max_retries: u32,
}

async fn run_batch_command(args: BatchArgs) -> anyhow::Result<i32> {
    let config = BatchConfig {
        input: args.input,
        output_dir: args.output_dir,
        input_schema: args.input_schema,
        result_schema: args.result_schema,
        model: config::resolve_model(args.model),
        base_url: config::resolve_base_url(args.base_url),
        api_key: config::resolve_api_key()?,
        workers: args.workers,
        timeout: Duration::from_secs(args.timeout_secs),
        max_retries: args.max_retries,
        retry_delay_ms: 500,
        policy: args.missing_policy,
        deterministic: args.deterministic,
    };

    // The `ask` policy fails here, before anything is dispatched, when no
    // interactive terminal is available.
    let resolver = resolver_for(config.policy)?;

    let result_schema = schema::load_value("PayrollResult", &config.result_schema)?;
    let service = Arc::new(InferenceClient::new(&config, result_schema)?);

    let summary = dispatch::run_batch(&config, resolver, service).await?;

    if summary.total == 0 {
        eprintln!("No records found in {}", config.input.display());
        return Ok(2);
    }

    if summary.is_clean() {
        println!("[DONE] {} ok, 0 errors", summary.succeeded);
        Ok(0)
    } else {
        eprintln!(
            "[DONE with errors] {} ok, {} errors -> {}",
            summary.succeeded,
            summary.failed,
            config
                .output_dir
                .join(nomina::output::ERROR_LOG_NAME)
                .display()
        );
        Ok(3)
    }
}
