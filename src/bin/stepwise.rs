//! Stepwise CLI - declarative REST API test runner.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::exit;
use std::time::Instant;
use stepwise::report::{self, ReportGenerator, ReportSink, Summary};
use stepwise::{
    load_user_configs, DefaultTestRunner, RunnerConfig, StepStatus, TestCase,
    TestConfigManager, TestResult, DEFAULT_REPORT_DIR, DEFAULT_TEST_DIR,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Stepwise - run YAML test cases against a REST API.
#[derive(Parser, Debug)]
#[command(name = "stepwise", version, about)]
struct Cli {
    /// Directory searched recursively for test case files.
    #[arg(long = "testDir", default_value = DEFAULT_TEST_DIR)]
    test_dir: PathBuf,

    /// Directory receiving the generated reports.
    #[arg(long = "reportDir", default_value = DEFAULT_REPORT_DIR)]
    report_dir: PathBuf,

    /// Run a single test case file instead of the whole directory.
    #[arg(long = "testFile")]
    test_file: Option<PathBuf>,

    /// User/auth configuration file.
    #[arg(long = "users", env = "STEPWISE_USERS")]
    users: Option<PathBuf>,

    /// Base URL for relative endpoints.
    #[arg(short = 'b', long = "baseUrl", env = "STEPWISE_BASE_URL")]
    base_url: Option<String>,

    /// Number of test cases run concurrently.
    #[arg(short = 'j', long = "parallel", default_value_t = 1)]
    parallel: usize,

    /// Report output format.
    #[arg(long = "reportFormat", value_enum, default_value = "all")]
    report_format: ReportFormatArg,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormatArg {
    Text,
    Html,
    Json,
    All,
}

impl ReportFormatArg {
    fn formats(self) -> Vec<report::ReportFormat> {
        match self {
            ReportFormatArg::Text => vec![report::ReportFormat::Text],
            ReportFormatArg::Html => vec![report::ReportFormat::Html],
            ReportFormatArg::Json => vec![report::ReportFormat::Json],
            ReportFormatArg::All => report::ReportFormat::ALL.to_vec(),
        }
    }
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn print_test_result(result: &TestResult) {
    let status = if result.passed {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!("{} test: {} ({} ms)", status, result.name, result.duration_ms);

    for (i, step) in result.executed_steps.iter().enumerate() {
        let marker = match step.status {
            StepStatus::Passed => "\x1b[32m✓\x1b[0m",
            StepStatus::Skipped => "\x1b[33m-\x1b[0m",
            StepStatus::Failed => "\x1b[31m✗\x1b[0m",
        };
        info!(
            "  {}. {} [{}] {} ({} ms)",
            i + 1,
            marker,
            step.phase,
            step.label(),
            step.duration_ms
        );
    }
    for failure in &result.failure_messages {
        error!("     \x1b[31m{}\x1b[0m", failure);
    }
    for warning in &result.cleanup_warnings {
        info!("     cleanup warning: {}", warning);
    }
}

fn load_test_cases(args: &Cli) -> Result<Vec<TestCase>> {
    let mut manager = TestConfigManager::with_paths(Vec::new());
    match &args.test_file {
        Some(file) => {
            if !file.is_file() {
                bail!("Test file does not exist: {}", file.display());
            }
            manager.add_path(file);
        }
        None => {
            if !args.test_dir.is_dir() {
                bail!("Test directory does not exist: {}", args.test_dir.display());
            }
            manager.add_path(&args.test_dir);
        }
    }

    let cases = manager.load_all()?;
    if cases.is_empty() {
        bail!("No test cases found");
    }
    Ok(cases)
}

async fn run(args: Cli) -> Result<bool> {
    let cases = load_test_cases(&args)?;

    let mut config = RunnerConfig::default();
    config.base_url = args.base_url.clone();
    let users = match &args.users {
        Some(path) => load_user_configs(path)?,
        None => Default::default(),
    };
    let runner = DefaultTestRunner::from_config(config)
        .context("Failed to create test runner")?
        .with_users(users);

    if let Some(base_url) = &runner.config().base_url {
        info!("Base URL: {}", base_url);
    }

    let started = Instant::now();
    info!("Running {} test(s)...", cases.len());
    let results = runner.run_suite_parallel(cases, args.parallel).await;

    for result in &results {
        print_test_result(result);
    }

    let summary = Summary::from_results(&results);
    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Success Rate: {}%\n  Duration: {} ms",
        summary.total,
        summary.passed,
        summary.failed,
        summary.success_rate,
        started.elapsed().as_millis()
    );

    let generator = ReportGenerator::new(&args.report_dir)
        .with_formats(&args.report_format.formats());
    info!("Writing reports to {}", generator.output_dir().display());
    match generator.publish(&results) {
        Ok(paths) => {
            for path in paths {
                info!("Report saved: {}", path.display());
            }
        }
        // report problems never change the outcome of the run
        Err(e) => error!("Failed to save report: {:#}", e),
    }

    Ok(summary.all_passed())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    if !run(args).await? {
        exit(1);
    }

    Ok(())
}
