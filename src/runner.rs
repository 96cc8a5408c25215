//! Test execution logic

use crate::auth::{resolve_credentials, UserConfig};
use crate::condition;
use crate::config::RunnerConfig;
use crate::context::VariableContext;
use crate::extractor;
use crate::http::{HttpClient, PreparedRequest, ReqwestClient};
use crate::interpolate::{apply_template_variables, interpolate};
use crate::model::*;
use crate::validator;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Test runner trait
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Execute a test case. Failures are reported in the result, never
    /// as an error.
    async fn run(&self, case: &TestCase) -> TestResult;
}

/// Pause between retry attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Attempt budget of a step. Attempts are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn for_step(step: &Step) -> Self {
        Self {
            retries: step.retries,
            interval: step.retry_interval(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Wait required before `attempt`; never before the first one.
    pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
        (attempt > 1 && !self.interval.is_zero()).then_some(self.interval)
    }

    pub fn is_last(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts()
    }
}

/// How a single step ended.
#[derive(Debug)]
pub enum StepOutcome {
    Skipped,
    Passed { attempts: u32 },
    /// Verification still failing after the last attempt.
    Failed { attempts: u32, failures: Vec<String> },
    /// The request could not be built or sent.
    Errored { attempts: u32, error: anyhow::Error },
}

impl StepOutcome {
    pub fn status(&self) -> StepStatus {
        match self {
            StepOutcome::Skipped => StepStatus::Skipped,
            StepOutcome::Passed { .. } => StepStatus::Passed,
            StepOutcome::Failed { .. } | StepOutcome::Errored { .. } => StepStatus::Failed,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            StepOutcome::Skipped => 0,
            StepOutcome::Passed { attempts }
            | StepOutcome::Failed { attempts, .. }
            | StepOutcome::Errored { attempts, .. } => *attempts,
        }
    }

    /// Failure messages for the result, annotated with the step name and
    /// its configured retry count.
    pub fn messages(&self, step: &Step) -> Vec<String> {
        let retries = step.retries;
        match self {
            StepOutcome::Skipped | StepOutcome::Passed { .. } => Vec::new(),
            StepOutcome::Failed { failures, .. } => {
                let suffix = if retries > 0 {
                    format!(" after {} {}", retries, retry_word(retries))
                } else {
                    String::new()
                };
                if failures.is_empty() {
                    return vec![format!("Step '{}': Failed{}", step.name, suffix)];
                }
                failures
                    .iter()
                    .map(|f| format!("Step '{}': {}{}", step.name, f, suffix))
                    .collect()
            }
            StepOutcome::Errored { error, .. } => {
                let suffix = if retries > 0 {
                    format!(" (after {} {})", retries, retry_word(retries))
                } else {
                    String::new()
                };
                vec![format!(
                    "Step '{}': Exception - {:#}{}",
                    step.name, error, suffix
                )]
            }
        }
    }
}

/// Default test runner
#[derive(Clone)]
pub struct DefaultTestRunner {
    client: Arc<dyn HttpClient>,
    sleeper: Arc<dyn Sleeper>,
    config: RunnerConfig,
    users: Arc<HashMap<String, UserConfig>>,
}

impl fmt::Debug for DefaultTestRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultTestRunner")
            .field("config", &self.config)
            .field("users", &self.users.len())
            .finish_non_exhaustive()
    }
}

impl DefaultTestRunner {
    /// Create a runner backed by `reqwest` with default settings.
    pub fn new() -> Result<Self> {
        Self::from_config(RunnerConfig::default())
    }

    /// Create a runner backed by `reqwest`, using the configured
    /// connection timeout for its shared client.
    pub fn from_config(config: RunnerConfig) -> Result<Self> {
        let client =
            ReqwestClient::with_connect_timeout(config.default_connection_timeout())?;
        Ok(Self::with_client(Arc::new(client)).with_config(config))
    }

    /// Create a runner with a custom transport.
    pub fn with_client(client: Arc<dyn HttpClient>) -> Self {
        Self {
            client,
            sleeper: Arc::new(TokioSleeper),
            config: RunnerConfig::default(),
            users: Arc::new(HashMap::new()),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_users(mut self, users: HashMap<String, UserConfig>) -> Self {
        self.users = Arc::new(users);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `cases` one after another.
    pub async fn run_suite(&self, cases: &[TestCase]) -> Vec<TestResult> {
        info!("Running {} test cases", cases.len());
        let mut results = Vec::with_capacity(cases.len());
        for case in cases {
            results.push(self.run(case).await);
        }
        results
    }

    /// Run `cases` on up to `workers` concurrent tasks. Every case owns
    /// its variable context; results keep the input order.
    pub async fn run_suite_parallel(
        &self,
        cases: Vec<TestCase>,
        workers: usize,
    ) -> Vec<TestResult> {
        let workers = workers.max(1);
        if workers == 1 {
            return self.run_suite(&cases).await;
        }
        info!("Running {} test cases on {} workers", cases.len(), workers);

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        for (idx, case) in cases.iter().cloned().enumerate() {
            let runner = self.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (idx, runner.run(&case).await)
            });
        }

        let mut slots: Vec<Option<TestResult>> = vec![None; cases.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(err) => error!("Test case task failed: {}", err),
            }
        }

        slots
            .into_iter()
            .zip(&cases)
            .map(|(slot, case)| {
                slot.unwrap_or_else(|| {
                    TestResult::aborted(case, "Exception occurred: test case task did not complete")
                })
            })
            .collect()
    }

    /// Resolve placeholders, URL, default headers, body, credentials and
    /// timeouts for `step`.
    pub fn prepare_request(
        &self,
        step: &Step,
        ctx: &VariableContext,
    ) -> Result<PreparedRequest> {
        let def = &step.request;
        let url = self.config.resolve_url(&interpolate(&def.endpoint, ctx))?;
        let mut request = PreparedRequest::new(def.method, url);

        for (name, value) in &def.headers {
            request.headers.insert(name.clone(), interpolate(value, ctx));
        }
        if request.header("Accept").is_none() {
            request
                .headers
                .insert("Accept".to_string(), "application/json".to_string());
        }

        match &def.payload {
            Some(payload) if def.method.allows_body() => {
                let body = apply_template_variables(
                    &interpolate(payload, ctx),
                    &def.template_variables,
                );
                if request.header("Content-Type").is_none() {
                    request
                        .headers
                        .insert("Content-Type".to_string(), "application/json".to_string());
                }
                request.body = Some(body);
            }
            Some(_) => debug!(
                "Ignoring payload of {} request in step '{}'",
                def.method, step.name
            ),
            None => {}
        }

        request.credentials = def
            .user
            .as_deref()
            .and_then(|user| resolve_credentials(&self.users, user));
        request.timeout = Some(
            def.timeout
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.config.default_timeout()),
        );
        request.connection_timeout = Some(
            def.connection_timeout
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.config.default_connection_timeout()),
        );

        Ok(request)
    }

    /// Run a phase's steps in order. Returns whether every step passed.
    async fn run_phase(
        &self,
        phase: Phase,
        steps: &[Step],
        ctx: &mut VariableContext,
        result: &mut TestResult,
    ) -> bool {
        let mut all_passed = true;

        for step in steps {
            let started = Instant::now();
            let outcome = self.run_step(phase, step, ctx, result).await;
            result.executed_steps.push(ExecutedStep {
                phase,
                name: step.name.clone(),
                status: outcome.status(),
                attempts: outcome.attempts(),
                duration_ms: started.elapsed().as_millis() as u64,
            });

            let messages = outcome.messages(step);
            if messages.is_empty() {
                continue;
            }
            all_passed = false;
            for message in &messages {
                error!("{}", message);
            }
            if phase == Phase::Cleanup {
                result.cleanup_warnings.extend(messages);
            } else {
                result.failure_messages.extend(messages);
            }
            if phase.aborts_on_failure() {
                break;
            }
        }

        all_passed
    }

    #[instrument(skip_all, fields(phase = %phase, step = %step.name))]
    async fn run_step(
        &self,
        phase: Phase,
        step: &Step,
        ctx: &mut VariableContext,
        result: &mut TestResult,
    ) -> StepOutcome {
        if let Some(expression) = step.condition.as_deref() {
            if !condition::evaluate(expression, ctx) {
                info!(
                    "Skipping step '{}' as condition '{}' evaluated to false",
                    step.name, expression
                );
                return StepOutcome::Skipped;
            }
            debug!("Condition '{}' evaluated to true", expression);
        }

        info!("Executing step: {}", step.name);
        let request = match self.prepare_request(step, ctx) {
            Ok(request) => request,
            Err(error) => return StepOutcome::Errored { attempts: 0, error },
        };

        let policy = RetryPolicy::for_step(step);
        let mut failures = Vec::new();
        let mut attempt = 0;

        while !policy.is_last(attempt) {
            attempt += 1;
            if let Some(delay) = policy.delay_before(attempt) {
                debug!("Waiting {}ms before retry", delay.as_millis());
                self.sleeper.sleep(delay).await;
            }
            if attempt > 1 {
                info!(
                    "Retrying step '{}' (attempt {}/{})",
                    step.name,
                    attempt,
                    policy.max_attempts()
                );
            }

            match self.client.execute(&request).await {
                Ok(response) => {
                    result.last_response = Some(response.clone());
                    failures = match &step.verify {
                        Some(verify) => validator::verify(&response, verify, Some(&*ctx)),
                        None => {
                            warn!("Step '{}' has no verification criteria defined", step.name);
                            Vec::new()
                        }
                    };

                    if failures.is_empty() {
                        if let Some(verify) = &step.verify {
                            extractor::extract(
                                &response.body,
                                &verify.extractions,
                                ctx,
                                &step.name,
                            );
                        }
                        let label = ExecutedStep {
                            phase,
                            name: step.name.clone(),
                            status: StepStatus::Passed,
                            attempts: attempt,
                            duration_ms: 0,
                        }
                        .label();
                        info!("Step '{}' passed", label);
                        return StepOutcome::Passed { attempts: attempt };
                    }
                    if !policy.is_last(attempt) {
                        debug!(
                            "Step '{}' failed assertions on attempt {}, will retry",
                            step.name, attempt
                        );
                    }
                }
                Err(error) => {
                    if policy.is_last(attempt) {
                        return StepOutcome::Errored {
                            attempts: attempt,
                            error,
                        };
                    }
                    debug!(
                        "Step '{}' failed with exception on attempt {}, will retry: {:#}",
                        step.name, attempt, error
                    );
                }
            }
        }

        StepOutcome::Failed {
            attempts: attempt,
            failures,
        }
    }
}

#[async_trait]
impl TestRunner for DefaultTestRunner {
    #[instrument(skip(self, case), fields(name = %case.name))]
    async fn run(&self, case: &TestCase) -> TestResult {
        let started = Instant::now();
        let mut result = TestResult::start(case);
        let mut ctx = VariableContext::new();
        let mut aborted = false;

        info!("Executing test: {}", case.name);

        for phase in Phase::ALL {
            let steps = case.steps(phase);
            if steps.is_empty() {
                continue;
            }
            if aborted && phase != Phase::Cleanup {
                debug!("Skipping {} after earlier failure", phase);
                continue;
            }

            info!("Executing {} for test: {}", phase, case.name);
            if self.run_phase(phase, steps, &mut ctx, &mut result).await {
                continue;
            }
            match phase {
                Phase::Cleanup => warn!("Cleanup had issues for test: {}", case.name),
                Phase::Execution => error!("Execution failed for test: {}", case.name),
                _ => {
                    error!("{} failed for test: {}", phase, case.name);
                    aborted = true;
                }
            }
        }

        result.finish(&ctx, started.elapsed());
        if result.passed {
            info!("Test passed: {} ({} ms)", case.name, result.duration_ms);
        } else {
            info!(
                "Test failed: {} - Failures: {}",
                case.name,
                result.failure_messages.join(", ")
            );
        }
        result
    }
}
