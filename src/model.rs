//! Test case, step and result data model.

use crate::context::{TrackedVariable, VariableContext};
use crate::http::HttpResponse;
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// A complete test case: four ordered phases of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "deserialize_steps")]
    pub preconditions: Vec<Step>,
    #[serde(default, deserialize_with = "deserialize_steps")]
    pub setup: Vec<Step>,
    /// Mandatory, must contain at least one step.
    #[serde(deserialize_with = "deserialize_steps")]
    pub execution: Vec<Step>,
    #[serde(default, deserialize_with = "deserialize_steps")]
    pub cleanup: Vec<Step>,
    /// File the case was loaded from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl TestCase {
    /// Steps belonging to `phase`.
    pub fn steps(&self, phase: Phase) -> &[Step] {
        match phase {
            Phase::Preconditions => &self.preconditions,
            Phase::Setup => &self.setup,
            Phase::Execution => &self.execution,
            Phase::Cleanup => &self.cleanup,
        }
    }

    pub fn all_steps_mut(&mut self) -> impl Iterator<Item = &mut Step> {
        self.preconditions
            .iter_mut()
            .chain(self.setup.iter_mut())
            .chain(self.execution.iter_mut())
            .chain(self.cleanup.iter_mut())
    }

    /// Structural checks that serde alone cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("test case name must not be empty");
        }
        if self.execution.is_empty() {
            bail!(
                "test case '{}' has no steps in its mandatory 'execution' section",
                self.name
            );
        }
        Ok(())
    }
}

/// One request + verification unit within a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    /// Skip the step unless this evaluates to true.
    #[serde(default)]
    pub condition: Option<String>,
    pub request: RequestDefinition,
    #[serde(default)]
    pub verify: Option<VerificationDefinition>,
    /// Extra attempts after the first one.
    #[serde(default)]
    pub retries: u32,
    /// Pause between attempts, in milliseconds.
    #[serde(default)]
    pub retry_interval: u64,
    /// Informational only.
    #[serde(default)]
    pub service: Option<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, request: RequestDefinition) -> Self {
        Self {
            name: name.into(),
            condition: None,
            request,
            verify: None,
            retries: 0,
            retry_interval: 0,
            service: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_verify(mut self, verify: VerificationDefinition) -> Self {
        self.verify = Some(verify);
        self
    }

    pub fn with_retries(mut self, retries: u32, interval_ms: u64) -> Self {
        self.retries = retries;
        self.retry_interval = interval_ms;
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDefinition {
    #[serde(default)]
    pub method: HttpMethod,
    /// Absolute URL, or a path resolved against the base URL.
    #[serde(alias = "url")]
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Literal body, or `file:<path>` until the loader inlines it.
    #[serde(default, deserialize_with = "deserialize_payload")]
    pub payload: Option<String>,
    /// User id looked up in the user/auth configuration.
    #[serde(default)]
    pub user: Option<String>,
    /// Socket timeout override in milliseconds.
    #[serde(default, deserialize_with = "deserialize_millis")]
    pub timeout: Option<u64>,
    /// Connection timeout override in milliseconds.
    #[serde(default, deserialize_with = "deserialize_millis")]
    pub connection_timeout: Option<u64>,
    #[serde(default)]
    pub template_variables: Vec<TemplateVariable>,
}

impl RequestDefinition {
    pub fn new(method: HttpMethod, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
            payload: None,
            user: None,
            timeout: None,
            connection_timeout: None,
            template_variables: Vec::new(),
        }
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Only POST, PUT and PATCH carry a payload.
    pub fn allows_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(anyhow!("unsupported HTTP method: {other}")),
        }
    }
}

impl TryFrom<String> for HttpMethod {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// `{{name}}` substitution for request payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVariable {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub default_value: Option<String>,
}

impl TemplateVariable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            default_value: None,
        }
    }

    /// The literal value, or the fallback default when unset.
    pub fn effective_value(&self) -> Option<&str> {
        self.value.as_deref().or(self.default_value.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationDefinition {
    #[serde(default, alias = "status")]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub json_path_assertions: Vec<PathAssertion>,
    #[serde(default)]
    pub extractions: Vec<ExtractionRule>,
}

impl VerificationDefinition {
    pub fn status(code: u16) -> Self {
        Self {
            status_code: Some(code),
            ..Self::default()
        }
    }

    pub fn with_assertion(mut self, assertion: PathAssertion) -> Self {
        self.json_path_assertions.push(assertion);
        self
    }

    pub fn with_extraction(mut self, rule: ExtractionRule) -> Self {
        self.extractions.push(rule);
        self
    }
}

/// A comparison of the value found at `path` against `expected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathAssertion {
    pub path: String,
    #[serde(default, alias = "value")]
    pub expected: Value,
    /// Operator name, parsed when the assertion runs so that unknown
    /// names surface as assertion failures.
    #[serde(rename = "type", default = "default_assertion_type")]
    pub kind: String,
}

impl PathAssertion {
    pub fn new(
        path: impl Into<String>,
        kind: impl Into<String>,
        expected: Value,
    ) -> Self {
        Self {
            path: path.into(),
            expected,
            kind: kind.into(),
        }
    }

    pub fn equals(path: impl Into<String>, expected: Value) -> Self {
        Self::new(path, default_assertion_type(), expected)
    }
}

fn default_assertion_type() -> String {
    "equals".to_string()
}

/// Copies a value out of the response body into the variable context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRule {
    #[serde(alias = "jsonPath")]
    pub from: String,
    #[serde(alias = "variableName")]
    pub store_to: String,
    #[serde(default)]
    pub default_value: Option<Value>,
}

impl ExtractionRule {
    pub fn new(from: impl Into<String>, store_to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            store_to: store_to.into(),
            default_value: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default_value = Some(default);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Preconditions,
    Setup,
    Execution,
    Cleanup,
}

impl Phase {
    /// Execution order.
    pub const ALL: [Phase; 4] = [
        Phase::Preconditions,
        Phase::Setup,
        Phase::Execution,
        Phase::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preconditions => "preconditions",
            Phase::Setup => "setup",
            Phase::Execution => "execution",
            Phase::Cleanup => "cleanup",
        }
    }

    /// A failure in this phase aborts the remaining non-cleanup phases.
    pub fn aborts_on_failure(&self) -> bool {
        matches!(self, Phase::Preconditions | Phase::Setup)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Skipped,
    Failed,
}

/// Record of one step the runner reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedStep {
    pub phase: Phase,
    pub name: String,
    pub status: StepStatus,
    /// Requests sent, zero for skipped steps.
    pub attempts: u32,
    pub duration_ms: u64,
}

impl ExecutedStep {
    /// Annotated name used by reports.
    pub fn label(&self) -> String {
        match self.status {
            StepStatus::Skipped => {
                format!("{} (conditionally skipped)", self.name)
            }
            StepStatus::Passed if self.attempts > 1 => {
                let retries = self.attempts - 1;
                format!("{} (after {} {})", self.name, retries, retry_word(retries))
            }
            StepStatus::Passed => self.name.clone(),
            StepStatus::Failed => format!("{} (failed)", self.name),
        }
    }
}

pub(crate) fn retry_word(count: u32) -> &'static str {
    if count == 1 {
        "retry"
    } else {
        "retries"
    }
}

/// Outcome of running one test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub name: String,
    pub description: Option<String>,
    pub passed: bool,
    /// Failures from preconditions, setup and execution.
    pub failure_messages: Vec<String>,
    /// Cleanup problems; never affect `passed`.
    pub cleanup_warnings: Vec<String>,
    pub executed_steps: Vec<ExecutedStep>,
    /// Most recent response received by any step.
    pub last_response: Option<HttpResponse>,
    pub variables: BTreeMap<String, Value>,
    pub variable_tracking: BTreeMap<String, TrackedVariable>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl TestResult {
    pub fn start(case: &TestCase) -> Self {
        let now = Utc::now();
        Self {
            name: case.name.clone(),
            description: case.description.clone(),
            passed: true,
            failure_messages: Vec::new(),
            cleanup_warnings: Vec::new(),
            executed_steps: Vec::new(),
            last_response: None,
            variables: BTreeMap::new(),
            variable_tracking: BTreeMap::new(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        }
    }

    /// Result for a case that could not run at all.
    pub fn aborted(case: &TestCase, message: impl Into<String>) -> Self {
        let mut result = Self::start(case);
        result.failure_messages.push(message.into());
        result.passed = false;
        result
    }

    pub fn status_code(&self) -> Option<u16> {
        self.last_response.as_ref().map(|r| r.status)
    }

    /// Snapshot the context and settle the pass flag.
    pub fn finish(&mut self, ctx: &VariableContext, elapsed: Duration) {
        self.variables = ctx.get_all();
        self.variable_tracking = ctx.tracking();
        self.passed = self.failure_messages.is_empty();
        self.finished_at = Utc::now();
        self.duration_ms = elapsed.as_millis() as u64;
    }
}

// ── serde helpers ───────────────────────────────────

/// Accepts both `- step: {...}` entries and bare step mappings.
fn deserialize_steps<'de, D>(deserializer: D) -> Result<Vec<Step>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries: Option<Vec<serde_yaml::Value>> =
        Option::deserialize(deserializer)?;

    entries
        .unwrap_or_default()
        .into_iter()
        .map(|entry| {
            let body = match entry {
                serde_yaml::Value::Mapping(mut map)
                    if map.len() == 1 && map.contains_key("step") =>
                {
                    map.remove("step").unwrap_or(serde_yaml::Value::Null)
                }
                other => other,
            };
            serde_yaml::from_value::<Step>(body).map_err(D::Error::custom)
        })
        .collect()
}

/// Payloads may be written as a literal string or as structured YAML,
/// which is re-encoded as JSON.
fn deserialize_payload<'de, D>(
    deserializer: D,
) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<serde_yaml::Value> = Option::deserialize(deserializer)?;
    match raw {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(structured) => serde_json::to_string(&structured)
            .map(Some)
            .map_err(D::Error::custom),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Millis {
    Number(u64),
    Text(String),
}

/// Timeouts accept integers or numeric strings; anything else keeps
/// the default.
fn deserialize_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Millis> = Option::deserialize(deserializer)?;
    Ok(match raw {
        None => None,
        Some(Millis::Number(ms)) => Some(ms),
        Some(Millis::Text(text)) => match text.trim().parse::<u64>() {
            Ok(ms) => Some(ms),
            Err(_) => {
                warn!("Invalid timeout value '{text}', using default");
                None
            }
        },
    })
}
