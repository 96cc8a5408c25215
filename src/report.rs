//! Text, HTML and JSON run reports.

use crate::model::TestResult;
use crate::value::to_string_form;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use handlebars::Handlebars;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const REPORT_PREFIX: &str = "stepwise_report";

/// Pass/fail totals for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Whole percent, rounded down.
    pub success_rate: usize,
}

impl Summary {
    pub fn from_results(results: &[TestResult]) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        Self {
            total,
            passed,
            failed: total - passed,
            success_rate: if total > 0 { passed * 100 / total } else { 0 },
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportFormat {
    Text,
    Html,
    Json,
}

impl ReportFormat {
    pub const ALL: [ReportFormat; 3] = [ReportFormat::Text, ReportFormat::Html, ReportFormat::Json];

    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Text => "txt",
            ReportFormat::Html => "html",
            ReportFormat::Json => "json",
        }
    }
}

/// Consumes the results of a run.
pub trait ReportSink {
    /// Persist `results`, returning the files written.
    fn publish(&self, results: &[TestResult]) -> Result<Vec<PathBuf>>;
}

/// Writes timestamped report files into a directory.
#[derive(Debug, Clone)]
pub struct ReportGenerator {
    output_dir: PathBuf,
    formats: Vec<ReportFormat>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonReport<'a> {
    generated_at: String,
    summary: Summary,
    results: &'a [TestResult],
}

impl ReportGenerator {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            formats: ReportFormat::ALL.to_vec(),
        }
    }

    pub fn with_formats(mut self, formats: &[ReportFormat]) -> Self {
        self.formats = formats.to_vec();
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn render(
        &self,
        format: ReportFormat,
        results: &[TestResult],
        generated_at: DateTime<Local>,
    ) -> Result<String> {
        Ok(match format {
            ReportFormat::Text => render_text(results, generated_at),
            ReportFormat::Html => render_html(results, generated_at)?,
            ReportFormat::Json => serde_json::to_string_pretty(&JsonReport {
                generated_at: generated_at.to_rfc3339(),
                summary: Summary::from_results(results),
                results,
            })?,
        })
    }

    /// Write one report file and return its path.
    pub fn write(&self, format: ReportFormat, results: &[TestResult]) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir).with_context(|| {
            format!(
                "Failed to create report directory: {}",
                self.output_dir.display()
            )
        })?;

        let now = Local::now();
        let file_name = format!(
            "{}_{}.{}",
            REPORT_PREFIX,
            now.format("%Y-%m-%d_%H-%M-%S"),
            format.extension()
        );
        let path = self.output_dir.join(file_name);
        let content = self.render(format, results, now)?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;

        info!("Report generated: {}", path.display());
        Ok(path)
    }
}

impl ReportSink for ReportGenerator {
    fn publish(&self, results: &[TestResult]) -> Result<Vec<PathBuf>> {
        self.formats
            .iter()
            .map(|format| self.write(*format, results))
            .collect()
    }
}

fn status_word(passed: bool) -> &'static str {
    if passed {
        "PASSED"
    } else {
        "FAILED"
    }
}

fn response_status(result: &TestResult) -> String {
    result
        .status_code()
        .map(|code| code.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Plain-text report.
pub fn render_text(results: &[TestResult], generated_at: DateTime<Local>) -> String {
    let summary = Summary::from_results(results);
    let mut out = String::new();

    // writing into a String cannot fail
    let _ = writeln!(out, "Stepwise Test Execution Report");
    let _ = writeln!(out, "==============================");
    let _ = writeln!(out, "Generated at: {}\n", generated_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Summary:");
    let _ = writeln!(out, "  Total Tests: {}", summary.total);
    let _ = writeln!(out, "  Passed: {}", summary.passed);
    let _ = writeln!(out, "  Failed: {}", summary.failed);
    let _ = writeln!(out, "  Success Rate: {}%\n", summary.success_rate);
    let _ = writeln!(out, "Detailed Results:");
    let _ = writeln!(out, "================\n");

    for (i, result) in results.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, result.name);
        let _ = writeln!(out, "   Status: {}", status_word(result.passed));
        if let Some(description) = &result.description {
            let _ = writeln!(out, "   Description: {description}");
        }
        let _ = writeln!(out, "   Duration: {} ms", result.duration_ms);

        let _ = writeln!(out, "   Executed Steps: {}", result.executed_steps.len());
        if !result.executed_steps.is_empty() {
            let _ = writeln!(out, "     Steps:");
            for step in &result.executed_steps {
                let _ = writeln!(out, "       - [{}] {}", step.phase, step.label());
            }
        }

        if !result.variables.is_empty() {
            let _ = writeln!(out, "   Variable Flow:");
            for (name, value) in &result.variables {
                match result.variable_tracking.get(name) {
                    Some(tracked) => {
                        let _ = writeln!(
                            out,
                            "     - {}: {} (from step '{}', path '{}')",
                            name,
                            to_string_form(value),
                            tracked.source_step,
                            tracked.path
                        );
                    }
                    None => {
                        let _ = writeln!(out, "     - {}: {}", name, to_string_form(value));
                    }
                }
            }
        }

        let _ = writeln!(out, "   Response Status: {}", response_status(result));

        if !result.failure_messages.is_empty() {
            let _ = writeln!(out, "   Failure Reasons:");
            for failure in &result.failure_messages {
                let _ = writeln!(out, "     - {failure}");
            }
        }
        if !result.cleanup_warnings.is_empty() {
            let _ = writeln!(out, "   Cleanup Warnings:");
            for warning in &result.cleanup_warnings {
                let _ = writeln!(out, "     - {warning}");
            }
        }
        out.push('\n');
    }

    out
}

const HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang='en'>
<head>
  <meta charset='UTF-8'>
  <title>Stepwise Test Report</title>
  <style>
    body { font-family: Arial, sans-serif; margin: 0; padding: 20px; color: #333; }
    h1, h2 { color: #2c3e50; }
    .summary { background-color: #f8f9fa; padding: 15px; border-radius: 5px; margin-bottom: 20px; }
    .test-case { border: 1px solid #ddd; border-radius: 5px; padding: 15px; margin-bottom: 15px; }
    .test-case.passed { border-left: 5px solid #28a745; }
    .test-case.failed { border-left: 5px solid #dc3545; }
    .status.passed { color: #28a745; font-weight: bold; }
    .status.failed { color: #dc3545; font-weight: bold; }
    .steps, .variables, .failures, .warnings { padding: 10px; border-radius: 5px; margin-top: 10px; }
    .steps { background-color: #e9ecef; }
    .variables { background-color: #d1ecf1; color: #0c5460; }
    .failures { background-color: #f8d7da; }
    .warnings { background-color: #fff3cd; }
    .progress { height: 20px; border-radius: 5px; overflow: hidden; background-color: #e9ecef; }
    .progress > div { height: 100%; background-color: #28a745; }
    td, th { text-align: left; padding: 5px; }
  </style>
</head>
<body>
  <h1>Stepwise Test Execution Report</h1>
  <p>Generated at: {{generatedAt}}</p>
  <div class='summary'>
    <h2>Summary</h2>
    <p><strong>Total Tests:</strong> {{summary.total}}</p>
    <p><strong>Passed:</strong> {{summary.passed}}</p>
    <p><strong>Failed:</strong> {{summary.failed}}</p>
    <p><strong>Success Rate:</strong> {{summary.successRate}}%</p>
    <div class='progress'><div style='width: {{summary.successRate}}%'></div></div>
  </div>
  <h2>Detailed Results</h2>
{{#each results}}
  <div class='test-case {{class}}'>
    <h3>{{index}}. {{name}}</h3>
    <p><span class='status {{class}}'>{{status}}</span> ({{durationMs}} ms)</p>
    {{#if description}}
    <p><strong>Description:</strong> {{description}}</p>
    {{/if}}
    <div class='steps'>
      <p><strong>Executed Steps ({{len steps}}):</strong></p>
      {{#if steps}}
      <ol>
        {{#each steps}}
        <li>[{{phase}}] {{label}}</li>
        {{/each}}
      </ol>
      {{else}}
      <p>No steps were executed.</p>
      {{/if}}
    </div>
    {{#if variables}}
    <div class='variables'>
      <p><strong>Variable Flow:</strong></p>
      <table>
        <tr><th>Variable</th><th>Value</th><th>Source</th></tr>
        {{#each variables}}
        <tr><td><strong>{{name}}</strong></td><td>{{value}}</td><td>{{source}}</td></tr>
        {{/each}}
      </table>
    </div>
    {{/if}}
    <p><strong>Response Status:</strong> {{responseStatus}}</p>
    {{#if failures}}
    <div class='failures'>
      <p><strong>Failure Reasons:</strong></p>
      <ul>
        {{#each failures}}
        <li>{{this}}</li>
        {{/each}}
      </ul>
    </div>
    {{/if}}
    {{#if warnings}}
    <div class='warnings'>
      <p><strong>Cleanup Warnings:</strong></p>
      <ul>
        {{#each warnings}}
        <li>{{this}}</li>
        {{/each}}
      </ul>
    </div>
    {{/if}}
  </div>
{{/each}}
</body>
</html>
"#;

fn html_data(results: &[TestResult], generated_at: DateTime<Local>) -> Value {
    let entries: Vec<Value> = results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let steps: Vec<Value> = result
                .executed_steps
                .iter()
                .map(|step| json!({"phase": step.phase.to_string(), "label": step.label()}))
                .collect();
            let variables: Vec<Value> = result
                .variables
                .iter()
                .map(|(name, value)| {
                    let source = result
                        .variable_tracking
                        .get(name)
                        .map(|t| format!("{} ({})", t.source_step, t.path))
                        .unwrap_or_default();
                    json!({"name": name, "value": to_string_form(value), "source": source})
                })
                .collect();

            json!({
                "index": i + 1,
                "name": result.name,
                "description": result.description,
                "status": status_word(result.passed),
                "class": if result.passed { "passed" } else { "failed" },
                "durationMs": result.duration_ms,
                "steps": steps,
                "variables": variables,
                "responseStatus": response_status(result),
                "failures": result.failure_messages,
                "warnings": result.cleanup_warnings,
            })
        })
        .collect();

    json!({
        "generatedAt": generated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        "summary": Summary::from_results(results),
        "results": entries,
    })
}

/// Standalone HTML report rendered with the default handlebars escaping.
pub fn render_html(results: &[TestResult], generated_at: DateTime<Local>) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars
        .register_template_string("report", HTML_TEMPLATE)
        .map_err(|e| anyhow!("Invalid HTML report template: {e}"))?;
    handlebars
        .render("report", &html_data(results, generated_at))
        .map_err(|e| anyhow!("Failed to render HTML report: {e}"))
}
