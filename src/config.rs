//! Runner settings and loading of test case and user files.

use crate::auth::UserConfig;
use crate::model::TestCase;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

pub const DEFAULT_TEST_DIR: &str = "tests/testcases";
pub const DEFAULT_REPORT_DIR: &str = "target/reports";

/// Settings shared by every test case of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Base for relative endpoints.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub default_connection_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            default_timeout_ms: default_timeout_ms(),
            default_connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl RunnerConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn default_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.default_connection_timeout_ms)
    }

    /// Turn an endpoint into an absolute URL.
    ///
    /// Absolute endpoints are returned unchanged; anything else is joined
    /// onto the base URL, which is treated as a directory.
    pub fn resolve_url(&self, endpoint: &str) -> Result<String> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            bail!("request endpoint is empty");
        }
        if endpoint.contains("://") {
            Url::parse(endpoint)
                .with_context(|| format!("Invalid endpoint URL: {endpoint}"))?;
            return Ok(endpoint.to_string());
        }

        let Some(base_url) = &self.base_url else {
            bail!("relative endpoint '{endpoint}' requires a base URL");
        };
        let mut base = Url::parse(base_url)
            .with_context(|| format!("Invalid base URL: {base_url}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let joined = base
            .join(endpoint.trim_start_matches('/'))
            .with_context(|| {
                format!("Failed to join base URL '{base_url}' with '{endpoint}'")
            })?;
        Ok(joined.to_string())
    }
}

/// Locates and loads test case files.
#[derive(Debug)]
pub struct TestConfigManager {
    /// Files or directories to load from.
    pub test_paths: Vec<PathBuf>,
}

impl TestConfigManager {
    pub fn new() -> Self {
        Self {
            test_paths: vec![PathBuf::from(DEFAULT_TEST_DIR)],
        }
    }

    pub fn with_paths(test_paths: Vec<PathBuf>) -> Self {
        Self { test_paths }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.test_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single test case file. Payload file references resolve
    /// against the file's directory.
    pub fn load_test_case<P: AsRef<Path>>(&self, path: P) -> Result<TestCase> {
        let path = path.as_ref();
        info!("Loading test case from {}", path.display());

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read test file: {}", path.display()))?;
        let mut case = parse_test_case(&content, path.parent())
            .with_context(|| format!("Failed to load test case from {}", path.display()))?;
        case.source = Some(path.to_path_buf());

        debug!("Successfully loaded test case: {}", case.name);
        Ok(case)
    }

    /// Load every `.yaml`/`.yml` file below `dir`, in path order. Files
    /// that fail to load are reported and left out.
    pub fn load_test_cases_from_dir<P: AsRef<Path>>(
        &self,
        dir: P,
    ) -> Result<Vec<TestCase>> {
        let dir = dir.as_ref();
        info!("Loading test cases from directory: {}", dir.display());

        let mut files = Vec::new();
        collect_test_files(dir, &mut files)?;
        files.sort();

        let mut cases = Vec::new();
        for path in files {
            match self.load_test_case(&path) {
                Ok(case) => cases.push(case),
                Err(err) => error!("Skipping {}: {:#}", path.display(), err),
            }
        }

        info!("Loaded {} test cases from {}", cases.len(), dir.display());
        Ok(cases)
    }

    /// Load from every configured path.
    pub fn load_all(&self) -> Result<Vec<TestCase>> {
        let mut all = Vec::new();

        for path in &self.test_paths {
            if path.is_dir() {
                all.extend(self.load_test_cases_from_dir(path)?);
            } else if path.is_file() {
                match self.load_test_case(path) {
                    Ok(case) => all.push(case),
                    Err(err) => error!("Skipping {}: {:#}", path.display(), err),
                }
            } else {
                warn!("Test path {} does not exist", path.display());
            }
        }

        info!("Loaded {} test cases in total", all.len());
        Ok(all)
    }
}

impl Default for TestConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_test_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            collect_test_files(&path, out)?;
        } else if is_test_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_test_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

/// Parse a test case document.
///
/// The document may be wrapped in a top-level `test:` key.
/// `payload: file:<path>` references are inlined, resolving against
/// `base_dir` first and the working directory second.
pub fn parse_test_case(yaml: &str, base_dir: Option<&Path>) -> Result<TestCase> {
    let document: serde_yaml::Value =
        serde_yaml::from_str(yaml).context("Failed to parse YAML")?;
    let document = match document {
        serde_yaml::Value::Mapping(mut root)
            if root.len() == 1 && root.contains_key("test") =>
        {
            root.remove("test").unwrap_or(serde_yaml::Value::Null)
        }
        other => other,
    };

    let mut case: TestCase =
        serde_yaml::from_value(document).context("Invalid test case document")?;

    for step in case.all_steps_mut() {
        let reference = step
            .request
            .payload
            .as_deref()
            .and_then(|p| p.trim().strip_prefix("file:"))
            .map(|r| r.trim().to_string());
        if let Some(reference) = reference {
            let content = load_payload_file(&reference, base_dir).with_context(|| {
                format!("Invalid payload for step '{}'", step.name)
            })?;
            step.request.payload = Some(content);
        }
    }

    case.validate()?;
    Ok(case)
}

fn load_payload_file(reference: &str, base_dir: Option<&Path>) -> Result<String> {
    let candidates: Vec<PathBuf> = base_dir
        .map(|dir| dir.join(reference))
        .into_iter()
        .chain(std::iter::once(PathBuf::from(reference)))
        .collect();

    let Some(path) = candidates.iter().find(|p| p.is_file()) else {
        bail!("payload file '{reference}' not found");
    };
    debug!("Loading payload from {}", path.display());

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read payload file: {}", path.display()))?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        bail!("payload file '{}' is empty", path.display());
    }
    let bracketed = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
    if !bracketed {
        bail!(
            "payload file '{}' does not contain a JSON object or array",
            path.display()
        );
    }
    Ok(content)
}

/// Load the users file. A missing file means no users.
pub fn load_user_configs<P: AsRef<Path>>(path: P) -> Result<HashMap<String, UserConfig>> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(
            "User config file {} not found, requests will be sent without auth",
            path.display()
        );
        return Ok(HashMap::new());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read user config: {}", path.display()))?;
    let users: Option<HashMap<String, UserConfig>> = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse user config: {}", path.display()))?;
    let users = users.unwrap_or_default();
    info!("Loaded {} user configurations", users.len());
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "name: minimal\nexecution:\n  - name: s\n    request:\n      endpoint: /t\n";

    // ── resolve_url ─────────────────────────────────────

    #[test]
    fn test_resolve_url() {
        let config = RunnerConfig::default().with_base_url("http://api.local:8080");
        assert_eq!(
            config.resolve_url("/users/1").unwrap(),
            "http://api.local:8080/users/1"
        );
        assert_eq!(
            config.resolve_url("users?active=true").unwrap(),
            "http://api.local:8080/users?active=true"
        );
        assert_eq!(
            config.resolve_url("https://other.host/x").unwrap(),
            "https://other.host/x"
        );

        let nested = RunnerConfig::default().with_base_url("http://api.local/v2");
        assert_eq!(nested.resolve_url("/items").unwrap(), "http://api.local/v2/items");
    }

    #[test]
    fn test_resolve_url_errors() {
        assert!(RunnerConfig::default().resolve_url("/users").is_err());
        assert!(RunnerConfig::default().resolve_url("  ").is_err());
        let bad_base = RunnerConfig::default().with_base_url("not a url");
        assert!(bad_base.resolve_url("/x").is_err());
    }

    // ── parse_test_case ─────────────────────────────────

    #[test]
    fn test_parse_wrapped_document() {
        let yaml = r#"
test:
  name: wrapped
  execution:
    - step:
        name: read
        request:
          method: GET
          url: /items
        verify:
          statusCode: 200
"#;
        let case = parse_test_case(yaml, None).unwrap();
        assert_eq!(case.name, "wrapped");
        assert_eq!(case.execution[0].name, "read");
    }

    #[test]
    fn test_missing_execution_is_rejected() {
        assert!(parse_test_case("name: x\nsetup: []\n", None).is_err());
        assert!(parse_test_case("name: x\nexecution: []\n", None).is_err());
        assert!(parse_test_case(MINIMAL, None).is_ok());
    }

    #[test]
    fn test_payload_file_is_inlined() {
        let dir = tempdir_with_files(&[("body.json", "{\"name\": \"${user}\"}\n")]);
        let yaml = "name: p\nexecution:\n  - name: s\n    request:\n      method: POST\n      endpoint: /t\n      payload: 'file: body.json'\n";

        let case = parse_test_case(yaml, Some(dir.path())).unwrap();
        assert_eq!(
            case.execution[0].request.payload.as_deref(),
            Some("{\"name\": \"${user}\"}\n")
        );
    }

    #[test]
    fn test_bad_payload_files_are_rejected() {
        let dir = tempdir_with_files(&[("empty.json", "  \n"), ("text.json", "hello")]);
        for file in ["empty.json", "text.json", "absent.json"] {
            let yaml = format!(
                "name: p\nexecution:\n  - name: s\n    request:\n      method: POST\n      endpoint: /t\n      payload: file:{file}\n"
            );
            assert!(
                parse_test_case(&yaml, Some(dir.path())).is_err(),
                "{file} should be rejected"
            );
        }
    }

    // ── directory loading ───────────────────────────────

    #[test]
    fn test_load_from_dir_skips_broken_files() {
        let first = MINIMAL.replace("minimal", "first");
        let dir = tempdir_with_files(&[
            ("b.yaml", MINIMAL),
            ("a.yml", first.as_str()),
            ("broken.yaml", "name: broken\n"),
            ("notes.txt", "ignored"),
        ]);
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(
            dir.path().join("nested/c.yaml"),
            MINIMAL.replace("minimal", "nested"),
        )
        .unwrap();

        let mgr = TestConfigManager::new();
        let cases = mgr.load_test_cases_from_dir(dir.path()).unwrap();
        let names: Vec<&str> = cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["first", "minimal", "nested"]);
        assert!(cases[0].source.as_ref().unwrap().ends_with("a.yml"));
    }

    #[test]
    fn test_load_all_accepts_files_and_dirs() {
        let dir = tempdir_with_files(&[("one.yaml", MINIMAL)]);
        let mut mgr = TestConfigManager::with_paths(vec![dir.path().join("one.yaml")]);
        mgr.add_path(dir.path()).add_path(dir.path().join("missing"));
        assert_eq!(mgr.load_all().unwrap().len(), 2);
    }

    // ── users ───────────────────────────────────────────

    #[test]
    fn test_user_configs() {
        let dir = tempdir_with_files(&[(
            "users.yaml",
            "admin:\n  authType: bearer\n  token: t0k\n",
        )]);
        let users = load_user_configs(dir.path().join("users.yaml")).unwrap();
        assert_eq!(users["admin"].token.as_deref(), Some("t0k"));
        assert!(load_user_configs(dir.path().join("nope.yaml")).unwrap().is_empty());
    }

    // ── helper ──────────────────────────────────────────

    fn tempdir_with_files(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }
}
