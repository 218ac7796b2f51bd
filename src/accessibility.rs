use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use log::{debug, info};
use serde::Deserialize;
use serde_json::{self as json, json};
use tokio::time::sleep;
use url::Url;

use crate::browser::page::{PageDriver, PageSource, evaluate_as};
use crate::config::{A11yRules, ProjectConfig, Timeouts};

pub const WCAG_TAGS: &[&str] = &["wcag2a", "wcag2aa", "wcag21a", "wcag21aa"];
pub const AXE_SCRIPT_ENV: &str = "UX_TEST_AXE_SCRIPT";
const AUDIT_VIEWPORT: (u32, u32) = (1024, 720);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Minor,
    Moderate,
    Serious,
    Critical,
}

impl std::fmt::Display for Impact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Impact::Minor => "minor",
            Impact::Moderate => "moderate",
            Impact::Serious => "serious",
            Impact::Critical => "critical",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Violation {
    #[serde(rename = "id")]
    pub rule_id: String,
    #[serde(default)]
    pub impact: Option<Impact>,
    #[serde(rename = "help")]
    pub description: String,
    #[serde(rename = "helpUrl", default)]
    pub help_url: String,
    #[serde(rename = "nodes")]
    pub affected_nodes: usize,
    #[serde(rename = "target", default)]
    pub first_target: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccessibilityResult {
    pub route: String,
    pub passed: bool,
    pub duration_ms: u64,
    pub violations: Vec<Violation>,
    pub violation_count: usize,
    pub affected_node_count: usize,
    pub error: Option<String>,
}

impl AccessibilityResult {
    pub fn from_violations(
        route: &str,
        duration_ms: u64,
        violations: Vec<Violation>,
    ) -> Self {
        AccessibilityResult {
            route: route.to_string(),
            passed: violations.is_empty(),
            duration_ms,
            violation_count: violations.len(),
            affected_node_count: violations.iter().map(|v| v.affected_nodes).sum(),
            violations,
            error: None,
        }
    }

    pub fn errored(route: &str, duration_ms: u64, error: String) -> Self {
        AccessibilityResult {
            route: route.to_string(),
            passed: false,
            duration_ms,
            violations: vec![],
            violation_count: 0,
            affected_node_count: 0,
            error: Some(error),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuditRequest {
    pub tags: Vec<String>,
    pub disable: Vec<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl AuditRequest {
    pub fn new(rules: Option<&A11yRules>) -> Self {
        let rules = rules.cloned().unwrap_or_default();
        AuditRequest {
            tags: WCAG_TAGS.iter().map(|tag| tag.to_string()).collect(),
            disable: rules.disable,
            include: rules.include,
            exclude: rules.exclude,
        }
    }
}

/// Runs a rule audit against whatever the page currently shows.
#[allow(async_fn_in_trait)]
pub trait Auditor {
    async fn audit<P: PageDriver>(
        &self,
        page: &P,
        request: &AuditRequest,
    ) -> Result<Vec<Violation>>;
}

const INJECT_AXE: &str = "(source) => {
  if (!window.axe) {
    (0, eval)(source);
  }
  return typeof window.axe !== 'undefined';
}";

const RUN_AXE: &str = "async (include, exclude, options) => {
  const context = include.length || exclude.length
    ? { ...(include.length ? { include } : {}), exclude }
    : document;
  const results = await window.axe.run(context, options);
  return results.violations.map((v) => ({
    id: v.id,
    impact: v.impact ?? null,
    help: v.help,
    helpUrl: v.helpUrl,
    nodes: v.nodes.length,
    target: v.nodes[0]?.target?.[0] != null ? String(v.nodes[0].target[0]) : null,
  }));
}";

/// Audits with an axe-core bundle injected into the page.
pub struct AxeAuditor {
    script: String,
}

impl AxeAuditor {
    pub fn new(script: String) -> Self {
        AxeAuditor { script }
    }

    /// Finds the bundle via `axeScript`, then `$UX_TEST_AXE_SCRIPT`, then
    /// the project's `node_modules`.
    pub fn locate(config: &ProjectConfig) -> Result<Self> {
        let path = axe_script_path(
            &config.dir,
            config.axe_script.as_deref(),
            std::env::var_os(AXE_SCRIPT_ENV).map(PathBuf::from),
        )?;
        let script = std::fs::read_to_string(&path)
            .with_context(|| format!("read axe-core bundle {}", path.display()))?;
        debug!("loaded axe-core from {}", path.display());
        Ok(AxeAuditor::new(script))
    }
}

fn axe_script_path(
    project_dir: &Path,
    configured: Option<&Path>,
    from_env: Option<PathBuf>,
) -> Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(project_dir.join(path));
    }
    if let Some(path) = from_env {
        return Ok(path);
    }
    let bundled = project_dir.join("node_modules/axe-core/axe.min.js");
    if bundled.is_file() {
        return Ok(bundled);
    }
    bail!(
        "axe-core not found: set \"axeScript\" in .ux-test.json, set {}, or install axe-core in {}",
        AXE_SCRIPT_ENV,
        project_dir.display()
    )
}

pub fn axe_options(request: &AuditRequest) -> json::Value {
    let rules: json::Map<String, json::Value> = request
        .disable
        .iter()
        .map(|rule| (rule.clone(), json!({ "enabled": false })))
        .collect();
    json!({
        "runOnly": { "type": "tag", "values": request.tags },
        "rules": rules,
    })
}

impl Auditor for AxeAuditor {
    async fn audit<P: PageDriver>(
        &self,
        page: &P,
        request: &AuditRequest,
    ) -> Result<Vec<Violation>> {
        let loaded: bool =
            evaluate_as(page, INJECT_AXE, vec![json!(self.script)]).await?;
        if !loaded {
            bail!("axe-core did not load");
        }
        let violations = evaluate_as(
            page,
            RUN_AXE,
            vec![
                json!(request.include),
                json!(request.exclude),
                axe_options(request),
            ],
        )
        .await?;
        Ok(violations)
    }
}

pub struct AuditContext<'a> {
    pub origin: &'a Url,
    pub timeouts: &'a Timeouts,
    pub request: &'a AuditRequest,
}

/// Audits each route on a page of its own.
pub async fn run_audits<S: PageSource, A: Auditor>(
    source: &S,
    auditor: &A,
    routes: &[String],
    context: &AuditContext<'_>,
) -> Vec<AccessibilityResult> {
    let mut results = Vec::with_capacity(routes.len());
    for route in routes {
        let started = Instant::now();
        let outcome = match source.open_page().await {
            Ok(page) => {
                let outcome = audit_route(&page, auditor, route, context).await;
                if let Err(error) = page.close().await {
                    debug!("closing audit page for {}: {}", route, error);
                }
                outcome
            }
            Err(error) => Err(error.into()),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(violations) => {
                AccessibilityResult::from_violations(route, duration_ms, violations)
            }
            Err(error) => {
                AccessibilityResult::errored(route, duration_ms, format!("{:#}", error))
            }
        };
        info!(
            "{}: {} accessibility violations",
            route, result.violation_count
        );
        results.push(result);
    }
    results
}

async fn audit_route<P: PageDriver, A: Auditor>(
    page: &P,
    auditor: &A,
    route: &str,
    context: &AuditContext<'_>,
) -> Result<Vec<Violation>> {
    let timeouts = context.timeouts;
    let (width, height) = AUDIT_VIEWPORT;
    page.set_viewport(width, height).await?;
    let url = context.origin.join(route)?;
    page.goto(&url, timeouts.navigation()).await?;
    if let Err(error) = page.wait_for_network_idle(timeouts.network_idle()).await
    {
        debug!("{}: network did not go idle: {}", route, error);
    }
    sleep(timeouts.breakpoint_settle()).await;
    auditor.audit(page, context.request).await
}
