use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{error, info, warn};
use url::Url;

use crate::accessibility::{
    AccessibilityResult, AuditContext, AuditRequest, Auditor, AxeAuditor,
    run_audits,
};
use crate::browser::page::{PageDriver, PageSource};
use crate::browser::{Browser, BrowserOptions};
use crate::config::{
    ProjectConfig, config_exists, load_config, load_global_config,
    should_skip_route,
};
use crate::discover::discover_routes;
use crate::flow::step::Flow;
use crate::flow::{FlowContext, FlowResult, run_flows};
use crate::identity::{Identity, IdentityProvider, SupabaseAdmin};
use crate::report::{
    RunReport, write_a11y_results, write_flow_results, write_header,
    write_smoke_results,
};
use crate::server::{ServerOptions, ensure};
use crate::smoke::{RouteResult, SmokeContext, run_routes};
use crate::visual::{VisualEngine, VisualOptions};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    #[default]
    All,
    Smoke,
    A11y,
    Flows,
}

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub target: Option<PathBuf>,
    pub all: bool,
    pub scan_dirs: Vec<PathBuf>,
    pub mode: Mode,
    pub flow: Option<String>,
    pub headed: bool,
    pub no_a11y: bool,
    pub no_visual: bool,
    pub update_baselines: bool,
    pub no_sandbox: bool,
}

/// Runs one project, or every project under the scan directories with
/// `--all`. Returns whether everything passed.
pub async fn run(options: &RunOptions) -> Result<bool> {
    if options.all {
        return run_all(options).await;
    }
    let dir = std::path::absolute(
        options.target.clone().unwrap_or_else(|| PathBuf::from(".")),
    )?;
    Ok(run_project(&dir, options).await)
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Immediate sub-directories of `scan_dirs` that carry a project config.
pub fn find_projects(scan_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut projects = vec![];
    for parent in scan_dirs {
        let Ok(entries) = std::fs::read_dir(parent) else {
            warn!("cannot read scan directory {}", parent.display());
            continue;
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir() && config_exists(path))
            .collect();
        dirs.sort();
        projects.extend(dirs);
    }
    projects
}

async fn run_all(options: &RunOptions) -> Result<bool> {
    let mut scan_dirs = options.scan_dirs.clone();
    if scan_dirs.is_empty() {
        scan_dirs = load_global_config()
            .map(|config| config.scan_dirs)
            .unwrap_or_default();
    }
    if scan_dirs.is_empty() {
        scan_dirs.push(std::env::current_dir()?);
    }
    let scan_dirs: Vec<PathBuf> =
        scan_dirs.iter().map(|dir| expand_home(dir)).collect();

    let projects = find_projects(&scan_dirs);
    if projects.is_empty() {
        println!("⚠️  No projects with .ux-test.json found");
        return Ok(true);
    }
    println!("\n🔍 Found {} projects with UX test configs", projects.len());

    let mut all_passed = true;
    for dir in &projects {
        if !run_project(dir, options).await {
            all_passed = false;
        }
    }
    Ok(all_passed)
}

/// Configured routes, or discovered ones, split into those to test and
/// those matched by `skipRoutes`.
pub fn resolve_routes(config: &ProjectConfig) -> (Vec<String>, Vec<String>) {
    let routes = config
        .routes
        .clone()
        .unwrap_or_else(|| discover_routes(config));
    routes
        .into_iter()
        .partition(|route| !should_skip_route(route, &config.skip_routes))
}

fn run_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string()
}

/// Loads, runs and reports one project. Failures are printed, never
/// propagated, so sibling projects still run.
pub async fn run_project(dir: &Path, options: &RunOptions) -> bool {
    let config = match load_config(dir) {
        Ok(Some(config)) => config,
        Ok(None) => {
            println!("⚠️  No .ux-test.json found in {}", dir.display());
            return false;
        }
        Err(error) => {
            println!("❌ Config: {}", error);
            return false;
        }
    };
    match run_configured_project(&config, options).await {
        Ok(passed) => passed,
        Err(error) => {
            error!("{}: {:#}", config.name(), error);
            println!("❌ {:#}", error);
            false
        }
    }
}

async fn run_configured_project(
    config: &ProjectConfig,
    options: &RunOptions,
) -> Result<bool> {
    let origin = Url::parse(&config.origin())?;
    let (routes, skipped) = resolve_routes(config);
    if !skipped.is_empty() {
        info!("skipping {} routes: {}", skipped.len(), skipped.join(", "));
    }
    let screenshots_dir = config.dir.join("screenshots");
    let run_dir = screenshots_dir.join("runs").join(run_timestamp());

    write_header(&mut std::io::stdout(), &config.name(), config.port)?;

    let mut server = match ensure(&ServerOptions::for_project(config, &origin)).await
    {
        Ok(server) => server,
        Err(error) => {
            println!("❌ Server: {}", error);
            return Ok(false);
        }
    };
    if server.started() {
        println!(
            "🚀 Started dev server ({})",
            config.start_command.as_deref().unwrap_or_default()
        );
    }

    let visual = VisualEngine::new(VisualOptions {
        enabled: config.visual && !options.no_visual,
        update_baselines: options.update_baselines,
        threshold: config.visual_threshold,
        baselines_dir: screenshots_dir.join("baselines"),
        diffs_dir: run_dir.join("diffs"),
    });
    let project = ProjectRun {
        config,
        origin: &origin,
        routes: &routes,
        run_dir: &run_dir,
        visual,
    };
    let outcome = run_in_browser(&project, options).await;
    server.stop().await;
    let results = outcome?;

    let report = RunReport {
        smoke: &results.smoke,
        a11y: &results.a11y,
        flows: &results.flows,
        output_dir: Some(&run_dir),
    };
    let mut out = std::io::stdout().lock();
    if !results.smoke.is_empty() {
        write_smoke_results(&mut out, &results.smoke)?;
    }
    write_a11y_results(&mut out, &results.a11y)?;
    write_flow_results(&mut out, &results.flows)?;
    report.write_summary(&mut out)?;
    out.flush()?;
    Ok(report.all_passed())
}

async fn run_in_browser(
    project: &ProjectRun<'_>,
    options: &RunOptions,
) -> Result<PhaseResults> {
    let config = project.config;
    let browser = Browser::launch(&BrowserOptions {
        headless: !options.headed,
        no_sandbox: options.no_sandbox,
        width: 1024,
        height: config.viewport_height,
    })
    .await?;
    let plan = PhasePlan::new(config, options);
    let auditor =
        AxeAuditor::locate(config).map_err(|error| format!("{:#}", error));
    let identity = identity_for(config, project.origin);
    let results = run_phases(
        &browser,
        project,
        &plan,
        auditor.as_ref().map_err(String::as_str),
        identity.as_ref(),
    )
    .await;
    browser.terminate().await;
    results
}

fn identity_for(
    config: &ProjectConfig,
    origin: &Url,
) -> Option<Identity<SupabaseAdmin>> {
    let identity = config.identity.clone()?;
    match SupabaseAdmin::new(&identity) {
        Ok(admin) => Some(Identity::new(
            admin,
            identity,
            origin.clone(),
            config.timeouts.navigation(),
        )),
        Err(error) => {
            warn!("identity steps disabled: {:#}", error);
            None
        }
    }
}

/// Which phases run, derived from the mode and the project config.
#[derive(Debug, PartialEq)]
pub struct PhasePlan<'a> {
    pub smoke: bool,
    pub a11y: bool,
    pub flows: Vec<&'a Flow>,
}

impl<'a> PhasePlan<'a> {
    pub fn new(config: &'a ProjectConfig, options: &RunOptions) -> Self {
        let mode = options.mode;
        let mut flows: Vec<&Flow> = if matches!(mode, Mode::All | Mode::Flows) {
            config.flows.iter().collect()
        } else {
            vec![]
        };
        if let Some(name) = &options.flow {
            flows.retain(|flow| &flow.name == name);
            if flows.is_empty() {
                warn!("no flow named \"{}\" in {}", name, config.name());
            }
        }
        PhasePlan {
            smoke: matches!(mode, Mode::All | Mode::Smoke),
            a11y: matches!(mode, Mode::All | Mode::A11y)
                && !options.no_a11y
                && config.a11y,
            flows,
        }
    }
}

/// The per-project inputs shared by every phase.
pub struct ProjectRun<'a> {
    pub config: &'a ProjectConfig,
    pub origin: &'a Url,
    pub routes: &'a [String],
    pub run_dir: &'a Path,
    pub visual: VisualEngine,
}

#[derive(Debug, Default)]
pub struct PhaseResults {
    pub smoke: Vec<RouteResult>,
    pub a11y: Vec<AccessibilityResult>,
    pub flows: Vec<FlowResult>,
}

/// Smoke, then accessibility, then flows. Smoke and flows share one page;
/// each audit gets its own.
pub async fn run_phases<S: PageSource, A: Auditor, I: IdentityProvider>(
    source: &S,
    project: &ProjectRun<'_>,
    plan: &PhasePlan<'_>,
    auditor: Result<&A, &str>,
    identity: Option<&Identity<I>>,
) -> Result<PhaseResults> {
    let config = project.config;
    let page = source.open_page().await.context("open page")?;
    let mut results = PhaseResults::default();

    if plan.smoke {
        let context = SmokeContext {
            origin: project.origin,
            breakpoints: &config.breakpoints,
            viewport_height: config.viewport_height,
            timeouts: &config.timeouts,
            run_dir: project.run_dir,
            visual: &project.visual,
        };
        results.smoke = run_routes(&page, project.routes, &context).await;
    }

    if plan.a11y {
        results.a11y = match auditor {
            Ok(auditor) => {
                let request = AuditRequest::new(config.a11y_rules.as_ref());
                let context = AuditContext {
                    origin: project.origin,
                    timeouts: &config.timeouts,
                    request: &request,
                };
                run_audits(source, auditor, project.routes, &context).await
            }
            Err(message) => project
                .routes
                .iter()
                .map(|route| {
                    AccessibilityResult::errored(route, 0, message.to_string())
                })
                .collect(),
        };
    }

    if !plan.flows.is_empty() {
        if let Err(error) = std::fs::create_dir_all(project.run_dir) {
            warn!("could not create {}: {}", project.run_dir.display(), error);
        }
        let context = FlowContext {
            origin: project.origin,
            run_dir: project.run_dir,
            timeouts: &config.timeouts,
            identity,
        };
        results.flows = run_flows(&page, &plan.flows, &context).await;
    }

    if let Err(error) = page.close().await {
        warn!("closing page: {}", error);
    }
    Ok(results)
}
