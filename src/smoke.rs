use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::time::sleep;
use url::Url;

use crate::browser::events::Channels;
use crate::browser::page::{PageDriver, evaluate_as};
use crate::config::Timeouts;
use crate::visual::{ScreenshotOutcome, VisualEngine, screenshot_filename};

/// True when `<body>` has no visible text and at most one child element.
/// Sparse pages, such as a single image, are reported blank as well.
pub const BLANK_PAGE_CHECK: &str = "() => {
  const body = document.body;
  if (!body) return true;
  const text = body.innerText.trim();
  return text.length === 0 && body.children.length <= 1;
}";

#[derive(Clone, Debug, PartialEq)]
pub struct ScreenshotResult {
    pub width: u32,
    pub filename: String,
    pub current_path: PathBuf,
    /// `None` only when visual regression is disabled.
    pub outcome: Option<ScreenshotOutcome>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RouteResult {
    pub route: String,
    pub passed: bool,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub is_blank: bool,
    pub console_errors: Vec<String>,
    pub network_failures: Vec<String>,
    pub screenshots: Vec<ScreenshotResult>,
}

impl RouteResult {
    fn conclude(mut self, started: Instant) -> Self {
        self.duration_ms = started.elapsed().as_millis() as u64;
        self.passed = !self.timed_out
            && !self.is_blank
            && self.console_errors.is_empty()
            && self.network_failures.is_empty()
            && !self
                .screenshots
                .iter()
                .filter_map(|shot| shot.outcome.as_ref())
                .any(ScreenshotOutcome::is_failure);
        self
    }
}

/// Everything a smoke pass needs besides the page itself.
pub struct SmokeContext<'a> {
    pub origin: &'a Url,
    pub breakpoints: &'a [u32],
    pub viewport_height: u32,
    pub timeouts: &'a Timeouts,
    pub run_dir: &'a std::path::Path,
    pub visual: &'a VisualEngine,
}

/// Checks every route in order on the one shared page.
pub async fn run_routes<P: PageDriver>(
    page: &P,
    routes: &[String],
    context: &SmokeContext<'_>,
) -> Vec<RouteResult> {
    if let Err(error) = std::fs::create_dir_all(context.run_dir) {
        warn!("could not create {}: {}", context.run_dir.display(), error);
    }
    let mut results = Vec::with_capacity(routes.len());
    for route in routes {
        let result = check_route(page, route, context).await;
        if result.passed {
            info!("{} passed in {}ms", route, result.duration_ms);
        } else {
            info!("{} failed in {}ms", route, result.duration_ms);
        }
        results.push(result);
    }
    results
}

async fn check_route<P: PageDriver>(
    page: &P,
    route: &str,
    context: &SmokeContext<'_>,
) -> RouteResult {
    let started = Instant::now();
    let mut result = RouteResult {
        route: route.to_string(),
        passed: false,
        duration_ms: 0,
        timed_out: false,
        is_blank: false,
        console_errors: vec![],
        network_failures: vec![],
        screenshots: vec![],
    };

    let mut subscription = match page.subscribe(Channels::all()).await {
        Ok(subscription) => subscription,
        Err(error) => {
            result
                .console_errors
                .push(format!("could not listen for page events: {}", error));
            return result.conclude(started);
        }
    };

    let mut errors = vec![];
    match context.origin.join(route) {
        Ok(url) => {
            visit(page, &url, route, context, &mut result, &mut errors).await
        }
        Err(error) => errors.push(format!("invalid route {}: {}", route, error)),
    }

    let captured = subscription.drain();
    drop(subscription);
    result.console_errors = captured.errors;
    result.console_errors.extend(errors);
    result.network_failures = captured.network_failures;
    result.conclude(started)
}

async fn visit<P: PageDriver>(
    page: &P,
    url: &Url,
    route: &str,
    context: &SmokeContext<'_>,
    result: &mut RouteResult,
    errors: &mut Vec<String>,
) {
    let timeouts = context.timeouts;
    match page.goto(url, timeouts.navigation()).await {
        Ok(()) => {}
        Err(error) if error.is_timeout() => {
            debug!("{}", error);
            result.timed_out = true;
            return;
        }
        Err(error) => {
            errors.push(error.to_string());
            return;
        }
    }

    if let Err(error) = page.wait_for_network_idle(timeouts.network_idle()).await
    {
        debug!("{}: network did not go idle: {}", route, error);
    }
    sleep(timeouts.settle()).await;

    match evaluate_as::<bool>(page, BLANK_PAGE_CHECK, vec![]).await {
        Ok(is_blank) => result.is_blank = is_blank,
        Err(error) => errors.push(format!("blank page check failed: {}", error)),
    }

    for &width in context.breakpoints {
        match capture(page, route, width, context).await {
            Ok(screenshot) => result.screenshots.push(screenshot),
            Err(error) => errors.push(format!("{}px: {:#}", width, error)),
        }
    }
}

async fn capture<P: PageDriver>(
    page: &P,
    route: &str,
    width: u32,
    context: &SmokeContext<'_>,
) -> Result<ScreenshotResult> {
    page.set_viewport(width, context.viewport_height).await?;
    sleep(context.timeouts.breakpoint_settle()).await;
    let filename = screenshot_filename(route, width);
    let current_path = context.run_dir.join(&filename);
    page.screenshot(&current_path)
        .await
        .context("screenshot failed")?;
    let outcome = context
        .visual
        .resolve(&current_path, &filename)
        .context("visual comparison failed")?;
    Ok(ScreenshotResult {
        width,
        filename,
        current_path,
        outcome,
    })
}
