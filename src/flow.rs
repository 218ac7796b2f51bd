use std::path::Path;
use std::time::Instant;

use log::{debug, info};
use tokio::time::sleep;
use url::Url;

use crate::browser::BrowserError;
use crate::browser::events::{Channels, Subscription};
use crate::browser::page::{PageDriver, SelectorState};
use crate::config::Timeouts;
use crate::identity::{Identity, IdentityProvider, TestUser};

pub mod step;

use step::{Action, Flow, Step};

const TEXT_PREVIEW_CHARS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("{0}")]
    Assertion(String),
    #[error("{0}")]
    Configuration(String),
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("{0:#}")]
    Identity(anyhow::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepResult {
    pub action: String,
    pub label: String,
    pub passed: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FlowResult {
    pub name: String,
    pub passed: bool,
    /// Executed steps only; nothing after the first failure.
    pub steps: Vec<StepResult>,
    /// Set when the flow could not start at all.
    pub error: Option<String>,
}

pub struct FlowContext<'a, I> {
    pub origin: &'a Url,
    pub run_dir: &'a Path,
    pub timeouts: &'a Timeouts,
    pub identity: Option<&'a Identity<I>>,
}

pub async fn run_flows<P: PageDriver, I: IdentityProvider>(
    page: &P,
    flows: &[&Flow],
    context: &FlowContext<'_, I>,
) -> Vec<FlowResult> {
    let mut results = Vec::with_capacity(flows.len());
    for flow in flows {
        let result = run_flow(page, flow, context).await;
        info!(
            "flow {} {} ({} steps run)",
            result.name,
            if result.passed { "passed" } else { "failed" },
            result.steps.len()
        );
        results.push(result);
    }
    results
}

pub async fn run_flow<P: PageDriver, I: IdentityProvider>(
    page: &P,
    flow: &Flow,
    context: &FlowContext<'_, I>,
) -> FlowResult {
    // One subscription for the whole flow so later assertions see errors
    // raised by earlier steps.
    let mut subscription = match page.subscribe(Channels::errors()).await {
        Ok(subscription) => subscription,
        Err(error) => {
            return FlowResult {
                name: flow.name.clone(),
                passed: false,
                steps: vec![],
                error: Some(format!("could not listen for page events: {}", error)),
            };
        }
    };

    let mut steps = Vec::with_capacity(flow.steps.len());
    for step in &flow.steps {
        let started = Instant::now();
        let outcome =
            execute(page, step, &flow.name, &mut subscription, context).await;
        let result = StepResult {
            action: step.name().to_string(),
            label: step.label(),
            passed: outcome.is_ok(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: outcome.err().map(|error| error.to_string()),
        };
        debug!("{}: {} -> {:?}", flow.name, result.label, result.error);
        let failed = !result.passed;
        steps.push(result);
        if failed {
            break;
        }
    }
    drop(subscription);

    FlowResult {
        name: flow.name.clone(),
        passed: steps.iter().all(|step| step.passed),
        steps,
        error: None,
    }
}

async fn execute<P: PageDriver, I: IdentityProvider>(
    page: &P,
    step: &Step,
    flow_name: &str,
    subscription: &mut Subscription,
    context: &FlowContext<'_, I>,
) -> Result<(), StepError> {
    let action = match step {
        Step::Action(action) => action,
        Step::Unknown(name) => {
            return Err(StepError::UnknownAction(name.clone()));
        }
    };
    let timeouts = context.timeouts;

    match action {
        Action::Navigate { url } => {
            let url = context.origin.join(url).map_err(|error| {
                StepError::Configuration(format!("invalid url {}: {}", url, error))
            })?;
            page.goto(&url, timeouts.navigation()).await?;
            sleep(timeouts.settle()).await;
        }
        Action::Click { selector } => {
            page.click(selector, timeouts.selector()).await?
        }
        Action::Hover { selector } => {
            page.hover(selector, timeouts.selector()).await?
        }
        Action::Type { selector, value } => {
            page.fill(selector, value, timeouts.selector()).await?
        }
        Action::PressKey { selector, key } => {
            page.press(selector.as_deref(), key).await?
        }
        Action::WaitForSelector { selector } => {
            page.wait_for_selector(
                selector,
                SelectorState::Visible,
                timeouts.selector(),
            )
            .await?
        }
        Action::WaitFixed { ms } => {
            sleep(std::time::Duration::from_millis(*ms)).await
        }
        Action::AssertVisible { selector } => {
            page.wait_for_selector(
                selector,
                SelectorState::Visible,
                timeouts.selector(),
            )
            .await?
        }
        Action::AssertText { selector, value } => {
            let text = page.text_content(selector, timeouts.selector()).await?;
            if !text.contains(value.as_str()) {
                let preview: String =
                    text.chars().take(TEXT_PREVIEW_CHARS).collect();
                return Err(StepError::Assertion(format!(
                    "Expected text \"{}\" in {}, got \"{}\"",
                    value, selector, preview
                )));
            }
        }
        Action::AssertUrl { url } => {
            let expected = if url.starts_with('/') {
                format!("{}{}", context.origin.as_str().trim_end_matches('/'), url)
            } else {
                url.clone()
            };
            let current = page.current_url().await?;
            if !current.contains(&expected) {
                return Err(StepError::Assertion(format!(
                    "Expected URL containing \"{}\", got \"{}\"",
                    expected, current
                )));
            }
        }
        Action::AssertNoConsoleErrors => {
            let errors = subscription.drain_errors();
            if !errors.is_empty() {
                return Err(StepError::Assertion(format!(
                    "Console errors detected: {}",
                    errors.join(", ")
                )));
            }
        }
        Action::Screenshot { name } => {
            let name = name.clone().unwrap_or_else(|| default_screenshot_name(flow_name));
            let path = context.run_dir.join(format!("flow-{}.png", name));
            page.screenshot(&path).await?;
        }
        Action::IdentityAuth {
            email,
            password,
            metadata,
        } => {
            let identity = require_identity(context, action)?;
            let user = TestUser {
                email: email.clone(),
                password: password.clone(),
                metadata: metadata.clone(),
            };
            identity
                .authenticate(page, &user)
                .await
                .map_err(StepError::Identity)?;
        }
        Action::IdentitySignOut => {
            let identity = require_identity(context, action)?;
            identity.sign_out(page).await.map_err(StepError::Identity)?;
        }
    }
    Ok(())
}

fn require_identity<'a, I>(
    context: &FlowContext<'a, I>,
    action: &Action,
) -> Result<&'a Identity<I>, StepError> {
    context.identity.ok_or_else(|| {
        StepError::Configuration(format!(
            "{} requires an \"identity\" config section in .ux-test.json",
            action.name()
        ))
    })
}

fn default_screenshot_name(flow_name: &str) -> String {
    format!("{}-step", flow_name)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}
