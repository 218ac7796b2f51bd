use axum::Router;
use serde_json::json;
use tempfile::TempDir;
use tower_http::services::ServeDir;
use url::Url;

use ux_test::browser::page::PageSource;
use ux_test::browser::{Browser, BrowserOptions};
use ux_test::config::Timeouts;
use ux_test::flow::step::Flow;
use ux_test::flow::{FlowContext, FlowResult, run_flows};
use ux_test::identity::SupabaseAdmin;
use ux_test::smoke::{RouteResult, SmokeContext, run_routes};
use ux_test::visual::{ScreenshotOutcome, VisualEngine, VisualOptions};

async fn serve_fixtures() -> Url {
    let app = Router::new().fallback_service(ServeDir::new("./tests/fixtures"));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Url::parse(&format!("http://localhost:{}/", addr.port())).unwrap()
}

async fn launch() -> Option<Browser> {
    let options = BrowserOptions {
        headless: true,
        no_sandbox: true,
        width: 1024,
        height: 720,
    };
    match Browser::launch(&options).await {
        Ok(browser) => Some(browser),
        Err(error) => {
            eprintln!("skipping, no browser available: {:#}", error);
            None
        }
    }
}

fn fast_timeouts() -> Timeouts {
    Timeouts {
        network_idle: 1000,
        settle: 100,
        breakpoint_settle: 50,
        ..Timeouts::default()
    }
}

async fn smoke(routes: &[&str], breakpoints: &[u32]) -> Option<(Vec<RouteResult>, TempDir)> {
    let browser = launch().await?;
    let origin = serve_fixtures().await;
    let scratch = TempDir::new().unwrap();
    let run_dir = scratch.path().join("runs/now");
    let visual = VisualEngine::new(VisualOptions {
        enabled: true,
        update_baselines: false,
        threshold: 0.1,
        baselines_dir: scratch.path().join("baselines"),
        diffs_dir: run_dir.join("diffs"),
    });
    let timeouts = fast_timeouts();
    let context = SmokeContext {
        origin: &origin,
        breakpoints,
        viewport_height: 720,
        timeouts: &timeouts,
        run_dir: &run_dir,
        visual: &visual,
    };
    let routes: Vec<String> = routes.iter().map(|route| route.to_string()).collect();

    let page = browser.open_page().await.unwrap();
    let results = run_routes(&page, &routes, &context).await;
    browser.terminate().await;
    Some((results, scratch))
}

#[tokio::test]
async fn test_healthy_page_passes_and_creates_baselines() {
    let Some((results, scratch)) = smoke(&["/healthy.html"], &[375, 1024]).await
    else {
        return;
    };

    let result = &results[0];
    assert!(result.passed, "unexpected failure: {:?}", result);
    assert_eq!(result.screenshots.len(), 2);
    for shot in &result.screenshots {
        assert_eq!(shot.outcome, Some(ScreenshotOutcome::BaselineCreated));
        assert!(shot.current_path.exists());
    }
    assert!(scratch.path().join("baselines/healthy.html--375.png").exists());
}

#[tokio::test]
async fn test_console_errors_and_exceptions_are_captured() {
    let Some((results, _scratch)) = smoke(&["/console-error.html"], &[1024]).await
    else {
        return;
    };

    let result = &results[0];
    assert!(!result.passed);
    assert!(
        result
            .console_errors
            .iter()
            .any(|error| error == "failed to load widgets"),
        "{:?}",
        result.console_errors
    );
    assert!(
        result
            .console_errors
            .iter()
            .any(|error| error.starts_with("Uncaught:")
                && error.contains("widget crashed")),
        "{:?}",
        result.console_errors
    );
    assert!(
        !result
            .console_errors
            .iter()
            .any(|error| error.contains("deprecated api"))
    );
}

#[tokio::test]
async fn test_failed_responses_are_captured() {
    let Some((results, _scratch)) = smoke(&["/missing-asset.html"], &[1024]).await
    else {
        return;
    };

    let result = &results[0];
    assert!(!result.passed);
    assert!(
        result
            .network_failures
            .iter()
            .any(|failure| failure.starts_with("404 ")
                && failure.ends_with("/does-not-exist.png")),
        "{:?}",
        result.network_failures
    );
}

#[tokio::test]
async fn test_errors_stay_with_their_route() {
    let Some((results, _scratch)) =
        smoke(&["/console-error.html", "/healthy.html"], &[1024]).await
    else {
        return;
    };

    assert!(!results[0].passed);
    assert!(results[1].passed, "unexpected failure: {:?}", results[1]);
    assert!(results[1].console_errors.is_empty());
}

#[tokio::test]
async fn test_blank_page_detection() {
    let Some((results, _scratch)) =
        smoke(&["/empty.html", "/sparse.html"], &[1024]).await
    else {
        return;
    };

    assert!(results[0].is_blank);
    assert!(!results[0].passed);
    // A page with one visual element and no text is reported blank too.
    assert!(results[1].is_blank);
}

#[tokio::test]
async fn test_missing_route_is_a_network_failure() {
    let Some((results, _scratch)) = smoke(&["/nope.html"], &[1024]).await else {
        return;
    };

    assert!(!results[0].passed);
    assert!(!results[0].timed_out);
    assert!(
        results[0]
            .network_failures
            .iter()
            .any(|failure| failure.starts_with("404 ")),
        "{:?}",
        results[0].network_failures
    );
}

async fn run_flow(flow: serde_json::Value) -> Option<(FlowResult, TempDir)> {
    let flow: Flow = serde_json::from_value(flow).unwrap();
    let browser = launch().await?;
    let origin = serve_fixtures().await;
    let scratch = TempDir::new().unwrap();
    let timeouts = Timeouts {
        selector: 3000,
        ..fast_timeouts()
    };
    let context = FlowContext::<SupabaseAdmin> {
        origin: &origin,
        run_dir: scratch.path(),
        timeouts: &timeouts,
        identity: None,
    };

    let page = browser.open_page().await.unwrap();
    let mut results = run_flows(&page, &[&flow], &context).await;
    browser.terminate().await;
    results.pop().map(|result| (result, scratch))
}

#[tokio::test]
async fn test_form_flow() {
    let Some((result, scratch)) = run_flow(json!({
        "name": "Newsletter signup",
        "steps": [
            { "action": "goto", "url": "/form.html" },
            { "action": "waitFor", "selector": "#email" },
            { "action": "type", "selector": "#email", "value": "qa@example.com" },
            { "action": "click", "selector": "#submit" },
            { "action": "assertVisible", "selector": "#status" },
            { "action": "assertText", "selector": "#status", "value": "Thanks, qa@example.com" },
            { "action": "assertUrl", "url": "/form.html?subscribed=1" },
            { "action": "assertNoErrors" },
            { "action": "screenshot" }
        ]
    }))
    .await
    else {
        return;
    };

    assert!(result.passed, "unexpected failure: {:?}", result);
    assert_eq!(result.steps.len(), 9);
    assert!(
        scratch
            .path()
            .join("flow-newsletter-signup-step.png")
            .exists()
    );
}

#[tokio::test]
async fn test_flow_stops_at_first_failure() {
    let Some((result, _scratch)) = run_flow(json!({
        "name": "broken",
        "steps": [
            { "action": "goto", "url": "/healthy.html" },
            { "action": "assertText", "selector": "h1", "value": "Checkout" },
            { "action": "click", "selector": "a" }
        ]
    }))
    .await
    else {
        return;
    };

    assert!(!result.passed);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(
        result.steps[1].error.as_deref(),
        Some("Expected text \"Checkout\" in h1, got \"Pricing\"")
    );
}

#[tokio::test]
async fn test_flow_console_errors() {
    let Some((result, _scratch)) = run_flow(json!({
        "name": "errors",
        "steps": [
            { "action": "goto", "url": "/console-error.html" },
            { "action": "assertNoErrors" }
        ]
    }))
    .await
    else {
        return;
    };

    assert!(!result.passed);
    let error = result.steps[1].error.as_deref().unwrap();
    assert!(error.starts_with("Console errors detected: "), "{}", error);
}
