use anyhow::{Context, anyhow};
use chromiumoxide::browser::{BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::browser_protocol::{emulation, input, network};
use chromiumoxide::cdp::js_protocol::runtime;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{BrowserConfig, Page};
use futures::StreamExt;
use serde_json as json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use url::Url;

use crate::browser::evaluation::evaluate_function_call;
use crate::browser::events::{
    Channels, ConsoleLevel, EventStream, PageEvent, Subscription,
};
use crate::browser::keys::key_definition;
use crate::browser::page::{PageDriver, PageSource, SelectorState};

pub mod evaluation;
pub mod events;
#[cfg(test)]
pub mod fake;
pub mod keys;
pub mod page;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const QUIET_WINDOW: Duration = Duration::from_millis(500);
// chromiumoxide's own per-request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout { operation: String, after: Duration },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BrowserError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrowserError::Timeout { .. })
    }
}

impl From<CdpError> for BrowserError {
    fn from(error: CdpError) -> Self {
        match error {
            CdpError::Timeout => BrowserError::Timeout {
                operation: "browser request".to_string(),
                after: REQUEST_TIMEOUT,
            },
            other => BrowserError::Other(anyhow!(other)),
        }
    }
}

async fn with_timeout<T, E: Into<BrowserError>>(
    operation: impl FnOnce() -> String,
    after: Duration,
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, BrowserError> {
    match timeout(after, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(BrowserError::Timeout {
            operation: operation(),
            after,
        }),
    }
}

#[derive(Clone, Debug)]
pub struct BrowserOptions {
    pub headless: bool,
    pub no_sandbox: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        BrowserOptions {
            headless: true,
            no_sandbox: false,
            width: 1024,
            height: 720,
        }
    }
}

pub struct Browser {
    browser: chromiumoxide::Browser,
    handler: JoinHandle<()>,
    _user_data_directory: TempDir,
    _crash_dumps_directory: TempDir,
}

impl Browser {
    pub async fn launch(browser_options: &BrowserOptions) -> anyhow::Result<Self> {
        let user_data_directory = TempDir::new()?;
        let crash_dumps_directory = TempDir::new()?;
        let browser_config = browser_options_to_config(
            browser_options,
            user_data_directory.path(),
            crash_dumps_directory.path(),
        )?;
        let (browser, mut handler) =
            chromiumoxide::Browser::launch(browser_config)
                .await
                .context("launch browser")?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(error) = event {
                    log::debug!("browser handler: {}", error);
                }
            }
        });

        log::info!(
            "launched browser ({})",
            if browser_options.headless {
                "headless"
            } else {
                "headed"
            }
        );

        Ok(Browser {
            browser,
            handler,
            _user_data_directory: user_data_directory,
            _crash_dumps_directory: crash_dumps_directory,
        })
    }

    pub async fn new_page(&self) -> Result<ChromePage, BrowserError> {
        let page = self.browser.new_page("about:blank").await?;
        page.enable_runtime().await?;
        page.execute(network::EnableParams::default()).await?;
        Ok(ChromePage { page })
    }

    pub async fn terminate(self) {
        let Browser {
            browser, handler, ..
        } = self;
        // browser.close() logs a spurious websocket error, dropping the
        // handle kills the Chrome process just as well.
        drop(browser);
        handler.abort();
    }
}

impl PageSource for Browser {
    type Page = ChromePage;

    async fn open_page(&self) -> Result<ChromePage, BrowserError> {
        self.new_page().await
    }
}

pub struct ChromePage {
    page: Page,
}

impl ChromePage {
    async fn evaluate_value<T: serde::de::DeserializeOwned>(
        &self,
        function: &str,
        arguments: Vec<json::Value>,
    ) -> Result<T, BrowserError> {
        let value = evaluate_function_call(&self.page, function, arguments)
            .await?;
        json::from_value(value).map_err(|err| BrowserError::Other(anyhow!(err)))
    }

    async fn dispatch_key(&self, key: &str) -> Result<(), BrowserError> {
        let definition =
            key_definition(key).ok_or_else(|| anyhow!("unknown key: {}", key))?;
        let build_params = |event_type| {
            let mut builder = input::DispatchKeyEventParams::builder()
                .r#type(event_type)
                .key(definition.key.clone())
                .code(definition.code.clone())
                .windows_virtual_key_code(definition.key_code)
                .native_virtual_key_code(definition.key_code);
            if let Some(text) = &definition.text {
                builder =
                    builder.text(text.clone()).unmodified_text(text.clone());
            }
            builder.build().map_err(|err| anyhow!(err))
        };
        let down = if definition.text.is_some() {
            input::DispatchKeyEventType::KeyDown
        } else {
            input::DispatchKeyEventType::RawKeyDown
        };
        self.page.execute(build_params(down)?).await?;
        self.page
            .execute(build_params(input::DispatchKeyEventType::KeyUp)?)
            .await?;
        Ok(())
    }
}

const SELECTOR_MATCHES: &str = r#"(selector, visible) => {
    const element = document.querySelector(selector);
    if (!element) return false;
    if (!visible) return true;
    const style = window.getComputedStyle(element);
    const rect = element.getBoundingClientRect();
    return style.visibility !== "hidden" && style.display !== "none"
        && rect.width > 0 && rect.height > 0;
}"#;

const FOCUS_AND_CLEAR: &str = r#"(selector) => {
    const element = document.querySelector(selector);
    element.focus();
    if ("value" in element) element.value = "";
    else if (element.isContentEditable) element.textContent = "";
}"#;

const FOCUS: &str = r#"(selector) => document.querySelector(selector).focus()"#;

const TEXT_CONTENT: &str =
    r#"(selector) => document.querySelector(selector)?.textContent ?? """#;

const RESOURCE_COUNT: &str =
    "() => performance.getEntriesByType('resource').length";

impl PageDriver for ChromePage {
    async fn goto(
        &self,
        url: &Url,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        with_timeout(
            || format!("navigation to {}", url),
            timeout,
            self.page.goto(url.as_str()),
        )
        .await?;
        Ok(())
    }

    async fn reload(&self, timeout: Duration) -> Result<(), BrowserError> {
        with_timeout(|| "reload".to_string(), timeout, self.page.reload())
            .await?;
        Ok(())
    }

    async fn wait_for_network_idle(
        &self,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        let mut previous: Option<u64> = None;
        while Instant::now() < deadline {
            let count: u64 = self.evaluate_value(RESOURCE_COUNT, vec![]).await?;
            if previous == Some(count) {
                return Ok(());
            }
            previous = Some(count);
            sleep(QUIET_WINDOW).await;
        }
        Err(BrowserError::Timeout {
            operation: "network idle".to_string(),
            after: timeout,
        })
    }

    async fn set_viewport(
        &self,
        width: u32,
        height: u32,
    ) -> Result<(), BrowserError> {
        self.page
            .execute(
                emulation::SetDeviceMetricsOverrideParams::builder()
                    .width(width)
                    .height(height)
                    .device_scale_factor(1.0)
                    .mobile(false)
                    .build()
                    .map_err(|err| {
                        anyhow!(err).context(
                            "build SetDeviceMetricsOverrideParams failed",
                        )
                    })?,
            )
            .await?;
        Ok(())
    }

    async fn screenshot(&self, path: &Path) -> Result<(), BrowserError> {
        self.page
            .save_screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(true)
                    .build(),
                path,
            )
            .await
            .map_err(|err| {
                anyhow!(err).context(format!("screenshot to {:?}", path))
            })?;
        Ok(())
    }

    async fn evaluate(
        &self,
        function: &str,
        arguments: Vec<json::Value>,
    ) -> Result<json::Value, BrowserError> {
        evaluate_function_call(&self.page, function, arguments).await
    }

    async fn click(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        self.wait_for_selector(selector, SelectorState::Visible, timeout)
            .await?;
        self.page.find_element(selector).await?.click().await?;
        Ok(())
    }

    async fn hover(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        self.wait_for_selector(selector, SelectorState::Visible, timeout)
            .await?;
        self.page.find_element(selector).await?.hover().await?;
        Ok(())
    }

    async fn fill(
        &self,
        selector: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        self.wait_for_selector(selector, SelectorState::Visible, timeout)
            .await?;
        self.evaluate(FOCUS_AND_CLEAR, vec![json::Value::from(selector)])
            .await?;
        self.page
            .execute(input::InsertTextParams::new(value))
            .await?;
        Ok(())
    }

    async fn press(
        &self,
        selector: Option<&str>,
        key: &str,
    ) -> Result<(), BrowserError> {
        let selector = selector.unwrap_or("body");
        self.page.find_element(selector).await?;
        self.evaluate(FOCUS, vec![json::Value::from(selector)])
            .await?;
        self.dispatch_key(key).await
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        state: SelectorState,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        let visible = state == SelectorState::Visible;
        let deadline = Instant::now() + timeout;
        loop {
            let matched: bool = self
                .evaluate_value(
                    SELECTOR_MATCHES,
                    vec![json::Value::from(selector), json::Value::from(visible)],
                )
                .await?;
            if matched {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout {
                    operation: format!(
                        "waiting for {}{}",
                        selector,
                        if visible { " to be visible" } else { "" }
                    ),
                    after: timeout,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn text_content(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<String, BrowserError> {
        self.wait_for_selector(selector, SelectorState::Visible, timeout)
            .await?;
        self.evaluate_value(TEXT_CONTENT, vec![json::Value::from(selector)])
            .await
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn subscribe(
        &self,
        channels: Channels,
    ) -> Result<Subscription, BrowserError> {
        let mut streams: Vec<EventStream> = Vec::new();

        if channels.console {
            streams.push(Box::pin(
                self.page
                    .event_listener::<runtime::EventConsoleApiCalled>()
                    .await?
                    .map(|call| PageEvent::Console {
                        level: console_level(&call.r#type),
                        text: console_text(&call.args),
                    }),
            ));
        }

        if channels.page_errors {
            streams.push(Box::pin(
                self.page
                    .event_listener::<runtime::EventExceptionThrown>()
                    .await?
                    .map(|event| {
                        let details = &event.exception_details;
                        let description = details
                            .exception
                            .as_ref()
                            .and_then(|exception| exception.description.clone())
                            .unwrap_or_else(|| details.text.clone());
                        PageEvent::PageError(exception_message(&description))
                    }),
            ));
        }

        if channels.responses {
            streams.push(Box::pin(
                self.page
                    .event_listener::<network::EventResponseReceived>()
                    .await?
                    .map(|event| PageEvent::Response {
                        status: u16::try_from(event.response.status)
                            .unwrap_or(0),
                        url: event.response.url.clone(),
                    }),
            ));
        }

        Ok(Subscription::merged(streams))
    }

    async fn close(self) -> Result<(), BrowserError> {
        self.page.close().await?;
        Ok(())
    }
}

fn console_level(kind: &runtime::ConsoleApiCalledType) -> ConsoleLevel {
    match kind {
        runtime::ConsoleApiCalledType::Error => ConsoleLevel::Error,
        runtime::ConsoleApiCalledType::Warning => ConsoleLevel::Warning,
        runtime::ConsoleApiCalledType::Info => ConsoleLevel::Info,
        runtime::ConsoleApiCalledType::Debug => ConsoleLevel::Debug,
        _ => ConsoleLevel::Log,
    }
}

fn console_text(args: &[runtime::RemoteObject]) -> String {
    args.iter()
        .map(|object| match remote_object_to_json(object) {
            json::Value::String(text) => text,
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn remote_object_to_json(object: &runtime::RemoteObject) -> json::Value {
    match (&object.r#type, &object.value, &object.description) {
        (_, Some(value), _) => value.clone(),
        (_, None, Some(description)) => {
            json::Value::String(description.clone())
        }
        (r#type, _, _) => {
            json::Value::String(format!("<object of type {:?}>", r#type))
        }
    }
}

/// The message of a thrown error, without its stack and `Name: ` prefix.
pub fn exception_message(description: &str) -> String {
    let first_line = description.lines().next().unwrap_or_default();
    match first_line.split_once(": ") {
        Some((name, message))
            if name.ends_with("Error")
                && name.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            message.to_string()
        }
        _ => first_line.to_string(),
    }
}

fn browser_options_to_config(
    browser_options: &BrowserOptions,
    user_data_directory: &Path,
    crash_dumps_directory: &Path,
) -> anyhow::Result<BrowserConfig> {
    let apply_sandbox =
        |builder: BrowserConfigBuilder| -> BrowserConfigBuilder {
            if browser_options.no_sandbox {
                builder.no_sandbox().args([
                    "--disable-setuid-sandbox",
                    "--disable-dev-shm-usage",
                ])
            } else {
                builder
            }
        };
    apply_sandbox(BrowserConfig::builder())
        .headless_mode(if browser_options.headless {
            HeadlessMode::New
        } else {
            HeadlessMode::False
        })
        .window_size(browser_options.width, browser_options.height)
        .user_data_dir(PathBuf::from(user_data_directory))
        .args([
            format!(
                "--crash-dumps-dir={}",
                crash_dumps_directory.display()
            ),
            "--no-crashpad".to_string(),
            "--disable-crash-reporter".to_string(),
        ])
        .build()
        .map_err(|s| anyhow!(s))
}
