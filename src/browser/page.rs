use std::{path::Path, time::Duration};

use serde::de::DeserializeOwned;
use serde_json as json;
use url::Url;

use crate::browser::BrowserError;
use crate::browser::events::{Channels, Subscription};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorState {
    Attached,
    Visible,
}

/// The slice of browser automation the runner needs from a single page.
#[allow(async_fn_in_trait)]
pub trait PageDriver {
    async fn goto(&self, url: &Url, timeout: Duration)
    -> Result<(), BrowserError>;

    async fn reload(&self, timeout: Duration) -> Result<(), BrowserError>;

    async fn wait_for_network_idle(
        &self,
        timeout: Duration,
    ) -> Result<(), BrowserError>;

    async fn set_viewport(
        &self,
        width: u32,
        height: u32,
    ) -> Result<(), BrowserError>;

    /// Captures a full-page PNG to `path`.
    async fn screenshot(&self, path: &Path) -> Result<(), BrowserError>;

    /// Calls `function` (a JS function expression) with JSON arguments.
    /// `undefined` results come back as `null`.
    async fn evaluate(
        &self,
        function: &str,
        arguments: Vec<json::Value>,
    ) -> Result<json::Value, BrowserError>;

    async fn click(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError>;

    async fn hover(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError>;

    async fn fill(
        &self,
        selector: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError>;

    async fn press(
        &self,
        selector: Option<&str>,
        key: &str,
    ) -> Result<(), BrowserError>;

    async fn wait_for_selector(
        &self,
        selector: &str,
        state: SelectorState,
        timeout: Duration,
    ) -> Result<(), BrowserError>;

    /// Waits for `selector` to be visible, then reads its text.
    async fn text_content(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<String, BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    async fn subscribe(
        &self,
        channels: Channels,
    ) -> Result<Subscription, BrowserError>;

    async fn close(self) -> Result<(), BrowserError>;
}

/// Something that can hand out fresh pages, e.g. a launched browser.
#[allow(async_fn_in_trait)]
pub trait PageSource {
    type Page: PageDriver;

    async fn open_page(&self) -> Result<Self::Page, BrowserError>;
}

pub async fn evaluate_as<Output: DeserializeOwned>(
    page: &impl PageDriver,
    function: &str,
    arguments: Vec<json::Value>,
) -> Result<Output, BrowserError> {
    let value = page.evaluate(function, arguments).await?;
    json::from_value(value).map_err(|error| {
        BrowserError::Other(
            anyhow::Error::new(error).context("unexpected evaluation result"),
        )
    })
}
