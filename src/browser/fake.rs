//! In-memory page used by unit tests in place of Chrome.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use futures::StreamExt;
use image::{Rgba, RgbaImage};
use serde_json as json;
use tokio::sync::broadcast::{Sender, channel};
use url::Url;

use crate::browser::BrowserError;
use crate::browser::events::{
    Channels, PageEvent, Subscription, receiver_to_stream,
};
use crate::browser::page::{PageDriver, PageSource, SelectorState};
use crate::smoke::BLANK_PAGE_CHECK;

#[derive(Clone, Debug, Default)]
pub enum Navigation {
    #[default]
    Loads,
    TimesOut,
    Fails(String),
}

#[derive(Clone, Debug)]
pub struct FakeRoute {
    pub navigation: Navigation,
    pub events: Vec<PageEvent>,
    pub blank: bool,
    pub color: [u8; 4],
    pub height: u32,
}

impl Default for FakeRoute {
    fn default() -> Self {
        FakeRoute {
            navigation: Navigation::Loads,
            events: vec![],
            blank: false,
            color: [255, 255, 255, 255],
            height: 10,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FakeElement {
    pub text: String,
    pub visible: bool,
    pub on_click: Vec<PageEvent>,
}

#[derive(Default)]
struct FakeState {
    url: String,
    viewport: (u32, u32),
    calls: Vec<String>,
    evaluations: Vec<(String, Vec<json::Value>)>,
}

pub struct FakePage {
    events: Sender<PageEvent>,
    routes: HashMap<String, FakeRoute>,
    elements: HashMap<String, FakeElement>,
    state: Mutex<FakeState>,
    closed: Arc<AtomicUsize>,
}

impl FakePage {
    pub fn new() -> Self {
        let (events, _) = channel(256);
        FakePage {
            events,
            routes: HashMap::new(),
            elements: HashMap::new(),
            state: Mutex::new(FakeState {
                url: "about:blank".to_string(),
                viewport: (1024, 720),
                ..FakeState::default()
            }),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_route(mut self, path: &str, route: FakeRoute) -> Self {
        self.routes.insert(path.to_string(), route);
        self
    }

    pub fn with_element(mut self, selector: &str, element: FakeElement) -> Self {
        self.elements.insert(selector.to_string(), element);
        self
    }

    pub fn emit(&self, event: PageEvent) {
        let _ = self.events.send(event);
    }

    pub fn active_subscriptions(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn evaluations(&self) -> Vec<(String, Vec<json::Value>)> {
        self.state.lock().unwrap().evaluations.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn current_route(&self) -> FakeRoute {
        let url = self.state.lock().unwrap().url.clone();
        Url::parse(&url)
            .ok()
            .and_then(|url| self.routes.get(url.path()).cloned())
            .unwrap_or_default()
    }

    fn element(
        &self,
        selector: &str,
        state: SelectorState,
        timeout: Duration,
    ) -> Result<FakeElement, BrowserError> {
        match self.elements.get(selector) {
            Some(element)
                if element.visible || state == SelectorState::Attached =>
            {
                Ok(element.clone())
            }
            _ => Err(BrowserError::Timeout {
                operation: format!("waiting for {}", selector),
                after: timeout,
            }),
        }
    }
}

impl PageDriver for FakePage {
    async fn goto(
        &self,
        url: &Url,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        self.record(format!("goto {}", url.path()));
        self.state.lock().unwrap().url = url.to_string();
        let route = self.routes.get(url.path()).cloned().unwrap_or_default();
        for event in route.events {
            self.emit(event);
        }
        match route.navigation {
            Navigation::Loads => Ok(()),
            Navigation::TimesOut => Err(BrowserError::Timeout {
                operation: format!("navigation to {}", url),
                after: timeout,
            }),
            Navigation::Fails(message) => {
                Err(BrowserError::Other(anyhow!(message)))
            }
        }
    }

    async fn reload(&self, _timeout: Duration) -> Result<(), BrowserError> {
        self.record("reload".to_string());
        Ok(())
    }

    async fn wait_for_network_idle(
        &self,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
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
        self.record(format!("viewport {}x{}", width, height));
        self.state.lock().unwrap().viewport = (width, height);
        Ok(())
    }

    async fn screenshot(&self, path: &Path) -> Result<(), BrowserError> {
        let route = self.current_route();
        let (width, _) = self.state.lock().unwrap().viewport;
        RgbaImage::from_pixel(width, route.height, Rgba(route.color))
            .save(path)
            .map_err(|err| anyhow!(err))?;
        self.record(format!(
            "screenshot {}",
            path.file_name().unwrap().to_string_lossy()
        ));
        Ok(())
    }

    async fn evaluate(
        &self,
        function: &str,
        arguments: Vec<json::Value>,
    ) -> Result<json::Value, BrowserError> {
        self.state
            .lock()
            .unwrap()
            .evaluations
            .push((function.to_string(), arguments));
        if function == BLANK_PAGE_CHECK {
            return Ok(json::Value::Bool(self.current_route().blank));
        }
        Ok(json::Value::Null)
    }

    async fn click(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        let element = self.element(selector, SelectorState::Visible, timeout)?;
        self.record(format!("click {}", selector));
        for event in element.on_click {
            self.emit(event);
        }
        Ok(())
    }

    async fn hover(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        self.element(selector, SelectorState::Visible, timeout)?;
        self.record(format!("hover {}", selector));
        Ok(())
    }

    async fn fill(
        &self,
        selector: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        self.element(selector, SelectorState::Visible, timeout)?;
        self.record(format!("fill {} {}", selector, value));
        Ok(())
    }

    async fn press(
        &self,
        selector: Option<&str>,
        key: &str,
    ) -> Result<(), BrowserError> {
        if let Some(selector) = selector {
            self.element(selector, SelectorState::Attached, Duration::ZERO)?;
        }
        self.record(format!("press {} {}", selector.unwrap_or("body"), key));
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        state: SelectorState,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        self.element(selector, state, timeout)?;
        Ok(())
    }

    async fn text_content(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<String, BrowserError> {
        Ok(self.element(selector, SelectorState::Visible, timeout)?.text)
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.state.lock().unwrap().url.clone())
    }

    async fn subscribe(
        &self,
        channels: Channels,
    ) -> Result<Subscription, BrowserError> {
        let events = receiver_to_stream(self.events.subscribe()).filter(
            move |event| {
                let wanted = match event {
                    PageEvent::Console { .. } => channels.console,
                    PageEvent::PageError(_) => channels.page_errors,
                    PageEvent::Response { .. } => channels.responses,
                };
                futures::future::ready(wanted)
            },
        );
        Ok(Subscription::new(events))
    }

    async fn close(self) -> Result<(), BrowserError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out fake pages that all share the same routes.
pub struct FakeSource {
    routes: HashMap<String, FakeRoute>,
    pub opened: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
}

impl FakeSource {
    pub fn new() -> Self {
        FakeSource {
            routes: HashMap::new(),
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_route(mut self, path: &str, route: FakeRoute) -> Self {
        self.routes.insert(path.to_string(), route);
        self
    }
}

impl PageSource for FakeSource {
    type Page = FakePage;

    async fn open_page(&self) -> Result<FakePage, BrowserError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let mut page = FakePage::new();
        page.routes = self.routes.clone();
        page.closed = self.closed.clone();
        Ok(page)
    }
}
