use std::pin::Pin;

use futures::{FutureExt, Stream, StreamExt, stream};
use tokio::sync::broadcast::Receiver;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Info,
    Debug,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageEvent {
    Console { level: ConsoleLevel, text: String },
    PageError(String),
    Response { status: u16, url: String },
}

/// Which page channels a [`Subscription`] listens to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Channels {
    pub console: bool,
    pub page_errors: bool,
    pub responses: bool,
}

impl Channels {
    pub fn all() -> Self {
        Channels {
            console: true,
            page_errors: true,
            responses: true,
        }
    }

    pub fn errors() -> Self {
        Channels {
            console: true,
            page_errors: true,
            responses: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Captured {
    pub errors: Vec<String>,
    pub network_failures: Vec<String>,
}

impl Captured {
    fn record(&mut self, event: PageEvent) {
        match event {
            PageEvent::Console {
                level: ConsoleLevel::Error,
                text,
            } => self.errors.push(text),
            PageEvent::Console { .. } => {}
            PageEvent::PageError(message) => {
                self.errors.push(format!("Uncaught: {}", message))
            }
            PageEvent::Response { status, url } if status >= 400 => {
                self.network_failures.push(format!("{} {}", status, url))
            }
            PageEvent::Response { .. } => {}
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = PageEvent> + Send>>;

/// Scoped listener registration on a page.
///
/// The guard owns the merged event streams of every subscribed channel.
/// Dropping it drops the streams, which detaches the listeners, so a
/// subscription can never outlive the route or flow that acquired it.
pub struct Subscription {
    events: EventStream,
    pending: Captured,
}

impl Subscription {
    pub fn new(events: impl Stream<Item = PageEvent> + Send + 'static) -> Self {
        Subscription {
            events: Box::pin(events),
            pending: Captured::default(),
        }
    }

    pub fn merged(streams: Vec<EventStream>) -> Self {
        Subscription::new(stream::select_all(streams))
    }

    fn pull(&mut self) {
        while let Some(Some(event)) = self.events.next().now_or_never() {
            self.pending.record(event);
        }
    }

    /// Everything captured since the last drain. The buffer is empty
    /// afterwards.
    pub fn drain(&mut self) -> Captured {
        self.pull();
        std::mem::take(&mut self.pending)
    }

    pub fn drain_errors(&mut self) -> Vec<String> {
        self.pull();
        std::mem::take(&mut self.pending.errors)
    }
}

pub fn receiver_to_stream<T: Clone + Send + 'static>(
    receiver: Receiver<T>,
) -> Pin<Box<dyn Stream<Item = T> + Send>> {
    Box::pin(BroadcastStream::new(receiver).filter_map(async |r| r.ok()))
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::channel;

    use super::*;

    fn console_error(text: &str) -> PageEvent {
        PageEvent::Console {
            level: ConsoleLevel::Error,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_captures_formatted_events() {
        let (sender, receiver) = channel(16);
        let mut subscription = Subscription::new(receiver_to_stream(receiver));

        sender.send(console_error("boom")).unwrap();
        sender
            .send(PageEvent::Console {
                level: ConsoleLevel::Warning,
                text: "ignored".to_string(),
            })
            .unwrap();
        sender
            .send(PageEvent::PageError("x is not defined".to_string()))
            .unwrap();
        sender
            .send(PageEvent::Response {
                status: 200,
                url: "http://localhost/ok".to_string(),
            })
            .unwrap();
        sender
            .send(PageEvent::Response {
                status: 404,
                url: "http://localhost/missing.js".to_string(),
            })
            .unwrap();

        let captured = subscription.drain();
        assert_eq!(
            captured.errors,
            vec!["boom", "Uncaught: x is not defined"]
        );
        assert_eq!(
            captured.network_failures,
            vec!["404 http://localhost/missing.js"]
        );
    }

    #[tokio::test]
    async fn test_drain_clears_buffer() {
        let (sender, receiver) = channel(16);
        let mut subscription = Subscription::new(receiver_to_stream(receiver));

        sender.send(console_error("first")).unwrap();
        assert_eq!(subscription.drain_errors(), vec!["first"]);
        assert!(subscription.drain_errors().is_empty());

        sender.send(console_error("second")).unwrap();
        assert_eq!(subscription.drain().errors, vec!["second"]);
    }

    #[tokio::test]
    async fn test_drop_detaches_listener() {
        let (sender, receiver) = channel::<PageEvent>(16);
        let subscription = Subscription::new(receiver_to_stream(receiver));
        assert_eq!(sender.receiver_count(), 1);
        drop(subscription);
        assert_eq!(sender.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_merged_channels() {
        let (console_sender, console_receiver) = channel(16);
        let (error_sender, error_receiver) = channel(16);
        let mut subscription = Subscription::merged(vec![
            receiver_to_stream(console_receiver),
            receiver_to_stream(error_receiver),
        ]);

        console_sender.send(console_error("a")).unwrap();
        error_sender
            .send(PageEvent::PageError("b".to_string()))
            .unwrap();

        let mut errors = subscription.drain_errors();
        errors.sort();
        assert_eq!(errors, vec!["Uncaught: b", "a"]);
    }
}
