//! Notifications pushed to connected client runtimes.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Default capacity of the notification channel.
pub const DEFAULT_CAPACITY: usize = 256;

/// Message sent to every connected client runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Cookies for `url` changed; runtimes should refresh their view.
    CookiesUpdated { url: String },
}

/// Broadcasts [`ClientMessage`]s to subscribers.
#[derive(Debug, Clone)]
pub struct CookieNotifier {
    tx: broadcast::Sender<ClientMessage>,
}

impl Default for CookieNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl CookieNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes to future messages.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
        self.tx.subscribe()
    }

    /// Announces a cookie change for `url`. Returns how many subscribers
    /// received it; having none is not an error.
    pub fn notify_cookies_updated(&self, url: &str) -> usize {
        let message = ClientMessage::CookiesUpdated {
            url: url.to_string(),
        };
        let delivered = self.tx.send(message).unwrap_or(0);
        trace!(url, delivered, "Cookie update broadcast");
        delivered
    }
}
