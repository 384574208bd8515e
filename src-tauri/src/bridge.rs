/// Bridge
/// The fixed set of capabilities the webview gets. Nothing else crosses the
/// trust boundary: no process handles, no file system, no generic invoke.
use crate::error::BridgeError;
use crate::models::{Channel, OutboundCommand, Payload, SubscriptionId, WorkerStatus, OUTBOUND_CHANNEL};
use crate::services::{Router, Subscription, Supervisor};
use std::sync::Arc;
use url::Url;

/// Opens a link in the user's default handler.
pub trait UrlOpener: Send + Sync {
    fn open(&self, url: &Url) -> Result<(), String>;
}

/// Uses the platform launcher directly; for hosts without the webview
/// plugins.
pub struct SystemOpener;

impl UrlOpener for SystemOpener {
    fn open(&self, url: &Url) -> Result<(), String> {
        use std::process::Command;

        #[cfg(target_os = "macos")]
        let mut cmd = {
            let mut cmd = Command::new("open");
            cmd.arg(url.as_str());
            cmd
        };

        #[cfg(target_os = "windows")]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", "start", "", url.as_str()]);
            cmd
        };

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let mut cmd = {
            let mut cmd = Command::new("xdg-open");
            cmd.arg(url.as_str());
            cmd
        };

        cmd.spawn()
            .map(|_| ())
            .map_err(|e| format!("Failed to launch browser: {}", e))
    }
}

pub struct Bridge {
    supervisor: Arc<Supervisor>,
    router: Router,
    opener: Box<dyn UrlOpener>,
}

impl Bridge {
    pub fn new(supervisor: Arc<Supervisor>, opener: Box<dyn UrlOpener>) -> Self {
        let router = supervisor.router().clone();
        Self {
            supervisor,
            router,
            opener,
        }
    }

    /// Fire-and-forget. Whatever goes wrong is logged, never returned: the UI
    /// learns about a dead worker from `worker-exited`, not from errors.
    pub fn send(&self, channel: &str, payload: &OutboundCommand) {
        if channel != OUTBOUND_CHANNEL {
            log::warn!("[Bridge] Dropping message for unknown channel `{}`", channel);
            return;
        }
        if let Err(e) = self.supervisor.send(payload) {
            log::error!("[Bridge] Send to worker failed: {}", e);
        }
    }

    /// Listen on a UI-visible channel. Dropping the returned subscription
    /// stops delivery.
    pub fn subscribe(
        &self,
        channel: &str,
        listener: impl Fn(&Payload) + Send + Sync + 'static,
    ) -> Result<Subscription, BridgeError> {
        self.subscribe_with(channel, |_, _| listener)
    }

    /// Subscribe a listener built from its resolved channel and id; the
    /// webview side uses it to forward each subscription under its own
    /// event name.
    pub fn subscribe_with<L>(
        &self,
        channel: &str,
        make_listener: impl FnOnce(Channel, SubscriptionId) -> L,
    ) -> Result<Subscription, BridgeError>
    where
        L: Fn(&Payload) + Send + Sync + 'static,
    {
        let channel = ui_channel(channel)?;
        Ok(self
            .router
            .subscribe_with(channel, |id| make_listener(channel, id)))
    }

    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool {
        match Channel::from_name(channel) {
            Some(channel) => self.router.unsubscribe(channel, id),
            None => false,
        }
    }

    /// Request/response over the bridge is not wired to anything yet; every
    /// call is answered with `NoHandler`.
    pub fn invoke(
        &self,
        channel: &str,
        _args: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        log::warn!("[Bridge] invoke on `{}` has no handler", channel);
        Err(BridgeError::NoHandler(channel.to_string()))
    }

    /// Only absolute http(s) links are handed to the system.
    pub fn open_external(&self, url: &str) -> Result<(), BridgeError> {
        let url = Url::parse(url.trim())?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BridgeError::UnsupportedScheme(url.scheme().to_string()));
        }
        log::info!("[Bridge] Opening {}", url);
        self.opener.open(&url).map_err(BridgeError::Open)
    }

    pub fn status(&self) -> WorkerStatus {
        self.supervisor.status()
    }

    /// Tell `host-ready` subscribers the page finished loading.
    pub fn announce_host_ready(&self, timestamp: String) {
        log::debug!("[Bridge] Host ready at {}", timestamp);
        self.router
            .publish(Channel::HostReady, Payload::Text(timestamp));
    }

    /// Host shutdown. Stops the worker; safe to call again.
    pub fn shutdown(&self) {
        self.supervisor.terminate();
    }
}

/// Event a single subscription is forwarded under, e.g. `worker-message-7`.
/// Distinct per subscription so two listeners on one page never see each
/// other's deliveries.
pub fn event_name(channel: Channel, id: SubscriptionId) -> String {
    format!("{}-{}", channel.name(), id.0)
}

fn ui_channel(name: &str) -> Result<Channel, BridgeError> {
    let channel =
        Channel::from_name(name).ok_or_else(|| BridgeError::UnknownChannel(name.to_string()))?;
    if !channel.is_ui_visible() {
        return Err(BridgeError::NotSubscribable(name.to_string()));
    }
    Ok(channel)
}
