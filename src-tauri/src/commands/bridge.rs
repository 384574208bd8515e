/// Bridge Commands
/// Thin Tauri wrappers over `Bridge`. Called from the frontend via
/// `invoke("bridge_send", { channel, payload })` and friends. Each
/// `bridge_subscribe` answers with its own event name to `listen` on.
use crate::bridge::{event_name, Bridge, UrlOpener};
use crate::models::{OutboundCommand, Payload, SubscriptionId, WorkerStatus};
use crate::services::Subscription;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tauri::{AppHandle, Emitter, EventTarget, State, WebviewWindow};
use tauri_plugin_opener::OpenerExt;
use url::Url;

/// Opens links through the opener plugin
pub struct TauriOpener {
    app: AppHandle,
}

impl TauriOpener {
    pub fn new(app: AppHandle) -> Self {
        Self { app }
    }
}

impl UrlOpener for TauriOpener {
    fn open(&self, url: &Url) -> Result<(), String> {
        self.app
            .opener()
            .open_url(url.as_str(), None::<&str>)
            .map_err(|e| e.to_string())
    }
}

/// Subscriptions made by each webview window, dropped with the window.
#[derive(Default)]
pub struct WindowSubscriptions {
    by_window: Mutex<HashMap<String, HashMap<SubscriptionId, Subscription>>>,
}

impl WindowSubscriptions {
    fn insert(&self, label: &str, subscription: Subscription) -> SubscriptionId {
        let id = subscription.id();
        self.by_window
            .lock()
            .entry(label.to_string())
            .or_default()
            .insert(id, subscription);
        id
    }

    fn remove(&self, label: &str, id: SubscriptionId) -> Option<Subscription> {
        let mut by_window = self.by_window.lock();
        let subs = by_window.get_mut(label)?;
        let removed = subs.remove(&id);
        if subs.is_empty() {
            by_window.remove(label);
        }
        removed
    }

    /// Drop every subscription a window held.
    pub fn release(&self, label: &str) {
        let released = self.by_window.lock().remove(label);
        if let Some(subs) = released {
            log::debug!("[Bridge] Released {} subscriptions of `{}`", subs.len(), label);
        }
    }
}

#[tauri::command]
pub fn bridge_send(channel: String, payload: OutboundCommand, bridge: State<'_, Arc<Bridge>>) {
    bridge.send(&channel, &payload);
}

/// What the frontend gets back from `bridge_subscribe`.
#[derive(Debug, Clone, Serialize)]
pub struct EventSubscription {
    /// Pass to `bridge_unsubscribe`
    pub id: SubscriptionId,
    /// Event this subscription alone is emitted under
    pub event: String,
}

/// Start forwarding a channel to the calling window under an event name of
/// its own, so every subscription is delivered exactly once.
#[tauri::command]
pub fn bridge_subscribe(
    channel: String,
    app: AppHandle,
    window: WebviewWindow,
    bridge: State<'_, Arc<Bridge>>,
    subscriptions: State<'_, WindowSubscriptions>,
) -> Result<EventSubscription, String> {
    let label = window.label().to_string();
    let target = label.clone();

    let subscription = bridge
        .subscribe_with(&channel, move |channel, id| {
            let event = event_name(channel, id);
            move |payload: &Payload| {
                if let Err(e) =
                    app.emit_to(EventTarget::webview_window(target.as_str()), &event, payload)
                {
                    log::warn!("[Bridge] Failed to emit {} to `{}`: {}", event, target, e);
                }
            }
        })
        .map_err(|e| e.to_string())?;

    let event = event_name(subscription.channel(), subscription.id());
    let id = subscriptions.insert(&label, subscription);
    Ok(EventSubscription { id, event })
}

/// Idempotent: unknown or already removed ids return false.
#[tauri::command]
pub fn bridge_unsubscribe(
    id: SubscriptionId,
    window: WebviewWindow,
    subscriptions: State<'_, WindowSubscriptions>,
) -> bool {
    match subscriptions.remove(window.label(), id) {
        Some(subscription) => {
            subscription.unsubscribe();
            true
        }
        None => false,
    }
}

#[tauri::command]
pub fn bridge_invoke(
    channel: String,
    args: serde_json::Value,
    bridge: State<'_, Arc<Bridge>>,
) -> Result<serde_json::Value, String> {
    bridge.invoke(&channel, args).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn open_external(url: String, bridge: State<'_, Arc<Bridge>>) -> Result<(), String> {
    bridge.open_external(&url).map_err(|e| e.to_string())
}

#[tauri::command]
pub fn worker_status(bridge: State<'_, Arc<Bridge>>) -> WorkerStatus {
    bridge.status()
}
