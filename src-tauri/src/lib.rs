/// AppDeck host
/// Supervises the Python backend and bridges it to the webview.
///
/// Module structure:
/// - services: bridge core (framer, router, outbound encoding, supervisor)
/// - bridge: the capability surface offered to the UI
/// - config: worker location and limits
/// - models: channel namespace and payload types
/// - commands: Tauri IPC handlers (desktop feature)
pub mod bridge;
pub mod config;
pub mod error;
pub mod models;
pub mod services;

#[cfg(feature = "desktop")]
mod commands;

pub use bridge::{Bridge, SystemOpener, UrlOpener};
pub use config::{WorkerConfig, WorkerLayout, WorkerOverrides};
pub use models::{Channel, OutboundCommand, Payload, WorkerStatus};
pub use services::{Router, Subscription, Supervisor};

#[cfg(feature = "desktop")]
pub use desktop::run;

#[cfg(feature = "desktop")]
mod desktop {
    use crate::bridge::Bridge;
    use crate::commands::{self, TauriOpener, WindowSubscriptions};
    use crate::config::{WorkerLayout, WorkerOverrides};
    use crate::services::{Router, Supervisor};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tauri::webview::PageLoadEvent;
    use tauri::{Manager, RunEvent, WindowEvent};

    fn worker_layout(app: &tauri::App) -> tauri::Result<WorkerLayout> {
        if cfg!(debug_assertions) {
            // src-tauri/.. is the checkout root, next to backend/
            let project_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..");
            Ok(WorkerLayout::Development { project_root })
        } else {
            Ok(WorkerLayout::Packaged {
                resource_dir: app.path().resource_dir()?,
            })
        }
    }

    #[cfg_attr(mobile, tauri::mobile_entry_point)]
    pub fn run() {
        let log_level = if cfg!(debug_assertions) {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };

        tauri::Builder::default()
            .plugin(tauri_plugin_log::Builder::default().level(log_level).build())
            .plugin(tauri_plugin_opener::init())
            .manage(WindowSubscriptions::default())
            .setup(|app| {
                let config = worker_layout(app)?
                    .worker_config()
                    .with_overrides(WorkerOverrides::from_env());

                let supervisor = Arc::new(Supervisor::new(config, Router::new()));
                let opener = TauriOpener::new(app.handle().clone());
                let bridge = Arc::new(Bridge::new(supervisor.clone(), Box::new(opener)));
                app.manage(bridge);

                supervisor.start();
                Ok(())
            })
            .on_page_load(|webview, payload| {
                if !matches!(payload.event(), PageLoadEvent::Finished) {
                    return;
                }
                if let Some(bridge) = webview.try_state::<Arc<Bridge>>() {
                    bridge.announce_host_ready(chrono::Local::now().to_rfc3339());
                }
                // The window starts hidden to avoid a blank flash
                if let Err(e) = webview.window().show() {
                    log::warn!("Failed to show window: {}", e);
                }
            })
            .on_window_event(|window, event| {
                if let WindowEvent::Destroyed = event {
                    window
                        .state::<WindowSubscriptions>()
                        .release(window.label());
                }
            })
            .invoke_handler(tauri::generate_handler![
                commands::bridge::bridge_send,
                commands::bridge::bridge_subscribe,
                commands::bridge::bridge_unsubscribe,
                commands::bridge::bridge_invoke,
                commands::bridge::open_external,
                commands::bridge::worker_status,
            ])
            .build(tauri::generate_context!())
            .expect("error while building tauri application")
            .run(move |app_handle, event| {
                if let RunEvent::Exit = event {
                    // Stop the backend exactly once, after the last window
                    log::info!("App shutting down - stopping worker");
                    if let Some(bridge) = app_handle.try_state::<Arc<Bridge>>() {
                        bridge.shutdown();
                    }
                }
            });
    }
}
