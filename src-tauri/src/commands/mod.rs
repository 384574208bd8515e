/// Commands module
/// Tauri commands (IPC handlers) exposed to the webview.
/// Commands are the boundary between the frontend and the bridge core.

pub mod bridge;

pub use bridge::{TauriOpener, WindowSubscriptions};
