/// Services module
/// The bridge core: framing, routing, the outbound encoder and the worker
/// supervisor. Nothing in here depends on the webview.

pub mod framer;
pub mod outbound;
pub mod router;
pub mod supervisor;

pub use framer::LineFramer;
pub use router::{Router, Subscription};
pub use supervisor::{Supervisor, WorkerHandle};
