//! Container-event integration: runtime abstraction, label parsing, the
//! watcher, and the route synchronizer.

pub mod labels;
pub mod runtime;
pub mod synchronizer;
pub mod watcher;

pub use runtime::{ContainerEvent, ContainerEventType, ContainerRuntime};
pub use watcher::Watcher;
