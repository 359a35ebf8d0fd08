//! Error notification stack
//!
//! Rendering, platform notifiers, dispatch, and the background queue:
//!
//! ```text
//! capture -> Dispatcher::dispatch (inline)
//!         -> NotifyQueue -> worker -> Dispatcher::dispatch (queued)
//!                                         |
//!                                         v
//!                        NotifierRegistry -> SlackNotifier / DiscordNotifier
//! ```

pub mod discord;
pub mod dispatcher;
pub mod message;
pub mod notifier;
pub mod queue;
pub mod slack;

// Re-export public types
pub use dispatcher::Dispatcher;
pub use notifier::{NotificationFailed, Notifier, NotifierFactory, NotifierRegistry};
pub use queue::NotifyQueue;
