//! Runtime services around the broker: the durable notification worker,
//! the ambiguity-postponement manager, the per-chat notification command,
//! and transport-side message chunking.

mod commands;
mod format;
mod notifier;
mod postponement;

pub use commands::handle_notify_command;
pub use format::split_for_transport;
pub use notifier::ChatTransport;
pub use notifier::NotificationWorker;
pub use postponement::PendingClarification;
pub use postponement::PostponementManager;
