// Notification bookkeeping - sent markers and the outbound e-mail queue

pub mod dispatcher;
pub mod tracker;

pub use dispatcher::{
    DeliveryOutcome, EmailCommand, EmailDispatcher, LoggingDispatcher, NotificationQueue,
    NotificationWorker, SendReason,
};
pub use tracker::{NotificationFlags, NotificationKind, NotificationTracker};
