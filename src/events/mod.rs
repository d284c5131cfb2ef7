//! Routing of messages pushed by the remote agent.
//!
//! - [`EventDispatcher`]: parses push messages and routes them
//! - [`ProgressThrottle`]: rate-limits knowledge-base progress
//! - [`InvestigationHandlers`]: registry that alert actions publish to

mod dispatcher;
mod handlers;
mod throttle;

pub use dispatcher::{
    investigation_prompt, AlertPayload, Dispatched, EventDispatcher, LogNotificationSink,
    Notification, NotificationAction, NotificationSink, PushEvent,
};
pub use handlers::{InvestigationHandlers, Subscription};
pub use throttle::{ProgressSnapshot, ProgressThrottle};
