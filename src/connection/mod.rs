//! Long-lived push connection to the remote agent.
//!
//! [`Supervisor`] holds the reconnection state machine; [`ConnectionService`]
//! runs it on a tokio task against an [`EventTransport`].

mod service;
mod supervisor;
mod transport;

pub use service::ConnectionService;
pub use supervisor::{
    AttemptId, Backoff, ConnectionState, ReadyState, Supervisor, SupervisorAction, TransportSignal,
};
pub use transport::{EventTransport, HttpEventTransport, MessageStream};
