//! Outbound side of the pipeline: the event sender and the heartbeat.

pub mod heartbeat;
pub mod sender;

pub use heartbeat::HeartbeatTask;
pub use sender::EventSenderTask;

/// Header carrying the Observability service-account key.
pub const SERVICE_ACCOUNT_KEY_HEADER: &str = "ServiceAccountAuthenticationKey";

pub(crate) const UNAUTHORIZED_MESSAGE: &str =
    "unable to authorize with the Observability service, invalid service account key; \
     verify whether the key has expired";
