//! Real-time presence and notification delivery.
//!
//! The [`ConnectionRegistry`] tracks live WebSocket connections per user and
//! drives the [`PresenceBroadcaster`] on a user's first connect and last
//! disconnect. Targeted events go through the [`GroupRouter`], which only
//! reaches the connections of the addressed user. Delivery is best-effort and
//! at-most-once; a client that was offline, or whose outbound queue is full,
//! re-fetches state on reconnect.

pub mod connection;
pub mod presence;
pub mod registry;
pub mod router;

pub use presence::{PresenceBroadcaster, PresenceFeed};
pub use registry::{ConnectionRecord, ConnectionRegistry, EventSender, OUTBOUND_QUEUE_CAPACITY};
pub use router::GroupRouter;
