#![deny(unsafe_code)]

//! uprelay core: a UnifiedPush-style push server and the relay that feeds
//! its messages to consumer applications.
//!
//! ```text
//!  consumer ──Register/Unregister──▶ Distributor ──▶ RegistrationStore
//!     ▲                                  │  ▲
//!     │ Message/NewEndpoint/Unregistered │  │ PushMessage
//!     └────────── Dispatcher ◀───────────┘  │
//!                                  DeliveryListener ◀── push server (HTTP long-poll)
//! ```

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, for trait methods that are
/// called through `dyn Trait`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Consumer callback capability and the ordered dispatcher.
pub mod connector;
/// Process runtime and shutdown signalling.
pub mod daemon;
/// Registration protocol and message routing.
pub mod distributor;
/// Opaque string handles.
pub mod ids;
/// Multi-id long-poll client that follows the subscription set.
pub mod listener;
/// Push server, its wire format and its HTTP client.
pub mod push;
/// Token → registration store.
pub mod store;

pub use connector::{
    Connector, ConnectorError, ConnectorRegistry, ConnectorResolver, DispatchHandle, Dispatcher,
    LoggingConnector, Notification,
};
pub use daemon::{Daemon, DaemonError, Relay, ShutdownSignal};
pub use distributor::{Distributor, DistributorError, RegistrationOutcome, RegistrationResult};
pub use ids::{ServerId, ServiceName, Token};
pub use listener::{DeliveryListener, ListenerHandle, ListenerStatus, MessageSink};
pub use push::{PushClient, PushMessage};
pub use store::{RegistrationRecord, RegistrationStore, SubscriptionSet};
