//! Push server and its client.
//!
//! The server exposes the UnifiedPush pusher API and a long-poll delivery
//! API over HTTP. The client side is used by the relay to register ids and
//! hold the multi-id delivery connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  POST /push/id/{id}    ┌──────────────┐
//! │ App server  │───────────────────────▶│ Push server  │
//! └─────────────┘                        │  (axum)      │
//!                                        └──────┬───────┘
//!                      GET /client/multi_id/…   │ chunked JSON lines
//!                                        ┌──────▼───────┐
//!                                        │ Delivery     │
//!                                        │ listener     │
//!                                        └──────────────┘
//! ```

pub mod client;
pub mod queue;
pub mod server;
pub mod types;

pub use client::{ClientError, PushClient};
pub use queue::{ClientQueue, PushItem, QueueMap};
pub use server::{ServerError, ServerState};
pub use types::*;
