//! dormant-gateway — the HTTP front door.
//!
//! Every inbound request names its target resource in a routing header.
//! The gateway makes sure that resource is active, then forwards the
//! request to `{resource}:{target_port}` and relays the answer verbatim.
//!
//! ```text
//! client ──▶ GatewayServer ──▶ Gateway::handle
//!                                 │ target header?   no ──▶ 400
//!                                 │ RequestTracker::record
//!                                 │ Coordinator::ensure_active
//!                                 │      timeout ──▶ 504, failure ──▶ 502
//!                                 └▶ proxy to resource
//!                                        unreachable ──▶ 502, slow ──▶ 504
//! ```
//!
//! The [`RequestTracker`] doubles as the default metric source for the
//! scale-down path.

pub mod handler;
pub mod server;
pub mod tracker;

pub use handler::{Gateway, GatewayError, MAX_REQUEST_BODY};
pub use server::GatewayServer;
pub use tracker::RequestTracker;
