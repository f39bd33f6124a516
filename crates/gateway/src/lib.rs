//! The growgate proxy runtime.
//!
//! [`transport`] pumps the two ENet hosts (the intercepted client's
//! listener and the proxy's own upstream session) on a dedicated thread;
//! [`relay`] is the single-consumer state machine every event funnels
//! through; [`web`] serves the intercepted HTTPS bootstrap and the
//! generic passthrough; [`inject`] builds and routes synthetic packets.

pub mod inject;
pub mod plugins;
pub mod relay;
pub mod resolver;
pub mod tls;
pub mod transport;
pub mod web;
