//! Domain logic for the growgate gateway: the wire codecs (pipe-delimited
//! text records, tank packets, variant argument lists), the packet
//! classifier, and the proxy-side state machines that do not touch the
//! network (command registry, hook bus, task scheduler, world state,
//! configuration model).
//!
//! Everything in this crate is synchronous and transport-agnostic except
//! [`scheduler`], which runs its delayed callbacks on the ambient tokio
//! runtime.

pub mod command;
pub mod config;
pub mod hooks;
pub mod packet;
pub mod scheduler;
pub mod tank;
pub mod text;
pub mod variant;
pub mod world;
