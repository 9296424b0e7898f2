//! qbox is an HTTP saga coordination sidecar.
//!
//! It sits in front of a service, matches inbound requests against
//! declarative YAML configuration, and turns each match into a distributed
//! transaction: the configured downstream calls are dispatched in order,
//! and if any of them fails, compensating requests are issued for every
//! call that already completed. Traffic that matches nothing is proxied
//! through untouched.
//!
//! The pieces, bottom up:
//!
//! - [`tree`]: the per-saga request tree (root request, transactions,
//!   compensations) that all interpolation reads from.
//! - [`interpolate`]: the `${...}` template language available in
//!   configured URLs, header values, and bodies.
//! - [`client`]: the outbound HTTP seam, injectable for tests.
//! - [`config`]: typed view over the validated YAML configuration stream.
//! - [`saga`]: the coordinator driving one saga to a terminal state.
//! - [`matcher`]: decides saga-versus-passthrough for each request.
//! - [`gateway`]: the axum front-end tying it all together.

pub mod client;
pub mod config;
pub mod gateway;
pub mod interpolate;
pub mod matcher;
pub mod saga;
pub mod tree;
