// src/core/requests/mod.rs

//! Typed request surfaces: one handler per remote party (workers,
//! coordinators). Each handler owns its TLS material and retry policy and
//! parses wire strings into core enums at this boundary.

pub mod coordinator;
pub mod server;

pub use coordinator::CoordinatorRequestHandler;
pub use server::ServerRequestHandler;
