//! Gateway: runtime assembly plus a small HTTP health endpoint.
//!
//! The gateway owns the process lifecycle: it builds the runtime, starts channels and
//! schedulers, serves `GET /`, and shuts everything down on Ctrl+C or SIGTERM.

mod runtime;
mod server;

pub use runtime::{build_backend, Runtime, Running};
pub use server::{router, run_gateway, run_gateway_until};
