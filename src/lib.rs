//! Concurrent HTTP/1.x caching forward proxy.
//!
//! The binary (`src/main.rs`) wires these pieces together: accept a
//! connection, run it through [`pipeline::parse_request`], consult the
//! shared [`cache::ObjectCache`], and either serve a hit or fetch from the
//! origin via [`pipeline::forward_client_request`] before writing the
//! response back with [`pipeline::forward_server_response`].

pub mod cache;
pub mod error;
pub mod io;
pub mod pipeline;

pub use cache::{fingerprint, ObjectCache};
pub use error::{ProxyError, ProxyResult};
pub use pipeline::{forward_client_request, forward_server_response, parse_request, parse_url, Request, Response};
