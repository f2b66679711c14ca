//! HTTP surface: admission middleware, upstream relay and server.

mod middleware;
mod server;
mod upstream;

pub use middleware::{admit, REQUEST_ID_HEADER};
pub use server::{router, HttpServer};
pub use upstream::{relay, HttpUpstream, Upstream};
