//! Step invoker implementations.

pub mod http;

pub use http::HttpServiceInvoker;
