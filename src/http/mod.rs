//! HTTP protocol plumbing for connectors.
//!
//! Just enough HTTP/1.1 to move requests into the dispatch engine and
//! responses back out.
//!
//! - **`connection`**: per-connection request/response state machine
//! - **`parser`**: parses incoming requests from byte buffers
//! - **`request`**: the request as it travels through the interceptor pipeline
//! - **`response`**: responses with a builder and in-place mutation for handlers
//! - **`writer`**: serializes and writes responses to the client
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for incoming request data
//!        └──────┬──────┘
//!               │ Request received
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Dispatch engine on a blocking worker
//!        └──────┬───────────┘
//!               │ Response ready
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← Send response to client
//!        └──────┬───────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```

pub mod connection;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;

pub use request::{Method, Request, RequestBuilder};
pub use response::{Response, ResponseBuilder, StatusCode};
