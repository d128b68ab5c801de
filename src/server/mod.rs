//! Server side: procedures, routing and the resolution engine.
//!
//! ```
//! use linkwire::context::Context;
//! use linkwire::envelope::RawRequest;
//! use linkwire::server::{ProcedureBuilder, Router, Server};
//!
//! # tokio_test_block(async {
//! let router = Router::builder()
//!     .register("hello", ProcedureBuilder::new().query(|name: String, _| async move {
//!         Ok(format!("hello {name}"))
//!     }))
//!     .unwrap()
//!     .build();
//! let server = Server::new(router);
//!
//! let response = server
//!     .handle_request(
//!         RawRequest::new(r#"{"path":"hello","type":"query","input":"ann"}"#),
//!         Context::new(),
//!     )
//!     .await;
//! assert_eq!(response.status, 200);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f);
//! # }
//! ```

mod connection;
mod engine;
mod middleware;
mod procedure;
mod request;
mod router;

pub use connection::{serve_connection, ConnectionConfig, DEFAULT_MAX_CONCURRENT_CALLS};
pub use engine::{ErrorHook, Server, ServerBuilder, ServerConfig, DEFAULT_MAX_BATCH_SIZE};
pub use middleware::{
    middleware_fn, LazyInput, Middleware, MiddlewareFrame, MiddlewareResult, Next,
    ProcedureOutput,
};
pub use procedure::{Procedure, ProcedureBuilder};
pub use request::MULTI_STATUS;
pub use router::{merge_routers, Router, RouterBuilder};
