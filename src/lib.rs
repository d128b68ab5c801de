//! # linkwire
//!
//! Composable RPC core: a procedure engine on the server, a link chain on
//! the client, and the wire framing between them.
//!
//! ## Architecture
//!
//! - **Server**: procedures registered on a [`Router`](server::Router) run
//!   through ordered middleware that grows a per-call context. Errors are
//!   normalized at the engine boundary and shaped once by a formatter.
//! - **Client**: operations travel through an ordered chain of links
//!   (logging, retry, splitting) into a terminal link that batches them,
//!   sends them one by one, or multiplexes them over a connection.
//! - **Wire**: JSON envelopes, batches answered as an array or streamed
//!   as indexed entries, and binary frames for persistent connections.
//!
//! Subscriptions and link results are [`Observable`](observable::Observable)
//! streams with explicit teardown.
//!
//! ## Example
//!
//! ```
//! use linkwire::client::links::LocalLink;
//! use linkwire::client::RpcClient;
//! use linkwire::server::{ProcedureBuilder, Router, Server};
//!
//! # tokio_test_block(async {
//! let router = Router::builder()
//!     .register("greet", ProcedureBuilder::new().query(|name: String, _| async move {
//!         Ok(format!("hello {name}"))
//!     }))?
//!     .build();
//!
//! let client = RpcClient::builder()
//!     .link(LocalLink::new(Server::new(router)))
//!     .build();
//!
//! let greeting: String = client.query("greet", "ann").await.unwrap();
//! assert_eq!(greeting, "hello ann");
//! # Ok::<(), linkwire::LinkwireError>(())
//! # }).unwrap();
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod context;
pub mod envelope;
pub mod error;
pub mod observable;
pub mod protocol;
pub mod rpc_error;
pub mod server;
pub mod transport;
pub mod validator;

mod writer;

pub use client::RpcClient;
pub use error::LinkwireError;
pub use rpc_error::{ClientError, ErrorKind, NormalizedError};
pub use server::{ProcedureBuilder, Router, Server};
