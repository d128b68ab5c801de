//! Client side: the link chain, transports and the typed facade.
//!
//! ```
//! use linkwire::client::links::{BatchLink, LocalLink, LoggerLink, SplitLink};
//! use linkwire::client::{Link, LocalTransport, RpcClient};
//! use linkwire::server::{ProcedureBuilder, Router, Server};
//! use std::sync::Arc;
//!
//! # tokio_test_block(async {
//! let router = Router::builder()
//!     .register("add", ProcedureBuilder::new().query(|(a, b): (i64, i64), _| async move {
//!         Ok(a + b)
//!     }))
//!     .unwrap()
//!     .build();
//! let server = Server::new(router);
//!
//! let client = RpcClient::builder()
//!     .link(LoggerLink::new())
//!     .link(SplitLink::subscriptions(
//!         vec![Arc::new(LocalLink::new(server.clone())) as Arc<dyn Link>],
//!         vec![Arc::new(BatchLink::new(LocalTransport::new(server))) as Arc<dyn Link>],
//!     ))
//!     .build();
//!
//! let sum: i64 = client.query("add", &(2, 3)).await.unwrap();
//! assert_eq!(sum, 5);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f);
//! # }
//! ```

mod link;
pub mod links;
mod rpc;
mod transport;

pub use link::{link_fn, Link, LinkChain, LinkNext, OperationStream};
pub use rpc::{CallOptions, RpcClient, RpcClientBuilder};
pub use transport::{LocalTransport, Transport, TransportResponse};
