//! Built-in links.
//!
//! Pass-through links ([`LoggerLink`], [`RetryLink`]) and routing
//! ([`SplitLink`]) sit anywhere in a chain. Terminal links end it:
//!
//! | link               | kinds                   | carrier                      |
//! |--------------------|-------------------------|------------------------------|
//! | [`BatchLink`]      | query, mutation         | [`Transport`], batched       |
//! | [`RequestLink`]    | query, mutation         | [`Transport`], one per call  |
//! | [`ConnectionLink`] | all                     | framed persistent connection |
//! | [`LocalLink`]      | all                     | in-process [`Server`]        |
//!
//! [`Transport`]: crate::client::Transport
//! [`Server`]: crate::server::Server

mod batch;
mod connection;
mod local;
mod logger;
mod request;
mod retry;
mod split;

pub use batch::{
    BatchLink, BatchLinkBuilder, BatchLinkConfig, BatchMode, BatchWindow, DEFAULT_MAX_BATCH_ITEMS,
    DEFAULT_MAX_PENDING,
};
pub use connection::ConnectionLink;
pub use local::LocalLink;
pub use logger::{Direction, LoggerLink};
pub use request::RequestLink;
pub use retry::{RetryAttempt, RetryLink};
pub use split::SplitLink;
