//! Client side of the score database protocol.
//!
//! Call sites use [`DatabaseClient`], which returns an [`RpcFuture`] per
//! call. How requests travel is up to the [`RpcTransport`] behind it.

pub mod client;
pub mod error;
pub mod future;
pub mod manual;
pub mod transport;

pub use client::{DatabaseClient, RpcTransport};
pub use error::{RpcError, RpcResult};
pub use future::{FromResponse, RpcFuture};
pub use manual::ManualTransport;
pub use transport::{OfflineTransport, TcpTransport};
