//! Non-blocking handles for in-flight database calls.
//!
//! A transport hands out one [`Resolver`] per call and keeps it until the
//! remote side answers; the caller holds the matching [`RpcFuture`]. The
//! future is only ever polled, never awaited, so the game loop can check it
//! once per tick without blocking.

use shared::rpc::{
    Birthday, FinishChat, MapFound, PlayerScore, RandomMap, Response, TeamSave, Text, Time,
};
use tokio::sync::oneshot::{self, error::TryRecvError};

use super::error::{RpcError, RpcResult};

pub type Reply = RpcResult<Response>;

/// Sending half of a call. Dropping it without sending settles the future
/// with a transport error.
pub type Resolver = oneshot::Sender<Reply>;

/// Typed view of a [`Response`] variant.
pub trait FromResponse: Sized {
    fn from_response(response: Response) -> RpcResult<Self>;
}

macro_rules! from_response {
    ($($ty:ident),* $(,)?) => {
        $(
            impl FromResponse for $ty {
                fn from_response(response: Response) -> RpcResult<Self> {
                    match response {
                        Response::$ty(value) => Ok(value),
                        other => Err(RpcError::Service(format!(
                            "expected {} response, got {:?}",
                            stringify!($ty),
                            other
                        ))),
                    }
                }
            }
        )*
    };
}

from_response!(Time, Birthday, PlayerScore, Text, MapFound, RandomMap, FinishChat, TeamSave);

impl FromResponse for () {
    fn from_response(response: Response) -> RpcResult<Self> {
        match response {
            Response::Ack => Ok(()),
            other => Err(RpcError::Service(format!(
                "expected Ack response, got {:?}",
                other
            ))),
        }
    }
}

/// Placeholder for a result that is not available yet.
///
/// `is_ready` is monotonic: once it returns true it always does. The settled
/// value is cached, so `take` can be called repeatedly and returns the same
/// result every time without touching the transport again.
#[derive(Debug)]
pub struct RpcFuture<R> {
    receiver: Option<oneshot::Receiver<Reply>>,
    settled: Option<RpcResult<R>>,
}

impl<R: FromResponse + Clone> RpcFuture<R> {
    pub fn new(receiver: oneshot::Receiver<Reply>) -> Self {
        Self {
            receiver: Some(receiver),
            settled: None,
        }
    }

    /// Creates a future that is already settled.
    pub fn resolved(result: RpcResult<R>) -> Self {
        Self {
            receiver: None,
            settled: Some(result),
        }
    }

    /// Creates an unsettled future together with its resolver.
    pub fn channel() -> (Resolver, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self::new(rx))
    }

    pub fn is_ready(&mut self) -> bool {
        if self.settled.is_some() {
            return true;
        }
        let Some(receiver) = self.receiver.as_mut() else {
            return false;
        };
        let settled = match receiver.try_recv() {
            Ok(reply) => reply.and_then(R::from_response),
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Closed) => Err(RpcError::Transport("connection closed".to_string())),
        };
        self.settled = Some(settled);
        self.receiver = None;
        true
    }

    /// Returns the settled result, or `None` while the call is in flight.
    pub fn take(&mut self) -> Option<RpcResult<R>> {
        if self.is_ready() {
            self.settled.clone()
        } else {
            None
        }
    }
}
