//! In-process transport whose calls are answered by hand.
//!
//! Every issued request is recorded together with its resolver. The holder
//! decides when, in which order and with which result each call settles,
//! which makes latency, reordering and failures easy to reproduce.

use shared::rpc::{Request, Response};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;

use super::client::RpcTransport;
use super::error::RpcError;
use super::future::{Reply, Resolver};

struct Call {
    id: u64,
    request: Request,
    resolver: Resolver,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    issued: Vec<Request>,
    pending: VecDeque<Call>,
}

#[derive(Default)]
pub struct ManualTransport {
    inner: Mutex<Inner>,
}

impl ManualTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicking test thread must not hide the recorded calls.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// All requests issued so far, oldest first.
    pub fn issued(&self) -> Vec<Request> {
        self.lock().issued.clone()
    }

    /// Ids of the calls still waiting for an answer, oldest first.
    pub fn pending_ids(&self) -> Vec<u64> {
        self.lock().pending.iter().map(|call| call.id).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Request of a pending call.
    pub fn request(&self, id: u64) -> Option<Request> {
        self.lock()
            .pending
            .iter()
            .find(|call| call.id == id)
            .map(|call| call.request.clone())
    }

    /// Settles the oldest pending call. Returns false if none is pending.
    pub fn resolve_next(&self, result: Result<Response, RpcError>) -> bool {
        let call = self.lock().pending.pop_front();
        match call {
            Some(call) => {
                let _ = call.resolver.send(result);
                true
            }
            None => false,
        }
    }

    /// Settles a specific pending call.
    pub fn resolve(&self, id: u64, result: Result<Response, RpcError>) -> bool {
        let call = {
            let mut inner = self.lock();
            let position = inner.pending.iter().position(|call| call.id == id);
            position.and_then(|index| inner.pending.remove(index))
        };
        match call {
            Some(call) => {
                let _ = call.resolver.send(result);
                true
            }
            None => false,
        }
    }

    /// Settles every pending call with the result produced by `answer`.
    pub fn resolve_all<F>(&self, mut answer: F) -> usize
    where
        F: FnMut(&Request) -> Result<Response, RpcError>,
    {
        let calls: Vec<Call> = self.lock().pending.drain(..).collect();
        let count = calls.len();
        for call in calls {
            let result = answer(&call.request);
            let _ = call.resolver.send(result);
        }
        count
    }
}

impl RpcTransport for ManualTransport {
    fn issue(&self, request: Request) -> oneshot::Receiver<Reply> {
        let (resolver, receiver) = oneshot::channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.issued.push(request.clone());
        inner.pending.push_back(Call {
            id,
            request,
            resolver,
        });
        receiver
    }
}
