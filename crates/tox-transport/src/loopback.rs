//! In-memory packet network.
//!
//! Endpoints created from one [`LoopbackNetwork`] can reach each other by
//! name. Delivery behaves like UDP on a quiet link: datagrams to a full or
//! unregistered inbox are dropped silently, and datagrams larger than a UDP
//! payload are refused.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use tox_core::{WireError, MAX_DATAGRAM_SIZE};

use crate::error::TransportError;
use crate::transport::{Datagram, PacketTransport};

/// Name of a loopback endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopbackAddr(pub String);

impl fmt::Display for LoopbackAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LoopbackAddr {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

type Inbox = Arc<Mutex<Option<mpsc::Sender<Datagram<LoopbackAddr>>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared medium for loopback endpoints.
#[derive(Default)]
pub struct LoopbackNetwork {
    endpoints: Mutex<HashMap<LoopbackAddr, Inbox>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach an endpoint named `name`, replacing any endpoint of that name.
    pub fn endpoint(self: &Arc<Self>, name: &str) -> Arc<LoopbackTransport> {
        let addr = LoopbackAddr::from(name);
        let inbox: Inbox = Arc::new(Mutex::new(None));
        lock(&self.endpoints).insert(addr.clone(), inbox.clone());

        Arc::new(LoopbackTransport {
            addr,
            network: self.clone(),
            inbox,
            closed: AtomicBool::new(false),
        })
    }

    fn deliver(&self, datagram: Datagram<LoopbackAddr>, to: &LoopbackAddr) -> bool {
        let Some(inbox) = lock(&self.endpoints).get(to).cloned() else {
            return false;
        };
        let sink = lock(&inbox).clone();
        match sink {
            Some(sink) => {
                if sink.try_send(datagram).is_err() {
                    debug!("loopback: inbox of {} full or closed, dropping", to);
                }
            }
            None => debug!("loopback: {} has no receiver, dropping", to),
        }
        true
    }

    fn detach(&self, addr: &LoopbackAddr, inbox: &Inbox) {
        let mut endpoints = lock(&self.endpoints);
        if endpoints
            .get(addr)
            .is_some_and(|current| Arc::ptr_eq(current, inbox))
        {
            endpoints.remove(addr);
        }
    }
}

/// One endpoint on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    addr: LoopbackAddr,
    network: Arc<LoopbackNetwork>,
    inbox: Inbox,
    closed: AtomicBool,
}

impl LoopbackTransport {
    pub fn local_addr(&self) -> &LoopbackAddr {
        &self.addr
    }
}

impl PacketTransport for LoopbackTransport {
    type Addr = LoopbackAddr;

    async fn send(&self, data: Bytes, to: &LoopbackAddr) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(WireError::TooLarge(data.len(), MAX_DATAGRAM_SIZE).into());
        }
        let datagram = Datagram {
            data,
            from: self.addr.clone(),
        };
        if self.network.deliver(datagram, to) {
            Ok(())
        } else {
            Err(TransportError::Unreachable(to.to_string()))
        }
    }

    fn register_inbound(&self, sink: mpsc::Sender<Datagram<LoopbackAddr>>) {
        *lock(&self.inbox) = Some(sink);
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            lock(&self.inbox).take();
            self.network.detach(&self.addr, &self.inbox);
        }
        Ok(())
    }
}
