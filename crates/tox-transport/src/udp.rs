//! UDP packet transport on a tokio socket.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tox_core::{WireError, MAX_DATAGRAM_SIZE};

use crate::error::TransportError;
use crate::transport::{Datagram, PacketTransport};

/// Receive buffer, large enough for anything the socket can return.
const RECV_BUFFER_SIZE: usize = 65536;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    closing: AsyncMutex<()>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        debug!("UDP transport bound to {}", local_addr);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            shutdown,
            recv_task: Mutex::new(None),
            closing: AsyncMutex::new(()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn recv_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.recv_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    sink: mpsc::Sender<Datagram<SocketAddr>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => {
                    let datagram = Datagram {
                        data: Bytes::copy_from_slice(&buf[..len]),
                        from,
                    };
                    if sink.send(datagram).await.is_err() {
                        break;
                    }
                }
                // ICMP errors surface here on some platforms; the socket stays usable.
                Err(e) => warn!("UDP receive error: {}", e),
            }
        }
    }
}

impl PacketTransport for UdpTransport {
    type Addr = SocketAddr;

    async fn send(&self, data: Bytes, to: &SocketAddr) -> Result<(), TransportError> {
        let closed = *self.shutdown.borrow();
        if closed {
            return Err(TransportError::Closed);
        }
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(WireError::TooLarge(data.len(), MAX_DATAGRAM_SIZE).into());
        }
        self.socket.send_to(&data, to).await?;
        Ok(())
    }

    fn register_inbound(&self, sink: mpsc::Sender<Datagram<SocketAddr>>) {
        let task = tokio::spawn(recv_loop(
            self.socket.clone(),
            sink,
            self.shutdown.subscribe(),
        ));
        if let Some(previous) = self.recv_task().replace(task) {
            previous.abort();
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let _closing = self.closing.lock().await;
        self.shutdown.send_replace(true);
        let task = self.recv_task().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("UDP receive task failed: {}", e);
                }
            }
        }
        Ok(())
    }
}
