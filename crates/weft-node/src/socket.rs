//! Virtual datagram sockets
//!
//! A [`MeshSocket`] is the application-facing handle for sending and
//! receiving datagram payloads over the mesh, bound to one virtual UDP
//! port. Delivery arrives through the node's dispatch loop; the socket
//! owns the receiving end of its queue and releases its port on drop.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use weft_core::VirtualAddress;

use crate::error::NodeResult;
use crate::node::MeshNode;
use crate::ports::Protocol;

/// One received datagram, as handed to a bound socket.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// The sender's overlay address.
    pub from: VirtualAddress,
    /// The sender's source port.
    pub from_port: u16,
    pub payload: Bytes,
}

/// A virtual datagram socket bound to one local port.
///
/// Created through [`MeshNode::open_socket`]. Dropping the socket releases
/// its port; packets delivered afterward are logged and discarded.
#[derive(Debug)]
pub struct MeshSocket {
    node: Arc<MeshNode>,
    port: u16,
    rx: mpsc::Receiver<Datagram>,
}

impl MeshSocket {
    pub(crate) fn new(node: Arc<MeshNode>, port: u16, rx: mpsc::Receiver<Datagram>) -> Self {
        Self { node, port, rx }
    }

    /// The local virtual port this socket is bound to.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// The owning node's overlay address.
    pub fn local_addr(&self) -> VirtualAddress {
        self.node.local_address()
    }

    /// Send a datagram payload to `(dest, dest_port)`.
    ///
    /// Unicast sends fail with `NoRouteToHost` when the destination is
    /// unknown; broadcast sends fan out to every usable link.
    pub async fn send_to(
        &self,
        dest: VirtualAddress,
        dest_port: u16,
        payload: &[u8],
    ) -> NodeResult<()> {
        self.node
            .send_datagram(self.port, dest, dest_port, payload)
            .await
    }

    /// Receive the next delivered datagram.
    ///
    /// Returns `None` once the node has shut down and the queue is drained.
    pub async fn recv(&mut self) -> Option<Datagram> {
        self.rx.recv().await
    }
}

impl Drop for MeshSocket {
    fn drop(&mut self) {
        self.node.release_port(Protocol::Udp, self.port);
    }
}
