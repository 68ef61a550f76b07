//! Chain listener and dialer
//!
//! A chain carries real TCP bytes across the overlay, one socket leg
//! per mesh hop. The dialer resolves the destination against the
//! routing table and opens the first leg; every relay on the path runs
//! a [`ChainListener`] that accepts the leg, reads the chain request,
//! extends the chain one hop further, and then pumps bytes both ways
//! until either side closes.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use weft_core::VirtualAddress;
use weft_routing::{NextHop, OriginatorManager};

use crate::error::{ChainError, ChainResult};
use crate::frame::ChainRequest;

/// Open a real TCP connection to `dest:dest_port` across the mesh.
///
/// - `dest` is this node: plain connection to the local service.
/// - `dest` is a neighbor: direct connection to its advertised host at
///   `dest_port`, no chain framing.
/// - `dest` is further away: connection to the next hop's chain
///   listener, opened with a [`ChainRequest`] asking it to extend the
///   chain.
pub async fn chain_connect(
    routing: &OriginatorManager,
    dest: VirtualAddress,
    dest_port: u16,
) -> ChainResult<TcpStream> {
    match routing.lookup_next_hop(dest)? {
        NextHop::Local => {
            let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, dest_port)).await?;
            Ok(stream)
        }
        NextHop::Neighbor { addr, service } => {
            let service = service.ok_or(ChainError::NoServiceEndpoint(addr))?;
            let stream = TcpStream::connect((service.ip(), dest_port)).await?;
            Ok(stream)
        }
        NextHop::Relay { via, service } => {
            let service = service.ok_or(ChainError::NoServiceEndpoint(via))?;
            let mut stream = TcpStream::connect(service).await?;
            ChainRequest::new(dest, dest_port).write_to(&mut stream).await?;
            Ok(stream)
        }
    }
}

/// Accepts chain connections and extends each one toward its requested
/// destination.
#[derive(Debug)]
pub struct ChainListener {
    local_addr: SocketAddr,
    routing: Arc<OriginatorManager>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ChainListener {
    /// Bind the listener and start accepting.
    pub async fn bind(
        bind: SocketAddr,
        routing: Arc<OriginatorManager>,
    ) -> ChainResult<Arc<Self>> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let this = Arc::new(Self {
            local_addr,
            routing,
            shutdown_tx,
        });
        info!(listen = %local_addr, "Chain listener started");
        tokio::spawn(Arc::clone(&this).accept_loop(listener, this.shutdown_tx.subscribe()));
        Ok(this)
    }

    /// The real address the listener bound, for advertising to peers.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Legs already open keep running until they close
    /// on their own.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((inbound, peer)) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = this.serve(inbound).await {
                                debug!(peer = %peer, error = %e, "Chain leg ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }
    }

    /// Serve one inbound chain connection.
    #[instrument(skip(self, inbound), fields(listen = %self.local_addr))]
    async fn serve(&self, mut inbound: TcpStream) -> ChainResult<()> {
        let request = ChainRequest::read_from(&mut inbound).await?;
        let mut onward = chain_connect(&self.routing, request.dest, request.dest_port).await?;
        debug!(dest = %request.dest, dest_port = request.dest_port, "Chain leg open");

        // When either side closes, both legs are torn down together
        let (sent, received) = copy_bidirectional(&mut inbound, &mut onward).await?;
        debug!(dest = %request.dest, sent, received, "Chain leg closed");
        Ok(())
    }
}
