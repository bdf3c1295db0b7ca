//! Socket plumbing for the link to a parent message director.
//!
//! [`UpstreamLink`] queues control and relayed datagrams; this module drains
//! that queue onto the socket and feeds everything the parent sends back into
//! the local director. Either side failing marks the link lost.

use crate::metrics;
use astron_core::{MessageDirector, Participant, UpstreamLink};
use astron_transport::{DatagramReader, DatagramWriter, TcpConnection};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Start the reader and writer tasks for an established parent connection.
pub fn spawn(
    conn: TcpConnection,
    link: Arc<UpstreamLink>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    director: Arc<MessageDirector>,
) {
    info!(parent = %conn.peer_addr(), "Upstream link established");
    let (reader, writer) = conn.split();
    tokio::spawn(write_loop(writer, outbound, link.clone()));
    tokio::spawn(read_loop(reader, link, director));
}

async fn write_loop(
    mut writer: impl DatagramWriter,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    link: Arc<UpstreamLink>,
) {
    loop {
        tokio::select! {
            () = link.lost() => break,
            next = outbound.recv() => {
                let Some(datagram) = next else { break };
                let len = datagram.len();
                if let Err(e) = writer.send(datagram).await {
                    metrics::record_error("upstream_write");
                    link.terminate(&format!("write failed: {}", e));
                    break;
                }
                metrics::record_datagram(len, "upstream_out");
            }
        }
    }
    let _ = writer.close().await;
    debug!("Upstream writer stopped");
}

async fn read_loop(
    mut reader: impl DatagramReader,
    link: Arc<UpstreamLink>,
    director: Arc<MessageDirector>,
) {
    loop {
        tokio::select! {
            () = link.lost() => break,
            received = reader.recv() => match received {
                Ok(Some(datagram)) => {
                    metrics::record_datagram(datagram.len(), "upstream_in");
                    if director.receive_from_upstream(datagram).await.is_err() {
                        link.terminate("message director shut down");
                        break;
                    }
                }
                Ok(None) => {
                    link.terminate("connection closed by parent");
                    break;
                }
                Err(e) => {
                    metrics::record_error("upstream_read");
                    link.terminate(&format!("read failed: {}", e));
                    break;
                }
            }
        }
    }
    debug!("Upstream reader stopped");
}
