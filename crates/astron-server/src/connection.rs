//! Network participants: one per accepted connection.
//!
//! The read loop pushes every datagram into the director's queue. Deliveries
//! go through an unbounded channel to a writer task, so routing never waits
//! on a socket.

use crate::metrics::{self, ConnectionMetricsGuard};
use astron_core::{MessageDirector, Participant, ParticipantId};
use astron_transport::{Connection, DatagramReader, DatagramWriter, TransportError};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

/// A remote participant connected over a socket.
pub struct NetworkParticipant {
    id: ParticipantId,
    remote: String,
    outbound: mpsc::UnboundedSender<Bytes>,
    closing: Arc<Notify>,
}

impl Participant for NetworkParticipant {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn deliver(&self, datagram: Bytes) {
        if self.outbound.send(datagram).is_err() {
            trace!(participant = self.id, "Delivery to closed connection dropped");
        }
    }

    fn terminate(&self, reason: &str) {
        warn!(participant = self.id, remote = %self.remote, reason, "Terminating connection");
        self.closing.notify_one();
    }
}

/// Serve one connection until either side closes it.
pub async fn serve_connection(conn: Box<dyn Connection>, director: Arc<MessageDirector>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let remote = conn.remote_addr().unwrap_or_else(|| "unknown".to_string());
    let (reader, writer) = conn.into_split();

    let (outbound, rx) = mpsc::unbounded_channel();
    let closing = Arc::new(Notify::new());
    let participant = Arc::new(NetworkParticipant {
        id: director.next_participant_id(),
        remote,
        outbound,
        closing: closing.clone(),
    });
    let id = participant.id;
    director.register(participant.clone());
    info!(participant = id, remote = %participant.remote, "Participant connected");

    tokio::spawn(write_loop(id, writer, rx, closing.clone()));
    read_loop(id, reader, &director, &closing).await;

    // Dispatch whatever this participant already queued before removing it.
    let _ = director.sync().await;
    let name = director.name_of(id);
    if let Err(e) = director.terminate_participant(id).await {
        warn!(participant = id, error = %e, "Failed to remove participant");
    }
    info!(
        participant = id,
        remote = %participant.remote,
        name = name.as_deref().unwrap_or(""),
        "Participant disconnected"
    );
}

async fn read_loop(
    id: ParticipantId,
    mut reader: Box<dyn DatagramReader>,
    director: &MessageDirector,
    closing: &Notify,
) {
    loop {
        tokio::select! {
            () = closing.notified() => {
                debug!(participant = id, "Connection closed by router");
                break;
            }
            received = reader.recv() => match received {
                Ok(Some(datagram)) => {
                    metrics::record_datagram(datagram.len(), "inbound");
                    if director.receive_inbound(Some(id), datagram).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(participant = id, "Connection closed by peer");
                    break;
                }
                Err(TransportError::Timeout) => {
                    info!(participant = id, "Idle connection timed out");
                    break;
                }
                Err(e) => {
                    warn!(participant = id, error = %e, "Read failed");
                    metrics::record_error("read");
                    break;
                }
            }
        }
    }
}

async fn write_loop(
    id: ParticipantId,
    mut writer: Box<dyn DatagramWriter>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    closing: Arc<Notify>,
) {
    while let Some(datagram) = rx.recv().await {
        let len = datagram.len();
        if let Err(e) = writer.send(datagram).await {
            warn!(participant = id, error = %e, "Write failed");
            metrics::record_error("write");
            closing.notify_one();
            return;
        }
        metrics::record_datagram(len, "outbound");
    }

    // Every handle to the participant is gone.
    let _ = writer.close().await;
}
