//! TCP connection management.
//!
//! One task pair per connection: the read loop decodes frames and routes
//! them to the coordinator, the write loop drains an outbound channel that
//! carries both request replies and coordinator-initiated pushes (unsigned
//! PSBT, round failed/restart). Each connection gets a fresh random peer
//! id; a peer using Alice and Bob roles over separate connections is two
//! unrelated ids to the coordinator, which is exactly the point.

use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vortex_common::protocol::{ErrorMessage, RegisterOutputAck};
use vortex_common::{PeerId, VortexError};

use crate::coordinator::CoordinatorHandle;
use crate::wire::{read_frame, write_frame, Frame};

/// Outbound queue depth per connection.
const OUTBOUND_BUFFER: usize = 64;

/// A fresh connection identifier: SHA256 of 32 random bytes.
fn random_peer_id() -> PeerId {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    PeerId::from_bytes(Sha256::digest(bytes).into())
}

/// Spawn the accept loop.
pub fn spawn_listener(listener: TcpListener, handle: CoordinatorHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string())
        );
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        debug!("Accepted connection from {}", addr);
                        handle_connection(stream, handle).await;
                    });
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    })
}

async fn handle_connection(stream: TcpStream, handle: CoordinatorHandle) {
    stream.set_nodelay(true).ok();
    let peer_id = random_peer_id();
    let (read_half, mut write_half) = stream.into_split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);
    if handle.peer_connected(peer_id, outbound_tx.clone()).await.is_err() {
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &frame).await {
                debug!("Write to peer failed: {}", e);
                break;
            }
        }
    });

    read_loop(read_half, peer_id, &handle, &outbound_tx).await;

    let _ = handle.peer_disconnected(peer_id).await;
    writer.abort();
    debug!("Peer {} connection closed", peer_id);
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    peer_id: PeerId,
    handle: &CoordinatorHandle,
    outbound: &mpsc::Sender<Frame>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(VortexError::Codec(msg)) => {
                debug!("Peer {} sent an undecodable frame: {}", peer_id, msg);
                break;
            }
            Err(_) => break,
        };

        let reply = dispatch(frame, peer_id, handle).await;
        if let Some(reply) = reply {
            if outbound.send(reply).await.is_err() {
                break;
            }
        }
    }
}

/// Route one inbound frame to the coordinator and shape the reply.
async fn dispatch(frame: Frame, peer_id: PeerId, handle: &CoordinatorHandle) -> Option<Frame> {
    match frame {
        Frame::AskNonce(ask) => Some(match handle.get_nonce(peer_id, ask).await {
            Ok(msg) => Frame::Nonce(msg),
            Err(e) => error_frame(e),
        }),
        Frame::AskMixDetails(ask) => Some(match handle.mix_details(ask.network).await {
            Ok(msg) => Frame::MixDetails(msg),
            Err(e) => error_frame(e),
        }),
        Frame::RegisterInputs(msg) => Some(match handle.register_inputs(peer_id, msg).await {
            Ok(sig) => Frame::BlindedSig(sig),
            Err(e) => error_frame(e),
        }),
        // A rejected Bob gets `accepted: false`, never an error detail and
        // never a ban: its id is unrelated to any Alice.
        Frame::Bob(msg) => Some(match handle.register_output(msg).await {
            Ok(ack) => Frame::OutputAck(ack),
            Err(e) => {
                debug!("Rejected output registration: {}", e);
                Frame::OutputAck(RegisterOutputAck { accepted: false })
            }
        }),
        Frame::SignedPsbt(msg) => match handle.register_signature(peer_id, msg).await {
            Ok(()) => None,
            Err(e) => Some(error_frame(e)),
        },
        other => {
            debug!("Peer {} sent unexpected frame tag {}", peer_id, other.tag());
            Some(Frame::Error(ErrorMessage {
                message: "unexpected message".to_string(),
            }))
        }
    }
}

fn error_frame(e: VortexError) -> Frame {
    Frame::Error(ErrorMessage {
        message: e.to_string(),
    })
}
