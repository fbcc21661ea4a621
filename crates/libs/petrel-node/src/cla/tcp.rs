//! Stream convergence layer over TCP: magic-prefixed length framing with
//! idle keepalives. The daemon's backoff schedule drives reconnection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use petrel_bp::BundleProtocol;

use crate::cla::{ConvergenceLayer, InterfaceParams};
use crate::contacts::LinkRef;
use crate::daemon::DaemonHandle;
use crate::error::NodeError;
use crate::event::{BundleEvent, ContactDownReason, EventSource};

const MAGIC: [u8; 4] = *b"dtn!";
const MAX_FRAME: u32 = 64 * 1024 * 1024;
const KEEPALIVE: Duration = Duration::from_secs(10);

struct ContactState {
    kick_tx: mpsc::UnboundedSender<()>,
    cancel: CancellationToken,
}

pub struct TcpCla {
    protocol: BundleProtocol,
    contacts: Mutex<HashMap<String, ContactState>>,
}

impl TcpCla {
    pub fn new(protocol: BundleProtocol) -> Self {
        Self { protocol, contacts: Mutex::new(HashMap::new()) }
    }

    fn contacts(&self) -> std::sync::MutexGuard<'_, HashMap<String, ContactState>> {
        self.contacts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    stream.write_all(&MAGIC).await?;
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

/// Read one frame; a zero-length frame is a keepalive and yields None.
async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, NodeError> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await?;
    if header[..4] != MAGIC {
        return Err(NodeError::Protocol("bad tcp frame magic".into()));
    }
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME {
        return Err(NodeError::Protocol(format!("tcp frame of {len} bytes")));
    }
    if len == 0 {
        return Ok(None);
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn receive_loop(
    mut stream: TcpStream,
    protocol: BundleProtocol,
    daemon: DaemonHandle,
    cancel: CancellationToken,
    peer: String,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut stream) => match frame {
                Ok(Some(payload)) => match protocol.consume_all(&payload) {
                    Ok(bundle) => daemon.post(BundleEvent::BundleReceived {
                        bundle: Arc::new(bundle),
                        source: EventSource::Peer,
                        bytes: payload.len() as u64,
                        link: None,
                    }),
                    Err(e) => {
                        // Framing survived but the image is junk; reset
                        // the connection per protocol-error policy.
                        log::warn!("cla/tcp: bad bundle from {}: {}", peer, e);
                        break;
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    log::debug!("cla/tcp: connection from {} closed: {}", peer, e);
                    break;
                }
            },
        }
    }
}

#[async_trait]
impl ConvergenceLayer for TcpCla {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn start_interface(
        &self,
        params: InterfaceParams,
        daemon: DaemonHandle,
    ) -> Result<(), NodeError> {
        let listener = TcpListener::bind(&params.local_addr).await?;
        log::info!("cla/tcp: interface {} on {}", params.name, params.local_addr);
        let protocol = self.protocol.clone();
        let cancel = daemon.cancel_token().child_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            log::debug!("cla/tcp({}): connection from {}", params.name, peer);
                            tokio::spawn(receive_loop(
                                stream,
                                protocol.clone(),
                                daemon.clone(),
                                cancel.child_token(),
                                peer.to_string(),
                            ));
                        }
                        Err(e) => {
                            log::warn!("cla/tcp({}): accept: {}", params.name, e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                }
            }
        });
        Ok(())
    }

    async fn open_contact(&self, link: LinkRef, daemon: DaemonHandle) -> Result<(), NodeError> {
        let mut stream = match TcpStream::connect(&link.nexthop).await {
            Ok(s) => s,
            Err(e) => {
                // Signal the break so the daemon reschedules with backoff.
                daemon.post(BundleEvent::ContactDown {
                    link: link.name.clone(),
                    reason: ContactDownReason::Broken,
                });
                return Err(NodeError::TransientIo(format!(
                    "connect {} failed: {e}",
                    link.nexthop
                )));
            }
        };
        log::info!("cla/tcp({}): connected to {}", link.name, link.nexthop);

        let cancel = daemon.cancel_token().child_token();
        let (kick_tx, mut kick_rx) = mpsc::unbounded_channel::<()>();
        self.contacts()
            .insert(link.name.clone(), ContactState { kick_tx, cancel: cancel.clone() });

        let protocol = self.protocol.clone();
        let link_for_task = link.clone();
        let daemon_for_task = daemon.clone();
        tokio::spawn(async move {
            let link = link_for_task;
            let daemon = daemon_for_task;
            let mut keepalive = tokio::time::interval(KEEPALIVE);
            'contact: loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = kick_rx.recv() => {}
                    _ = keepalive.tick() => {
                        if let Err(e) = write_frame(&mut stream, &[]).await {
                            log::debug!("cla/tcp({}): keepalive: {}", link.name, e);
                            daemon.post(BundleEvent::ContactDown {
                                link: link.name.clone(),
                                reason: ContactDownReason::Broken,
                            });
                            break;
                        }
                    }
                }
                while let Some(bundle) = link.start_next() {
                    let image = match protocol
                        .prepare_blocks(&bundle, &link.name)
                        .and_then(|xmit| protocol.produce_all(&bundle, &xmit))
                    {
                        Ok(image) => image,
                        Err(e) => {
                            log::error!("cla/tcp({}): serialize {}: {}", link.name, bundle, e);
                            daemon.post(BundleEvent::BundleTransmitFailed {
                                bundle,
                                link: link.name.clone(),
                            });
                            continue;
                        }
                    };
                    match write_frame(&mut stream, &image).await {
                        Ok(()) => daemon.post(BundleEvent::BundleTransmitted {
                            bundle,
                            link: link.name.clone(),
                            bytes_sent: image.len() as u64,
                            acked: true,
                        }),
                        Err(e) => {
                            log::warn!("cla/tcp({}): send: {}", link.name, e);
                            daemon.post(BundleEvent::BundleTransmitFailed {
                                bundle,
                                link: link.name.clone(),
                            });
                            daemon.post(BundleEvent::ContactDown {
                                link: link.name.clone(),
                                reason: ContactDownReason::Broken,
                            });
                            break 'contact;
                        }
                    }
                }
            }
        });

        daemon.post(BundleEvent::ContactUp { link: link.name.clone() });
        Ok(())
    }

    async fn close_contact(&self, link_name: &str) {
        if let Some(contact) = self.contacts().remove(link_name) {
            contact.cancel.cancel();
        }
    }

    fn notify_queued(&self, link_name: &str) {
        if let Some(contact) = self.contacts().get(link_name) {
            let _ = contact.kick_tx.send(());
        }
    }
}
