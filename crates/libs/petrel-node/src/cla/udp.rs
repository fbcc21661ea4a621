//! Plain UDP convergence layer: one bundle per datagram, no reliability.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use petrel_bp::BundleProtocol;

use crate::cla::{ConvergenceLayer, InterfaceParams};
use crate::contacts::LinkRef;
use crate::daemon::DaemonHandle;
use crate::error::NodeError;
use crate::event::{BundleEvent, EventSource};

const MAX_DATAGRAM: usize = 65_507;

struct ContactState {
    kick_tx: mpsc::UnboundedSender<()>,
    cancel: CancellationToken,
}

pub struct UdpCla {
    protocol: BundleProtocol,
    contacts: Mutex<HashMap<String, ContactState>>,
}

impl UdpCla {
    pub fn new(protocol: BundleProtocol) -> Self {
        Self { protocol, contacts: Mutex::new(HashMap::new()) }
    }

    fn contacts(&self) -> std::sync::MutexGuard<'_, HashMap<String, ContactState>> {
        self.contacts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ConvergenceLayer for UdpCla {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn start_interface(
        &self,
        params: InterfaceParams,
        daemon: DaemonHandle,
    ) -> Result<(), NodeError> {
        let socket = UdpSocket::bind(&params.local_addr).await?;
        log::info!("cla/udp: interface {} on {}", params.name, params.local_addr);
        let protocol = self.protocol.clone();
        let cancel = daemon.cancel_token().child_token();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((n, from)) => match protocol.consume_all(&buf[..n]) {
                            Ok(bundle) => {
                                daemon.post(BundleEvent::BundleReceived {
                                    bundle: Arc::new(bundle),
                                    source: EventSource::Peer,
                                    bytes: n as u64,
                                    link: None,
                                });
                            }
                            Err(e) => {
                                log::warn!("cla/udp({}): bad bundle from {}: {}", params.name, from, e);
                            }
                        },
                        Err(e) => {
                            log::warn!("cla/udp({}): recv: {}", params.name, e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                }
            }
        });
        Ok(())
    }

    async fn open_contact(&self, link: LinkRef, daemon: DaemonHandle) -> Result<(), NodeError> {
        let peer: SocketAddr = link
            .nexthop
            .parse()
            .map_err(|_| NodeError::Policy(format!("bad udp nexthop {}", link.nexthop)))?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(peer).await?;

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
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = kick_rx.recv() => {}
                    // The queue may be filled without a kick when the
                    // contact races the enqueue; poll as a backstop.
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                }
                while let Some(bundle) = link.start_next() {
                    let image = match protocol
                        .prepare_blocks(&bundle, &link.name)
                        .and_then(|xmit| protocol.produce_all(&bundle, &xmit))
                    {
                        Ok(image) => image,
                        Err(e) => {
                            log::error!("cla/udp({}): serialize {}: {}", link.name, bundle, e);
                            daemon.post(BundleEvent::BundleTransmitFailed {
                                bundle,
                                link: link.name.clone(),
                            });
                            continue;
                        }
                    };
                    if image.len() > MAX_DATAGRAM {
                        log::error!(
                            "cla/udp({}): {} exceeds datagram size ({} bytes)",
                            link.name,
                            bundle,
                            image.len()
                        );
                        daemon.post(BundleEvent::BundleTransmitFailed {
                            bundle,
                            link: link.name.clone(),
                        });
                        continue;
                    }
                    match socket.send(&image).await {
                        Ok(n) => {
                            daemon.post(BundleEvent::BundleTransmitted {
                                bundle,
                                link: link.name.clone(),
                                bytes_sent: n as u64,
                                acked: false,
                            });
                        }
                        Err(e) => {
                            log::warn!("cla/udp({}): send: {}", link.name, e);
                            daemon.post(BundleEvent::BundleTransmitFailed {
                                bundle,
                                link: link.name.clone(),
                            });
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
