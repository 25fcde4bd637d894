//! UDP link: egress socket to the PHY, ingress socket from the PHY, and the
//! dedicated receiver task that decodes frames into the inbound queue.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::peers::PeerTable;
use crate::transport::InboundQueue;
use crate::utils::VRaftError;
use crate::wire::Frame;
use crate::{pf_debug, pf_trace};

/// Socket read timeout so the receiver notices shutdown promptly (§5).
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(50);

pub struct UdpLink {
    egress: UdpSocket,
    phy_addr: SocketAddr,
    pub queue: Arc<InboundQueue>,
}

impl UdpLink {
    /// Binds the egress (app->PHY) socket on an ephemeral port and the
    /// ingress (PHY->app) socket on `rx_port`, both on localhost. Spawns
    /// the receiver task immediately.
    pub async fn bind(
        tx_port: u16,
        rx_port: u16,
        capacity: usize,
        peers: Arc<PeerTable>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(Self, JoinHandle<()>), VRaftError> {
        let egress = UdpSocket::bind("127.0.0.1:0").await?;
        let phy_addr: SocketAddr = format!("127.0.0.1:{}", tx_port).parse()?;

        let ingress = UdpSocket::bind(("127.0.0.1", rx_port)).await?;
        let queue = Arc::new(InboundQueue::new(capacity));

        let handle = spawn_receiver(ingress, queue.clone(), peers, shutdown);

        Ok((
            UdpLink {
                egress,
                phy_addr,
                queue,
            },
            handle,
        ))
    }

    /// Sends a frame to the PHY for broadcast. Per §7, send failures are
    /// logged and the frame dropped -- never fatal.
    pub async fn send(&self, frame: &Frame) -> Result<(), VRaftError> {
        let bytes = frame.encode()?;
        self.egress.send_to(&bytes, self.phy_addr).await?;
        pf_trace!("sent {:?} ({} bytes)", frame.meta.kind, bytes.len());
        Ok(())
    }
}

/// Dedicated receiver task: blocks on the ingress socket with a short
/// timeout, decodes frames, updates the peer table, and pushes onto the
/// inbound queue. Exits on its next socket timeout after `shutdown` is set.
fn spawn_receiver(
    ingress: UdpSocket,
    queue: Arc<InboundQueue>,
    peers: Arc<PeerTable>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match tokio::time::timeout(
                RECV_POLL_TIMEOUT,
                ingress.recv_from(&mut buf),
            )
            .await
            {
                Err(_elapsed) => continue, // poll shutdown flag again
                Ok(Err(e)) => {
                    pf_debug!("ingress recv error: {}", e);
                    continue;
                }
                Ok(Ok((n, _from))) => match Frame::decode(&buf[..n]) {
                    Ok(frame) => {
                        let snr = frame.meta.snr_db.unwrap_or(0.0);
                        peers.observe(frame.meta.src, snr);
                        queue.push((frame, snr));
                    }
                    Err(e) => {
                        pf_debug!("dropping malformed frame: {}", e);
                    }
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::TomlTunables;
    use crate::wire::{Dest, FrameMeta, MsgKind};

    #[tokio::test]
    async fn send_and_receive_round_trip() {
        let peers = Arc::new(PeerTable::new(&TomlTunables::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        // "PHY" stand-in: a plain socket that the link's egress sends to,
        // and that forwards onto the link's ingress port to simulate the
        // PHY relaying a broadcast back to the app.
        let phy = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let phy_port = phy.local_addr().unwrap().port();
        let rx_port = {
            let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let (link, _recv_handle) =
            UdpLink::bind(phy_port, rx_port, 16, peers.clone(), shutdown.clone())
                .await
                .unwrap();

        let meta = FrameMeta::new(5, Dest::Broadcast, 1, MsgKind::Heartbeat);
        let frame = Frame::new(meta, vec![1, 2, 3]);
        link.send(&frame).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let (n, from) =
            tokio::time::timeout(Duration::from_secs(1), phy.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();

        // relay straight to the app's ingress port, as the PHY would after
        // stamping an SNR estimate
        let mut relayed = Frame::decode(&buf[..n]).unwrap();
        relayed.meta.snr_db = Some(17.5);
        let relayed_bytes = relayed.encode().unwrap();
        phy.send_to(&relayed_bytes, format!("127.0.0.1:{}", rx_port))
            .await
            .unwrap();
        let _ = from;

        let (got_frame, got_snr) = link
            .queue
            .recv_until(tokio::time::Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got_frame.meta.src, 5);
        assert_eq!(got_snr, 17.5);
        assert_eq!(peers.get(5).unwrap().ewma_snr_db, 17.5);

        shutdown.store(true, Ordering::Relaxed);
    }
}
