//! PHY control client: ping/set_tx_gain/set_rx_gain/get_gains over a
//! localhost, line-delimited-JSON UDP control socket (§6).

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use crate::utils::{ErrorKind, VRaftError};
use crate::pf_warn;

/// Per-request timeout for ordinary control calls (`set_tx_gain` etc).
const REQUEST_TIMEOUT: Duration = Duration::from_millis(200);
/// Generous timeout for the bring-up readiness probe (spec.md §5: "PHY-ready
/// ping 30s, used during bring-up, not by the steady-state core").
const PING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Request {
    Ping,
    SetTxGain { value: f32 },
    SetRxGain { value: f32 },
    GetGains,
}

#[derive(Debug, Deserialize)]
struct PingResponse {
    #[allow(dead_code)]
    reply: String,
}

#[derive(Debug, Deserialize)]
struct OkResponse {
    #[allow(dead_code)]
    ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct Gains {
    pub tx: f32,
    pub rx: f32,
}

/// A follower's handle to its co-located PHY's control endpoint. Every call
/// retries once on timeout or a malformed reply before surfacing a
/// `Control`-kind error; callers (the gain-control loop) hold gain constant
/// on error rather than propagating it further.
pub struct PhyControlClient {
    sock: UdpSocket,
    ctrl_addr: SocketAddr,
}

impl PhyControlClient {
    pub async fn connect(ctrl_port: u16) -> Result<Self, VRaftError> {
        let sock = UdpSocket::bind("127.0.0.1:0").await?;
        let ctrl_addr: SocketAddr = format!("127.0.0.1:{}", ctrl_port).parse()?;
        Ok(PhyControlClient { sock, ctrl_addr })
    }

    pub async fn ping(&self) -> Result<(), VRaftError> {
        self.call::<PingResponse>(&Request::Ping, PING_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn set_tx_gain(&self, value: f32) -> Result<(), VRaftError> {
        self.call::<OkResponse>(
            &Request::SetTxGain {
                value: value.clamp(0.0, 1.0),
            },
            REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn set_rx_gain(&self, value: f32) -> Result<(), VRaftError> {
        self.call::<OkResponse>(
            &Request::SetRxGain {
                value: value.clamp(0.0, 1.0),
            },
            REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn get_gains(&self) -> Result<Gains, VRaftError> {
        self.call::<Gains>(&Request::GetGains, REQUEST_TIMEOUT)
            .await
    }

    /// Sends `req` and awaits a line-delimited JSON reply, retrying once
    /// (§3 of the design doc: a single retry before the caller holds gain
    /// constant).
    async fn call<R: for<'de> Deserialize<'de>>(
        &self,
        req: &Request,
        timeout: Duration,
    ) -> Result<R, VRaftError> {
        let mut line = serde_json::to_vec(req)?;
        line.push(b'\n');

        for attempt in 0..2 {
            if let Ok(resp) = self.try_once(&line, timeout).await {
                return Ok(resp);
            }
            if attempt == 0 {
                pf_warn!("PHY control call timed out, retrying once");
            }
        }

        Err(VRaftError::of(
            ErrorKind::Control,
            format!("PHY control endpoint {} unreachable after retry", self.ctrl_addr),
        ))
    }

    async fn try_once<R: for<'de> Deserialize<'de>>(
        &self,
        line: &[u8],
        timeout: Duration,
    ) -> Result<R, VRaftError> {
        self.sock.send_to(line, self.ctrl_addr).await?;
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(timeout, self.sock.recv(&mut buf))
            .await
            .map_err(|_| VRaftError::of(ErrorKind::Control, "PHY control call timed out"))??;
        let text = std::str::from_utf8(&buf[..n])
            .map_err(|e| VRaftError::of(ErrorKind::Control, format!("non-utf8 reply: {}", e)))?;
        serde_json::from_str(text.trim_end()).map_err(VRaftError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket as StdUdp;

    async fn fake_phy() -> (StdUdp, u16) {
        let sock = StdUdp::bind("127.0.0.1:0").await.unwrap();
        let port = sock.local_addr().unwrap().port();
        (sock, port)
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let (phy, port) = fake_phy().await;
        let client = PhyControlClient::connect(port).await.unwrap();

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (n, from) = phy.recv_from(&mut buf).await.unwrap();
            assert!(std::str::from_utf8(&buf[..n]).unwrap().contains("ping"));
            phy.send_to(b"{\"reply\":\"pong\"}\n", from).await.unwrap();
        });

        client.ping().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn get_gains_parses_reply() {
        let (phy, port) = fake_phy().await;
        let client = PhyControlClient::connect(port).await.unwrap();

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (_n, from) = phy.recv_from(&mut buf).await.unwrap();
            phy.send_to(b"{\"tx\":0.5,\"rx\":0.25}\n", from)
                .await
                .unwrap();
        });

        let gains = client.get_gains().await.unwrap();
        assert_eq!(gains.tx, 0.5);
        assert_eq!(gains.rx, 0.25);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_endpoint_returns_control_error() {
        // bind to a port nobody is listening on, then drop it so the OS
        // port is free but no responder exists.
        let (probe, port) = fake_phy().await;
        drop(probe);
        let client = PhyControlClient::connect(port).await.unwrap();
        let err = client.ping().await.unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Control);
    }
}
