//! Wires the four long-lived workers together per the design doc's
//! concurrency model (§5) and dispatches the leader vs. follower role.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::consensus::election::{
    handle_request_vote, handle_vote, pin_as_leader, run_election_ticker, ElectionTimer,
    RequestVoteBody, VoteBody,
};
use crate::consensus::replication::{
    broadcast_heartbeat, broadcast_snr_reports, handle_append, AppendAckBody, AppendEntriesBody,
    SnrReportBody,
};
use crate::consensus::{AlwaysGrant, ConsensusEngine, VoteRecord, VotePolicy};
use crate::experiment::controller::ExpBeginBody;
use crate::experiment::{BernoulliVotePolicy, ExperimentController, GainController, ResultArtifact};
use crate::peers::PeerTable;
use crate::phy::PhyControlClient;
use crate::transport::UdpLink;
use crate::utils::{parsed_tunables, set_me, CliOptions, VRaftError};
use crate::wire::{Frame, MsgKind};
use crate::{pf_error, pf_info, pf_trace, pf_warn};

/// A running node: either the pinned leader (drives the experiment
/// controller) or a follower (votes per the Bernoulli policy and adjusts
/// its PHY TX gain toward a target SNR).
pub struct Node {
    opts: CliOptions,
    engine: Arc<ConsensusEngine>,
    shutdown: Arc<AtomicBool>,
}

impl Node {
    pub async fn build(opts: CliOptions, shutdown: Arc<AtomicBool>) -> Result<Self, VRaftError> {
        set_me(format!("n{}", opts.id));
        let tunables = parsed_tunables(opts.tunables.as_deref())?;

        let peers = Arc::new(PeerTable::new(&tunables));
        let (link, _recv_handle) = UdpLink::bind(
            opts.tx,
            opts.rx,
            tunables.queue_capacity,
            peers.clone(),
            shutdown.clone(),
        )
        .await?;

        let engine = Arc::new(ConsensusEngine::new(
            opts.id,
            opts.leader_id,
            opts.total,
            tunables,
            peers,
            Arc::new(link),
        ));

        Ok(Node {
            opts,
            engine,
            shutdown,
        })
    }

    /// Runs the node to completion. Returns the result artifact when this
    /// node is the pinned leader, `None` for followers (which run until
    /// `shutdown` is set).
    pub async fn run(self) -> Result<Option<ResultArtifact>, VRaftError> {
        let election_timer = Arc::new(ElectionTimer::new(self.engine.id));

        if self.engine.is_pinned_leader() {
            pin_as_leader(&self.engine).await;
        } else {
            election_timer
                .kickoff(
                    Duration::from_millis(self.engine.tunables.election_timeout_lo_ms),
                    Duration::from_millis(self.engine.tunables.election_timeout_hi_ms),
                )
                .await;
        }

        let (votes_tx, mut votes_rx) = mpsc::unbounded_channel::<VoteRecord>();

        let vote_policy: Arc<dyn VotePolicy> = if self.engine.is_pinned_leader() {
            Arc::new(AlwaysGrant)
        } else {
            let seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            Arc::new(BernoulliVotePolicy::new(
                self.engine.id,
                self.opts.p_node.unwrap_or(1.0),
                seed,
            ))
        };

        let gain_controller = if self.engine.is_pinned_leader() {
            None
        } else {
            Some(Arc::new(GainController::new(
                self.opts.init_gain.unwrap_or(0.5),
                self.opts.target_snr.unwrap_or(20.0),
            )))
        };

        let phy_client = if let Some(ctrl_port) = self.opts.ctrl {
            Some(Arc::new(PhyControlClient::connect(ctrl_port).await?))
        } else {
            None
        };

        // Worker 2: election ticker (harmless no-op on the pinned leader,
        // whose role is already `Leader`; live on followers so a leader
        // crash is detected per §8 scenario 6).
        let election_task = tokio::spawn(run_election_ticker(
            self.engine.clone(),
            election_timer.clone(),
            self.shutdown.clone(),
        ));

        // Peer liveness ticker.
        let peer_tick_task = {
            let engine = self.engine.clone();
            let shutdown = self.shutdown.clone();
            let interval = Duration::from_millis(engine.tunables.peer_tick_interval_ms);
            tokio::spawn(async move {
                while !shutdown.load(Ordering::Relaxed) {
                    tokio::time::sleep(interval).await;
                    engine.peers.tick();
                }
            })
        };

        // Worker 2 (cont'd): leader-only heartbeat + per-follower SNR
        // report cadence.
        let heartbeat_task = if self.engine.is_pinned_leader() {
            let engine = self.engine.clone();
            let shutdown = self.shutdown.clone();
            let interval = Duration::from_millis(engine.tunables.heartbeat_interval_ms);
            Some(tokio::spawn(async move {
                while !shutdown.load(Ordering::Relaxed) {
                    if let Err(e) = broadcast_heartbeat(&engine).await {
                        pf_warn!("heartbeat send failed: {}", e);
                    }
                    if let Err(e) = broadcast_snr_reports(&engine).await {
                        pf_warn!("SNR report send failed: {}", e);
                    }
                    tokio::time::sleep(interval).await;
                }
            }))
        } else {
            None
        };

        // Worker 4 (follower only): gain control loop on the PHY control
        // endpoint, driven by `GainController`.
        let gain_task = match (&gain_controller, &phy_client) {
            (Some(gc), Some(phy)) => {
                let gc = gc.clone();
                let phy = phy.clone();
                let shutdown = self.shutdown.clone();
                let interval = Duration::from_millis(500);
                Some(tokio::spawn(async move {
                    while !shutdown.load(Ordering::Relaxed) {
                        gc.tick(&phy).await;
                        tokio::time::sleep(interval).await;
                    }
                }))
            }
            _ => None,
        };

        // Message dispatch loop: the single consumer of the inbound queue,
        // demultiplexing by `MsgKind`.
        let dispatch_task = {
            let engine = self.engine.clone();
            let shutdown = self.shutdown.clone();
            let vote_policy = vote_policy.clone();
            let gain_controller = gain_controller.clone();
            tokio::spawn(async move {
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
                    let Some((frame, snr)) = engine.link.queue.recv_until(deadline).await else {
                        continue;
                    };
                    if !engine.targets_me(frame.meta.dst) {
                        continue;
                    }
                    if let Err(e) = dispatch_frame(
                        &engine,
                        frame,
                        snr,
                        vote_policy.as_ref(),
                        &votes_tx,
                        gain_controller.as_deref(),
                    )
                    .await
                    {
                        pf_trace!("dispatch error: {}", e);
                    }
                }
            })
        };

        let artifact = if self.engine.is_pinned_leader() {
            let controller = ExperimentController::new(self.engine.clone(), self.opts.clone());
            let result = controller.run(&mut votes_rx, &self.shutdown).await?;
            self.shutdown.store(true, Ordering::Relaxed);
            Some(result)
        } else {
            while !self.shutdown.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            None
        };

        dispatch_task.abort();
        election_task.abort();
        peer_tick_task.abort();
        if let Some(h) = heartbeat_task {
            h.abort();
        }
        if let Some(h) = gain_task {
            h.abort();
        }

        Ok(artifact)
    }
}

async fn dispatch_frame(
    engine: &Arc<ConsensusEngine>,
    frame: Frame,
    frame_snr: f32,
    vote_policy: &dyn VotePolicy,
    votes_tx: &mpsc::UnboundedSender<VoteRecord>,
    gain_controller: Option<&GainController>,
) -> Result<(), VRaftError> {
    let src = frame.meta.src;
    let term = frame.meta.term;

    match frame.meta.kind {
        MsgKind::RequestVote => {
            let body: RequestVoteBody = serde_json::from_slice(&frame.payload)?;
            handle_request_vote(engine, src, term, body.last_index, body.last_term).await
        }
        MsgKind::Vote => {
            let body: VoteBody = serde_json::from_slice(&frame.payload)?;
            handle_vote(engine, src, term, body.granted).await?;
            Ok(())
        }
        MsgKind::Append | MsgKind::Heartbeat => {
            let body: AppendEntriesBody = serde_json::from_slice(&frame.payload)?;
            handle_append(
                engine,
                src,
                term,
                body.prev_index,
                body.prev_term,
                body.entries,
                vote_policy,
                vote_policy.force_append(),
            )
            .await
        }
        MsgKind::AppendAck => {
            let body: AppendAckBody = serde_json::from_slice(&frame.payload)?;
            let observed_snr_db = engine
                .peers
                .get(src)
                .map(|p| p.ewma_snr_db)
                .unwrap_or(frame_snr);
            let _ = votes_tx.send(VoteRecord {
                round_id: body.index,
                voter: src,
                granted: body.granted,
                observed_snr_db,
                received_at: std::time::Instant::now(),
            });
            Ok(())
        }
        MsgKind::SnrReport => {
            let body: SnrReportBody = serde_json::from_slice(&frame.payload)?;
            if let Some(gc) = gain_controller {
                gc.record_observed_snr(body.snr_db);
            }
            Ok(())
        }
        MsgKind::ExpBegin => {
            let body: ExpBeginBody = serde_json::from_slice(&frame.payload)?;
            if let Some(target) = body.target_snr_db {
                if let Some(gc) = gain_controller {
                    gc.set_target(target as f32);
                }
            }
            if let Some(p) = body.p_node {
                vote_policy.set_p_node(p as f32);
                pf_info!("p_node updated to {}", p);
            }
            Ok(())
        }
        MsgKind::ExpEnd => {
            pf_info!("experiment ended");
            Ok(())
        }
    }
}

/// Surfaces a fatal startup/runtime error the way §7 requires: a single
/// structured line to stderr.
pub fn report_fatal(err: &VRaftError) {
    pf_error!("fatal: {}", err);
}
