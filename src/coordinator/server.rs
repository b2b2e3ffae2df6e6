//! Coordinator server
//!
//! The PG monitor lives inside one tokio task. Reports, queries, commands and
//! node map updates reach it over an mpsc channel and are answered through
//! oneshot replies; ticks come from a tokio interval and ratio changes from
//! the ratio observer. After every input the task drains consensus events
//! and publishes outbound messages on a broadcast channel.

use crate::common::{Config, Result};
use crate::coordinator::consensus::ConsensusParticipant;
use crate::coordinator::health::HealthReport;
use crate::coordinator::http::{create_router, CoordState};
use crate::coordinator::monitor::{Ack, Outbound, PgMonitor, Query, QueryResponse};
use crate::coordinator::node_map::NodeMap;
use crate::coordinator::raft_node::RaftNode;
use crate::coordinator::ratios::{self, CapacityRatios, RatioObserver, RatioPublisher};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub type Monitor = PgMonitor<RaftNode>;

const REQUEST_QUEUE: usize = 1024;
const OUTBOUND_BUFFER: usize = 256;

/// Replica overview for `/admin/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub node_id: String,
    pub role: String,
    pub is_leader: bool,
    pub leader: Option<String>,
    pub term: u64,
    pub last_committed: u64,
    pub map_version: u64,
    pub node_map_epoch: u64,
    pub nodes: usize,
    pub pools: usize,
    pub pending: bool,
    pub proposing: bool,
    pub queued: usize,
}

enum Request {
    Report {
        node: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<Ack>>,
    },
    Query {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<QueryResponse>>,
    },
    Command {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<Ack>>,
    },
    NodeMap {
        map: NodeMap,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
}

/// Cloneable client of the monitor task
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<Request>,
}

impl MonitorHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| crate::Error::ShuttingDown)?;
        rx.await.map_err(|_| crate::Error::ShuttingDown)
    }

    pub async fn report(&self, node: &str, payload: Vec<u8>) -> Result<Ack> {
        let node = node.to_string();
        self.call(|reply| Request::Report {
            node,
            payload,
            reply,
        })
        .await?
    }

    pub async fn query(&self, payload: Vec<u8>) -> Result<QueryResponse> {
        self.call(|reply| Request::Query { payload, reply }).await?
    }

    /// Typed variant of `query`
    pub async fn ask(&self, query: &Query) -> Result<QueryResponse> {
        let payload =
            serde_json::to_vec(query).map_err(|e| crate::Error::Internal(e.to_string()))?;
        self.query(payload).await
    }

    pub async fn command(&self, payload: Vec<u8>) -> Result<Ack> {
        self.call(|reply| Request::Command { payload, reply }).await?
    }

    pub async fn health(&self) -> Result<HealthReport> {
        match self.ask(&Query::Health).await? {
            QueryResponse::Health(report) => Ok(report),
            other => Err(crate::Error::Internal(format!(
                "unexpected health response: {:?}",
                other
            ))),
        }
    }

    pub async fn set_node_map(&self, map: NodeMap) -> Result<()> {
        self.call(|reply| Request::NodeMap { map, reply }).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.call(|reply| Request::Status { reply }).await
    }
}

/// A running monitor task and the channels around it
pub struct MonitorService {
    pub handle: MonitorHandle,
    pub ratios: RatioPublisher,
    pub outbound: broadcast::Sender<Outbound>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl MonitorService {
    /// Start the task that owns `monitor`
    pub fn spawn(monitor: Monitor, tick: Duration) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let (outbound, _) = broadcast::channel(OUTBOUND_BUFFER);
        let (ratios, observer) = ratios::channel(CapacityRatios::from_config(monitor.config()));
        let (shutdown, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(run(
            monitor,
            rx,
            observer,
            outbound.clone(),
            tick,
            shutdown_rx,
        ));

        Self {
            handle: MonitorHandle { tx },
            ratios,
            outbound,
            shutdown,
            task,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.outbound.subscribe()
    }

    /// Stop the task and wait for it
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "monitor task failed");
        }
    }
}

async fn run(
    mut monitor: Monitor,
    mut requests: mpsc::Receiver<Request>,
    mut ratios: RatioObserver,
    outbound: broadcast::Sender<Outbound>,
    tick: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ratios_open = true;
    settle(&mut monitor, &outbound);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            request = requests.recv() => match request {
                Some(request) => handle_request(&mut monitor, request),
                None => break,
            },
            _ = ticker.tick() => monitor.tick(Instant::now()),
            change = ratios.changed(), if ratios_open => match change {
                Some(change) => apply_ratios(&mut monitor, change),
                None => ratios_open = false,
            },
        }

        settle(&mut monitor, &outbound);
    }

    tracing::info!(version = monitor.map().version, "monitor task stopped");
}

/// Deliver consensus events, then publish whatever the monitor wants sent
fn settle(monitor: &mut Monitor, outbound: &broadcast::Sender<Outbound>) {
    if let Err(e) = monitor.pump(Instant::now()) {
        tracing::debug!(error = %e, "consensus events left undelivered");
    }
    for message in monitor.take_outbound() {
        if outbound.send(message).is_err() {
            tracing::trace!("no outbound subscribers");
        }
    }
}

fn handle_request(monitor: &mut Monitor, request: Request) {
    let now = Instant::now();
    match request {
        Request::Report {
            node,
            payload,
            reply,
        } => {
            let _ = reply.send(monitor.handle_report(&node, &payload, now));
        }
        Request::Query { payload, reply } => {
            let _ = reply.send(monitor.handle_query(&payload));
        }
        Request::Command { payload, reply } => {
            let _ = reply.send(monitor.handle_command(&payload, now));
        }
        Request::NodeMap { map, reply } => {
            monitor.check_node_map(map, now);
            let _ = reply.send(());
        }
        Request::Status { reply } => {
            let _ = reply.send(status_of(monitor));
        }
    }
}

/// Only ratios that differ from what the map will hold once everything
/// already accepted commits are proposed
fn apply_ratios(monitor: &mut Monitor, ratios: CapacityRatios) {
    let (current_full, current_nearfull) = monitor.effective_ratios();
    let full = if ratios.full != current_full { ratios.full } else { 0.0 };
    let nearfull = if ratios.nearfull != current_nearfull {
        ratios.nearfull
    } else {
        0.0
    };
    if let Err(e) = monitor.update_full_ratios(full, nearfull, Instant::now()) {
        tracing::warn!(error = %e, "capacity ratio change not applied");
    }
}

fn status_of(monitor: &Monitor) -> StatusReport {
    let raft = monitor.consensus();
    let node_map = monitor.node_map();
    StatusReport {
        node_id: raft.node_id().to_string(),
        role: raft.get_role().to_string(),
        is_leader: raft.is_leader(),
        leader: raft.leader(),
        term: raft.get_term(),
        last_committed: raft.last_committed(),
        map_version: monitor.map().version,
        node_map_epoch: node_map.epoch,
        nodes: node_map.nodes.len(),
        pools: node_map.pools.len(),
        pending: monitor.pending().is_some_and(|p| !p.is_empty()),
        proposing: monitor.in_flight().is_some(),
        queued: monitor.queued(),
    }
}

pub struct Coordinator {
    config: Config,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Single replica: the in-memory participant leads from the start
    pub fn build_monitor(&self) -> Monitor {
        let node_map = NodeMap::from_seed(&self.config.cluster);
        let mut raft = RaftNode::new(self.config.node_id.clone());
        raft.become_leader();
        PgMonitor::new(self.config.monitor.clone(), node_map, raft)
    }

    pub fn start(&self) -> MonitorService {
        MonitorService::spawn(self.build_monitor(), self.config.coordinator.tick_interval())
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting coordinator: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", self.config.coordinator.bind_addr);
        tracing::info!(
            "  Cluster: {} nodes, {} pools",
            self.config.cluster.nodes.len(),
            self.config.cluster.pools.len()
        );
        tracing::info!(
            "  Ratios: full {} nearfull {}",
            self.config.monitor.full_ratio,
            self.config.monitor.nearfull_ratio
        );

        let service = self.start();
        let state = CoordState {
            node_id: self.config.node_id.clone(),
            monitor: service.handle.clone(),
            ratios: service.ratios.clone(),
            outbound: service.outbound.clone(),
        };
        let router = create_router(state);

        let listener = tokio::net::TcpListener::bind(self.config.coordinator.bind_addr).await?;
        tracing::info!("Coordinator ready");

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        service.shutdown().await;
        result?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
