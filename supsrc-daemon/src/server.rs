//! gRPC server implementation: the `SupsrcDaemon` service defined in
//! `supsrc-proto`.
//!
//! Every RPC maps its `Result` through `DaemonError`'s `tonic::Status`
//! conversion; `subscribe_events` spawns a forwarding task that streams
//! broadcast events into a `ReceiverStream` for the lifetime of the call.

use chrono::Utc;
use std::pin::Pin;
use std::sync::Arc;
use supsrc_core::processor::{ProcessorCommand, SharedRepoMap};
use supsrc_core::workflow::SharedBreaker;
use supsrc_proto::daemon::supsrc_daemon_server::SupsrcDaemon;
use supsrc_proto::daemon::*;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tonic::{Request, Response, Status};

use crate::orchestrator::DaemonHandles;

pub struct SupsrcDaemonService {
    shared: SharedRepoMap,
    breaker: SharedBreaker,
    events: supsrc_core::events::EventBroadcaster,
    cmd_tx: mpsc::UnboundedSender<ProcessorCommand>,
    config: Arc<RwLock<supsrc_config::Config>>,
    shutdown_tx: mpsc::UnboundedSender<()>,
}

impl SupsrcDaemonService {
    pub fn new(handles: DaemonHandles, shutdown_tx: mpsc::UnboundedSender<()>) -> Self {
        Self {
            shared: handles.shared,
            breaker: handles.breaker,
            events: handles.events,
            cmd_tx: handles.cmd_tx,
            config: handles.config,
            shutdown_tx,
        }
    }
}

#[tonic::async_trait]
impl SupsrcDaemon for SupsrcDaemonService {
    async fn acknowledge_circuit_breaker(
        &self,
        request: Request<AcknowledgeRequest>,
    ) -> Result<Response<AcknowledgeResponse>, Status> {
        let repo_id = request.into_inner().repo_id;
        let repos = self.shared.read().await;
        let Some(state) = repos.get(&repo_id) else {
            return Ok(Response::new(AcknowledgeResponse { found: false }));
        };

        let mut state = state.lock().await;
        let mut breaker = self.breaker.lock().await;
        breaker.acknowledge_circuit_breaker(&mut state, false, Utc::now());
        self.events.emit_circuit_breaker_acknowledged(repo_id);

        Ok(Response::new(AcknowledgeResponse { found: true }))
    }

    async fn list_circuit_breakers(
        &self,
        _request: Request<ListCircuitBreakersRequest>,
    ) -> Result<Response<ListCircuitBreakersResponse>, Status> {
        let now = Utc::now();
        let repos = self.shared.read().await;
        let breaker = self.breaker.lock().await;

        let mut breakers = Vec::new();
        for (repo_id, state) in repos.iter() {
            let state = state.lock().await;
            if !state.circuit_breaker.triggered {
                continue;
            }
            let summary = breaker.summary(&state, now);
            breakers.push(TriggeredBreaker {
                    repo_id: repo_id.clone(),
                    status: summary.status.display().to_string(),
                    reason: summary.reason.unwrap_or_default(),
                    unique_files_in_window: summary.unique_files_in_window as u64,
                    auto_recovery_scheduled: summary.auto_recovery_scheduled,
                    auto_recovery_in_seconds: summary.auto_recovery_in_seconds,
            });
        }

        Ok(Response::new(ListCircuitBreakersResponse { breakers }))
    }

    async fn get_resolved_config(
        &self,
        _request: Request<GetResolvedConfigRequest>,
    ) -> Result<Response<GetResolvedConfigResponse>, Status> {
        let config = self.config.read().await;
        let toml = toml::to_string_pretty(&*config)
        .map_err(|err| Status::internal(format!("failed to render resolved config: {err}")))?;
        Ok(Response::new(GetResolvedConfigResponse { toml }))
    }

    async fn get_repository_status(
        &self,
        request: Request<GetRepositoryStatusRequest>,
    ) -> Result<Response<GetRepositoryStatusResponse>, Status> {
        let repo_id = request.into_inner().repo_id;
        let repos = self.shared.read().await;
        let state = repos
        .get(&repo_id)
        .ok_or_else(|| Status::not_found(format!("repository '{repo_id}' is not being watched")))?;
        let state = state.lock().await;

        Ok(Response::new(GetRepositoryStatusResponse {
                    status: state.status.display().to_string(),
                    save_count: state.save_count,
                    changed_files: state.counters.changed_files,
                    is_frozen: state.is_frozen,
                    circuit_breaker_triggered: state.circuit_breaker.triggered,
                    current_branch: state.branch.current_branch.clone().unwrap_or_default(),
                    last_commit_hash: state.last_commit.short_hash.clone(),
        }))
    }

    type SubscribeEventsStream = Pin<Box<dyn Stream<Item = Result<DaemonEvent, Status>> + Send + 'static>>;

    async fn subscribe_events(
        &self,
        request: Request<SubscribeEventsRequest>,
    ) -> Result<Response<Self::SubscribeEventsStream>, Status> {
        let repo_filter = request.into_inner().repo_id;
        let mut event_rx = self.events.subscribe();
        let (tx, rx) = mpsc::channel::<Result<DaemonEvent, Status>>(32);

        tokio::spawn(async move {
                loop {
                    match event_rx.recv().await {
                        Ok(event) => {
                            let should_send = match &repo_filter {
                                Some(filter) => &event.repo_id == filter,
                                None => true,
                            };
                            if should_send && tx.send(Ok((*event).clone())).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "event subscriber lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn shutdown(&self, _request: Request<ShutdownRequest>) -> Result<Response<ShutdownResponse>, Status> {
        let _ = self.shutdown_tx.send(());
        Ok(Response::new(ShutdownResponse { accepted: true }))
    }
}
