// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded worker pool for inbound sync requests.
//!
//! Requests are queued on a bounded channel and picked up by a fixed number
//! of workers. A batched poll response is handled entirely by the worker that
//! dequeued it, one entry at a time. Concurrency across mappings comes from
//! running several workers; passes on the same mapping are serialized by the
//! mapping lock inside [`InstanceSyncService`].

use std::sync::Arc;

use instance_sync_core::{
    BatchReport, InstanceSyncService, NewDeploymentEvent, PassOutcome, PollResponseV1,
    PollResponseV2, SyncError,
};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;

/// An inbound message to reconcile.
#[derive(Debug, Clone)]
pub enum SyncRequest {
    NewDeployment(NewDeploymentEvent),
    PollV1(PollResponseV1),
    PollV2(PollResponseV2),
}

impl SyncRequest {
    fn kind(&self) -> &'static str {
        match self {
            Self::NewDeployment(_) => "new_deployment",
            Self::PollV1(_) => "poll_v1",
            Self::PollV2(_) => "poll_v2",
        }
    }
}

/// Result of a handled request.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncResponse {
    Pass(PassOutcome),
    Batch(BatchReport),
}

/// Receives the result of a request submitted with [`SyncDispatcher::dispatch`].
pub type ResponseReceiver = oneshot::Receiver<Result<SyncResponse, SyncError>>;

struct Job {
    request: SyncRequest,
    reply: Option<oneshot::Sender<Result<SyncResponse, SyncError>>>,
}

/// Worker pool feeding requests to an [`InstanceSyncService`].
pub struct SyncDispatcher {
    sender: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl SyncDispatcher {
    /// Spawn `worker_count` workers behind a queue of `queue_capacity` requests.
    pub fn start(
        service: Arc<InstanceSyncService>,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                let service = service.clone();
                let receiver = receiver.clone();
                tokio::spawn(run_worker(worker_id, service, receiver))
            })
            .collect::<Vec<_>>();

        info!(
            workers = workers.len(),
            queue_capacity, "Sync dispatcher started"
        );
        Self { sender, workers }
    }

    /// Queue a request, waiting for capacity.
    pub async fn submit(&self, request: SyncRequest) -> Result<(), DispatchError> {
        self.sender
            .send(Job {
                request,
                reply: None,
            })
            .await
            .map_err(|_| DispatchError::ShutDown)
    }

    /// Queue a request without waiting.
    pub fn try_submit(&self, request: SyncRequest) -> Result<(), DispatchError> {
        self.sender
            .try_send(Job {
                request,
                reply: None,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DispatchError::ShutDown,
            })
    }

    /// Queue a request and get a receiver for its result.
    pub async fn dispatch(&self, request: SyncRequest) -> Result<ResponseReceiver, DispatchError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Job {
                request,
                reply: Some(reply),
            })
            .await
            .map_err(|_| DispatchError::ShutDown)?;
        Ok(response)
    }

    /// Requests waiting for a worker.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_running(&self) -> bool {
        self.workers.iter().any(|w| !w.is_finished())
    }

    /// Stop accepting requests, drain the queue and wait for the workers.
    pub async fn shutdown(self) {
        let Self { sender, workers } = self;
        drop(sender);
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Sync worker task panicked: {}", e);
            }
        }
        info!("Sync dispatcher stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    service: Arc<InstanceSyncService>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
) {
    debug!(worker_id, "Sync worker started");
    loop {
        // Hold the receiver only while waiting, not while handling.
        let job = receiver.lock().await.recv().await;
        let Some(Job { request, reply }) = job else {
            break;
        };

        let kind = request.kind();
        let result = handle(&service, request).await;
        if let Err(e) = &result {
            warn!(
                worker_id,
                request = kind,
                error_code = e.error_code(),
                error = %e,
                "Sync request failed"
            );
        }
        if let Some(reply) = reply
            && reply.send(result).is_err()
        {
            debug!(worker_id, request = kind, "Requester dropped before response");
        }
    }
    debug!(worker_id, "Sync worker stopped");
}

async fn handle(
    service: &InstanceSyncService,
    request: SyncRequest,
) -> Result<SyncResponse, SyncError> {
    match request {
        SyncRequest::NewDeployment(event) => service
            .process_new_deployment(&event)
            .await
            .map(SyncResponse::Pass),
        SyncRequest::PollV1(response) => service
            .process_poll_response(&response)
            .await
            .map(SyncResponse::Pass),
        SyncRequest::PollV2(response) => service
            .process_poll_response_v2(&response)
            .await
            .map(SyncResponse::Batch),
    }
}
