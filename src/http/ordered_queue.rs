use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::http::http_codec::{HttpRequest, HttpResponse};
use crate::http::http_error::ChannelError;

/// Performs a single request / response exchange. Implementations need not be safe for concurrent
///  use: the queue never calls `execute` while a previous call is still running.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestExecutor: Send + Sync + 'static {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ChannelError>;
}

struct PendingRequest {
    request: HttpRequest,
    generation: u64,
    completion: oneshot::Sender<Result<HttpResponse, ChannelError>>,
}

/// Serializes requests on one channel: a request is handed to the executor only after the previous
///  request's outcome (response or failure) was delivered, so dispatch order is submission order.
///
/// Every submitted request gets its own [PendingResponse]. A failed request does not stall the
///  requests behind it.
///
/// [OrderedRequestQueue::cancel_all] moves the queue to a new generation: the in-flight request is
///  abandoned and every request submitted before the call resolves as [ChannelError::Cancelled]
///  without being dispatched. Requests submitted afterwards are processed normally.
pub struct OrderedRequestQueue {
    name: &'static str,
    sender: mpsc::UnboundedSender<PendingRequest>,
    generation: watch::Sender<u64>,
    num_pending: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

impl OrderedRequestQueue {
    pub fn new(name: &'static str, executor: Arc<dyn RequestExecutor>) -> OrderedRequestQueue {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (generation, generation_receiver) = watch::channel(0);
        let num_pending = Arc::new(AtomicUsize::new(0));

        let worker = tokio::spawn(run_queue(name, executor, receiver, generation_receiver, num_pending.clone()));

        OrderedRequestQueue {
            name,
            sender,
            generation,
            num_pending,
            worker,
        }
    }

    pub fn submit(&self, request: HttpRequest) -> PendingResponse {
        let (completion, receiver) = oneshot::channel();
        let generation = *self.generation.borrow();

        trace!("{} queue: submitting {} {}", self.name, request.method, request.path);

        self.num_pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(PendingRequest { request, generation, completion }).is_err() {
            // the worker is gone: the dropped completion resolves the response as cancelled
            self.num_pending.fetch_sub(1, Ordering::AcqRel);
        }

        PendingResponse { receiver }
    }

    pub fn cancel_all(&self) {
        debug!("{} queue: cancelling {} pending request(s)", self.name, self.pending_count());
        self.generation.send_modify(|g| *g += 1);
    }

    /// number of requests that were submitted but whose outcome was not delivered yet
    pub fn pending_count(&self) -> usize {
        self.num_pending.load(Ordering::Acquire)
    }
}

impl Drop for OrderedRequestQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_queue(
    name: &'static str,
    executor: Arc<dyn RequestExecutor>,
    mut receiver: mpsc::UnboundedReceiver<PendingRequest>,
    mut generation: watch::Receiver<u64>,
    num_pending: Arc<AtomicUsize>,
) {
    while let Some(pending) = receiver.recv().await {
        let current_generation = *generation.borrow_and_update();

        let result = if pending.generation != current_generation {
            trace!("{} queue: dropping request for {} from a cancelled generation", name, pending.request.path);
            Err(ChannelError::Cancelled)
        }
        else {
            select! {
                result = executor.execute(pending.request) => result,
                _ = generation.changed() => {
                    debug!("{} queue: in-flight request was cancelled", name);
                    Err(ChannelError::Cancelled)
                }
            }
        };

        num_pending.fetch_sub(1, Ordering::AcqRel);
        let _ = pending.completion.send(result);
    }
}

/// The eventual outcome of a submitted request. Resolves as [ChannelError::Cancelled] if the
///  request was cancelled or its queue was dropped.
pub struct PendingResponse {
    receiver: oneshot::Receiver<Result<HttpResponse, ChannelError>>,
}

impl Future for PendingResponse {
    type Output = Result<HttpResponse, ChannelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(ChannelError::Cancelled)))
    }
}
