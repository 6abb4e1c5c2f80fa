//! Event sources.
//!
//! A [`Source`] turns change notifications into [`Request`]s pushed onto a
//! controller's queue. [`KindSource`] follows a Kubernetes watch through
//! `kube_runtime::watcher`, which handles relisting and reconnect backoff.
//! [`ChannelSource`] forwards requests sent programmatically.

use crate::context::Context;
use crate::queue::WorkQueue;
use crate::reconciler::Request;
use futures::StreamExt;
use kube::{Api, Resource};
use kube_runtime::{WatchStreamExt, watcher};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pushes requests into a queue until the context is cancelled.
pub trait Source: Send + Sync + 'static {
    /// Spawns the source's feed task.
    fn start(&self, ctx: Context, queue: WorkQueue<Request>) -> JoinHandle<()>;
}

type Mapper<K> = Arc<dyn Fn(&K) -> Vec<Request> + Send + Sync>;

/// Watches objects of kind `K` and enqueues a request per touched object.
///
/// Applies, initial listing and deletions all produce requests.
pub struct KindSource<K> {
    api: Api<K>,
    config: watcher::Config,
    mapper: Mapper<K>,
}

impl<K> KindSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Watches `api`, requesting reconciliation of each object itself.
    pub fn new(api: Api<K>, config: watcher::Config) -> Self {
        Self {
            api,
            config,
            mapper: Arc::new(|obj: &K| Request::from_object(obj).into_iter().collect()),
        }
    }

    /// Maps each touched object to the requests it should trigger,
    /// e.g. an owned object to its owner.
    #[must_use]
    pub fn with_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&K) -> Vec<Request> + Send + Sync + 'static,
    {
        self.mapper = Arc::new(mapper);
        self
    }
}

impl<K> Source for KindSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn start(&self, ctx: Context, queue: WorkQueue<Request>) -> JoinHandle<()> {
        let stream = watcher(self.api.clone(), self.config.clone())
            .default_backoff()
            .touched_objects();
        let mapper = self.mapper.clone();
        let kind = std::any::type_name::<K>();

        tokio::spawn(async move {
            info!(kind, "Starting watch source");
            let mut stream = pin!(stream);
            loop {
                let next = tokio::select! {
                    () = ctx.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(obj)) => {
                        for request in mapper(&obj) {
                            debug!(kind, request = %request, "Watch event");
                            queue.enqueue(request);
                        }
                    }
                    Some(Err(e)) => warn!(kind, error = %e, "Watch stream error"),
                    None => break,
                }
            }
            info!(kind, "Watch source stopped");
        })
    }
}

/// Forwards requests sent through the paired [`mpsc::UnboundedSender`].
pub struct ChannelSource {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Request>>>,
}

impl ChannelSource {
    /// Creates a sender and the source draining it.
    #[must_use]
    pub fn channel() -> (mpsc::UnboundedSender<Request>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                rx: Mutex::new(Some(rx)),
            },
        )
    }
}

impl Source for ChannelSource {
    fn start(&self, ctx: Context, queue: WorkQueue<Request>) -> JoinHandle<()> {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        tokio::spawn(async move {
            let Some(mut rx) = rx else {
                warn!("Channel source already started");
                return;
            };
            loop {
                let next = tokio::select! {
                    () = ctx.cancelled() => break,
                    next = rx.recv() => next,
                };
                match next {
                    Some(request) => queue.enqueue(request),
                    None => break,
                }
            }
        })
    }
}
