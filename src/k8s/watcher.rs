//! Kubernetes watchers feeding the directory
//!
//! One watch per resource kind. Each translates watch events into
//! [`WorkloadEvent`]s and pushes them, in order, onto the channel the
//! directory writer consumes. A broken watch is re-established with backoff
//! and always begins with a full relist.

use crate::k8s::types::{ClusterResource, WorkloadEvent};
use crate::{MossError, Result};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client,
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Watches Pods, Services and Endpoints cluster-wide
#[derive(Clone)]
pub struct ClusterWatcher {
    client: Client,
    events: mpsc::Sender<WorkloadEvent>,
    max_failures: u32,
}

impl ClusterWatcher {
    pub fn new(client: Client, events: mpsc::Sender<WorkloadEvent>, max_failures: u32) -> Self {
        Self {
            client,
            events,
            max_failures,
        }
    }

    /// Run all watches until cancelled. Returns an error only when one kind
    /// failed `max_failures` times in a row without completing a relist.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!("Starting Kubernetes watchers...");

        tokio::try_join!(
            self.watch::<Pod>(cancel.clone()),
            self.watch::<Service>(cancel.clone()),
            self.watch::<Endpoints>(cancel.clone()),
        )?;

        info!("Kubernetes watchers stopped");
        Ok(())
    }

    async fn watch<K>(&self, cancel: CancellationToken) -> Result<()>
    where
        K: ClusterResource
            + kube::Resource<DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        let api: Api<K> = Api::all(self.client.clone());

        let mut backoff = INITIAL_BACKOFF;
        let mut failures = 0u32;

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                outcome = self.watch_stream(&api, &mut failures) => outcome,
            };

            if self.events.is_closed() {
                debug!(
                    "{} watcher: directory writer gone, stopping",
                    K::RESOURCE_KIND
                );
                return Ok(());
            }

            match outcome {
                Ok(()) => {
                    warn!("{} watch stream ended, reconnecting...", K::RESOURCE_KIND);
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    failures += 1;
                    // Stale until the next relist completes
                    let _ = self
                        .events
                        .send(WorkloadEvent::WatchLost(K::RESOURCE_KIND))
                        .await;

                    if failures >= self.max_failures {
                        return Err(MossError::WatchFailed {
                            kind: K::RESOURCE_KIND.as_str(),
                            failures,
                            last_error: e.to_string(),
                        });
                    }

                    error!(
                        "{} watch failed ({}/{}): {}, reconnecting in {:?}",
                        K::RESOURCE_KIND,
                        failures,
                        self.max_failures,
                        e,
                        backoff
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
                }
            }
        }
    }

    /// Consume one watch stream. `failures` resets whenever a relist completes.
    async fn watch_stream<K>(&self, api: &Api<K>, failures: &mut u32) -> Result<()>
    where
        K: ClusterResource
            + kube::Resource<DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        let config = watcher::Config::default();
        let mut stream = watcher::watcher(api.clone(), config).boxed();

        while let Some(event) = stream.try_next().await.map_err(|e| {
            MossError::KubernetesError(format!("{} watch: {}", K::RESOURCE_KIND, e))
        })? {
            let event = match event {
                Event::Init => WorkloadEvent::RelistStarted(K::RESOURCE_KIND),
                Event::InitApply(obj) | Event::Apply(obj) => match obj.ownership() {
                    Some(state) => WorkloadEvent::Applied(state),
                    None => continue,
                },
                Event::Delete(obj) => match obj.resource_key() {
                    Some(key) => WorkloadEvent::Deleted(key),
                    None => continue,
                },
                Event::InitDone => {
                    *failures = 0;
                    WorkloadEvent::RelistCompleted(K::RESOURCE_KIND)
                }
            };

            if self.events.send(event).await.is_err() {
                // Writer shut down; nothing left to feed
                return Ok(());
            }
        }

        Ok(())
    }
}
