use std::fmt::Debug;
use std::hash::Hash;
use std::pin::pin;

use futures::StreamExt;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::runtime::reflector::Store;
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Resource};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("informer cache for {kind} never became ready: {reason}")]
    CacheNotReady { kind: String, reason: String },
}

/// Run a reflector for `api` in the background and hand out its read cache
/// once the first full list has been absorbed. Cancelling the token ends
/// the watch, which in turn lets the spawned task finish.
pub async fn create_store<K>(api: Api<K>, cancel: CancellationToken) -> Result<Store<K>>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let (reader, writer) = reflector::store();

    let events = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .take_until(cancel.cancelled_owned());
    let watched = kind.clone();
    tokio::spawn(async move {
        let mut events = pin!(events);
        while let Some(step) = events.next().await {
            if let Err(e) = step {
                warn!(kind = %watched, error = %e, "watch interrupted, backing off");
            }
        }
        debug!(kind = %watched, "watch finished");
    });

    reader
        .wait_until_ready()
        .await
        .map_err(|e| Error::CacheNotReady {
            kind,
            reason: e.to_string(),
        })?;
    Ok(reader)
}
