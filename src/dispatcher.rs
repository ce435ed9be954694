//! Watch streams that feed the work queue.
//!
//! Every change to an object class the operand depends on enqueues the same
//! constant key, so bursts collapse into a single pending sync. Watch
//! handlers never perform I/O of their own.

use std::fmt::Debug;

use futures::future::{self, BoxFuture};
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service, ServiceAccount};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{info, trace, warn};

use crate::crd::ServiceCatalogAPIServer;
use crate::queue::WorkQueue;
use crate::{ETCD_NAMESPACE, KUBE_APISERVER_NAMESPACE, TARGET_NAMESPACE, USER_CONFIG_NAMESPACE};

/// The single key every change maps to
pub const WORK_QUEUE_KEY: &str = "key";

/// Enqueues sync requests
#[derive(Clone)]
pub struct Dispatcher {
    queue: WorkQueue<String>,
}

impl Dispatcher {
    /// Create a dispatcher feeding `queue`
    pub fn new(queue: WorkQueue<String>) -> Self {
        Self { queue }
    }

    /// Request a sync pass
    pub fn notify(&self) {
        self.queue.add(WORK_QUEUE_KEY.to_string());
    }

    /// Request a sync pass if `name` is the managed namespace
    pub fn notify_namespace(&self, name: &str) {
        if name == TARGET_NAMESPACE {
            self.notify();
        }
    }
}

/// Object carried by a watch event, if any
pub fn event_object<K>(event: &Event<K>) -> Option<&K> {
    match event {
        Event::Apply(obj) | Event::Delete(obj) | Event::InitApply(obj) => Some(obj),
        Event::Init | Event::InitDone => None,
    }
}

fn notify_on_object<K>(dispatcher: &Dispatcher, event: &Event<K>) {
    if event_object(event).is_some() {
        dispatcher.notify();
    }
}

/// Route a namespace watch event; only the managed namespace's own events matter
pub fn dispatch_namespace_event(dispatcher: &Dispatcher, event: &Event<Namespace>) {
    if let Some(ns) = event_object(event) {
        dispatcher.notify_namespace(&ns.name_any());
    }
}

async fn watch_class<K>(
    api: Api<K>,
    dispatcher: Dispatcher,
    class: &'static str,
    handle: fn(&Dispatcher, &Event<K>),
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                trace!(class, "Watch event received");
                handle(&dispatcher, &event);
            }
            Err(e) => warn!(class, error = %e, "Watch stream error, backing off"),
        }
    }
    warn!(class, "Watch stream ended");
}

/// Watch every dependency of the operand until the streams end
pub async fn run_watchers(client: Client, dispatcher: Dispatcher) {
    let watches: Vec<BoxFuture<'static, ()>> = vec![
        watch_class::<ServiceCatalogAPIServer>(
            Api::all(client.clone()),
            dispatcher.clone(),
            "servicecatalogapiservers",
            notify_on_object,
        )
        .boxed(),
        watch_class::<ConfigMap>(
            Api::namespaced(client.clone(), ETCD_NAMESPACE),
            dispatcher.clone(),
            "kube-system/configmaps",
            notify_on_object,
        )
        .boxed(),
        watch_class::<Secret>(
            Api::namespaced(client.clone(), ETCD_NAMESPACE),
            dispatcher.clone(),
            "kube-system/secrets",
            notify_on_object,
        )
        .boxed(),
        watch_class::<ConfigMap>(
            Api::namespaced(client.clone(), KUBE_APISERVER_NAMESPACE),
            dispatcher.clone(),
            "openshift-kube-apiserver/configmaps",
            notify_on_object,
        )
        .boxed(),
        watch_class::<ConfigMap>(
            Api::namespaced(client.clone(), TARGET_NAMESPACE),
            dispatcher.clone(),
            "configmaps",
            notify_on_object,
        )
        .boxed(),
        watch_class::<ServiceAccount>(
            Api::namespaced(client.clone(), TARGET_NAMESPACE),
            dispatcher.clone(),
            "serviceaccounts",
            notify_on_object,
        )
        .boxed(),
        watch_class::<Service>(
            Api::namespaced(client.clone(), TARGET_NAMESPACE),
            dispatcher.clone(),
            "services",
            notify_on_object,
        )
        .boxed(),
        watch_class::<DaemonSet>(
            Api::namespaced(client.clone(), TARGET_NAMESPACE),
            dispatcher.clone(),
            "daemonsets",
            notify_on_object,
        )
        .boxed(),
        watch_class::<ConfigMap>(
            Api::namespaced(client.clone(), USER_CONFIG_NAMESPACE),
            dispatcher.clone(),
            "openshift-config/configmaps",
            notify_on_object,
        )
        .boxed(),
        watch_class::<Namespace>(
            Api::all(client),
            dispatcher,
            "namespaces",
            dispatch_namespace_event,
        )
        .boxed(),
    ];

    info!(count = watches.len(), "Starting watchers");
    future::join_all(watches).await;
}
