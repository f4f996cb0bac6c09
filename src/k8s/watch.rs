/**
 * K8s Watch Binding
 *
 * Runs one watch stream per kind, keeps the local mirrors current and feeds
 * every observed change to the dirty-state aggregator.
 */
use crate::k8s::cache::{
    CacheConfig, ChangeEvent, DirtyStateAggregator, IngressClassFilter, Listers, ObjectKey,
    WatchedObject,
};
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, pin_mut};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::{self, ObjectRef, Store, store::Writer};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

type Accept<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

/// Mirror of one kind plus the translation of watcher events into changes
struct Binding<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    reader: Store<K>,
    writer: Writer<K>,
    accept: Accept<K>,
    relist: Option<Relist<K>>,
}

/// Objects known before a relist started, and those seen since
struct Relist<K: Resource<DynamicType = ()>> {
    before: Vec<Arc<K>>,
    seen: HashSet<ObjectRef<K>>,
}

impl<K> Binding<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
    Arc<K>: Into<WatchedObject>,
{
    fn new(accept: Accept<K>) -> Self {
        let (reader, writer) = reflector::store();
        Self {
            reader,
            writer,
            accept,
            relist: None,
        }
    }

    /// Apply `event` to the mirror and return the changes it represents
    fn translate(&mut self, event: watcher::Event<K>) -> Vec<ChangeEvent> {
        let changes = match &event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                if let Some(relist) = self.relist.as_mut() {
                    relist.seen.insert(obj_ref.clone());
                }
                let old = self.reader.get(&obj_ref);
                self.changed(old, Arc::new(obj.clone()))
            }
            watcher::Event::Delete(obj) => {
                let old = self
                    .reader
                    .get(&ObjectRef::from_obj(obj))
                    .unwrap_or_else(|| Arc::new(obj.clone()));
                self.deleted(old).into_iter().collect()
            }
            watcher::Event::Init => {
                self.relist = Some(Relist {
                    before: self.reader.state(),
                    seen: HashSet::new(),
                });
                Vec::new()
            }
            watcher::Event::InitDone => {
                let mut changes: Vec<_> = self
                    .relist
                    .take()
                    .map(|relist| {
                        relist
                            .before
                            .into_iter()
                            .filter(|obj| !relist.seen.contains(&ObjectRef::from_obj(obj.as_ref())))
                            .filter_map(|obj| self.deleted(obj))
                            .collect()
                    })
                    .unwrap_or_default();
                changes.push(ChangeEvent::resync());
                changes
            }
        };
        self.writer.apply_watcher_event(&event);
        changes
    }

    fn changed(&self, old: Option<Arc<K>>, new: Arc<K>) -> Vec<ChangeEvent> {
        let old = old.filter(|old| (self.accept)(old));
        match (old, (self.accept)(&new)) {
            (Some(old), true) => vec![ChangeEvent::updated(old, new)],
            (None, true) => vec![ChangeEvent::added(new)],
            (Some(old), false) => vec![ChangeEvent::deleted(old)],
            (None, false) => Vec::new(),
        }
    }

    fn deleted(&self, old: Arc<K>) -> Option<ChangeEvent> {
        (self.accept)(&old).then(|| ChangeEvent::deleted(old))
    }
}

/// Owns the mirrors of every watched kind until the streams start
pub struct WatchManager {
    client: Client,
    namespace: Option<String>,
    ingresses: Binding<Ingress>,
    services: Binding<Service>,
    endpoints: Binding<Endpoints>,
    secrets: Binding<Secret>,
    config_maps: Binding<ConfigMap>,
    pods: Binding<Pod>,
}

impl WatchManager {
    /// Mirrors for `namespace`, or the whole cluster when `None`
    #[must_use]
    pub fn new(client: Client, namespace: Option<String>, config: &CacheConfig) -> Self {
        let class_filter: IngressClassFilter = config.ingress_class.clone();
        let distinguished: Vec<ObjectKey> = config
            .global_config_map
            .iter()
            .chain(config.tcp_config_map.iter())
            .cloned()
            .collect();

        Self {
            client,
            namespace,
            ingresses: Binding::new(Arc::new(move |ingress: &Ingress| {
                class_filter.accepts(ingress)
            })),
            services: Binding::new(accept_all()),
            endpoints: Binding::new(accept_all()),
            secrets: Binding::new(accept_all()),
            config_maps: Binding::new(Arc::new(move |config_map: &ConfigMap| {
                distinguished.contains(&ObjectKey::from_resource(config_map))
            })),
            pods: Binding::new(accept_all()),
        }
    }

    /// Read access to the mirrors, usable before and after `start`
    #[must_use]
    pub fn listers(&self) -> Listers {
        Listers::from_stores(
            self.ingresses.reader.clone(),
            self.services.reader.clone(),
            self.endpoints.reader.clone(),
            self.secrets.reader.clone(),
            self.config_maps.reader.clone(),
            self.pods.reader.clone(),
        )
    }

    /// Start one watch stream per kind feeding `aggregator`
    pub fn start(self, aggregator: Arc<DirtyStateAggregator>) -> WatchManagerHandle {
        let Self {
            client,
            namespace,
            ingresses,
            services,
            endpoints,
            secrets,
            config_maps,
            pods,
        } = self;
        let ns = namespace.as_deref();
        let ingresses_reader = ingresses.reader.clone();
        let services_reader = services.reader.clone();
        let endpoints_reader = endpoints.reader.clone();
        let secrets_reader = secrets.reader.clone();
        let config_maps_reader = config_maps.reader.clone();
        let pods_reader = pods.reader.clone();

        let task_handles = vec![
            spawn_watch(api(&client, ns), ingresses, Arc::clone(&aggregator)),
            spawn_watch(api(&client, ns), services, Arc::clone(&aggregator)),
            spawn_watch(api(&client, ns), endpoints, Arc::clone(&aggregator)),
            spawn_watch(api(&client, ns), secrets, Arc::clone(&aggregator)),
            spawn_watch(api(&client, ns), config_maps, Arc::clone(&aggregator)),
            spawn_watch(api(&client, ns), pods, aggregator),
        ];
        info!(
            "🔍 Watch streams started for ingresses, services, endpoints, secrets, configmaps and pods in {}",
            ns.unwrap_or("all namespaces")
        );

        WatchManagerHandle {
            task_handles,
            readiness: vec![
                ready(ingresses_reader),
                ready(services_reader),
                ready(endpoints_reader),
                ready(secrets_reader),
                ready(config_maps_reader),
                ready(pods_reader),
            ],
        }
    }
}

impl Debug for WatchManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchManagerHandle")
            .field("tasks", &self.task_handles.len())
            .finish_non_exhaustive()
    }
}

impl Debug for WatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchManager")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

fn accept_all<K: 'static>() -> Accept<K> {
    Arc::new(|_: &K| true)
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
{
    namespace.map_or_else(
        || Api::all(client.clone()),
        |ns| Api::namespaced(client.clone(), ns),
    )
}

fn spawn_watch<K>(
    api: Api<K>,
    mut binding: Binding<K>,
    aggregator: Arc<DirtyStateAggregator>,
) -> tokio::task::JoinHandle<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    Arc<K>: Into<WatchedObject>,
{
    tokio::spawn(async move {
        let kind = K::kind(&());
        info!("🔍 Starting {} watcher", kind);

        let stream = watcher(api, watcher::Config::default()).default_backoff();
        pin_mut!(stream);

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    for change in binding.translate(event) {
                        debug!("📡 {} change observed", kind);
                        aggregator.apply(change);
                    }
                }
                Err(e) => warn!("❌ {} watch failed, backing off: {}", kind, e),
            }
        }
        info!("🔍 {} watcher stream ended", kind);
    })
}

type Readiness = BoxFuture<'static, Result<()>>;

fn ready<K>(store: Store<K>) -> Readiness
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async move {
        store
            .wait_until_ready()
            .await
            .map_err(|e| Error::Custom(format!("{} mirror never became ready: {e}", K::kind(&()))))
    }
    .boxed()
}

/// Handle to manage watch tasks
pub struct WatchManagerHandle {
    task_handles: Vec<tokio::task::JoinHandle<()>>,
    readiness: Vec<Readiness>,
}

impl WatchManagerHandle {
    /// Wait until every mirror completed its initial list
    ///
    /// # Errors
    ///
    /// Returns an error if a watch task ended before its first list completed.
    pub async fn wait_until_ready(&mut self) -> Result<()> {
        futures::future::try_join_all(self.readiness.drain(..)).await?;
        info!("✅ All mirrors synced");
        Ok(())
    }

    /// Shutdown all watch tasks
    pub fn shutdown(self) {
        for handle in self.task_handles {
            handle.abort();
        }
    }
}
