#![allow(dead_code)]

use async_trait::async_trait;
use ingress_cache::k8s::cache::RemoteWriter;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher;
use std::sync::Mutex;

pub const TLS_CRT: &[u8] = include_bytes!("../fixtures/tls.crt");
pub const TLS_KEY: &[u8] = include_bytes!("../fixtures/tls.key");
pub const CA_CRT: &[u8] = include_bytes!("../fixtures/ca.crt");
pub const DH_PARAM: &[u8] = include_bytes!("../fixtures/dhparam.pem");

pub fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(namespace.to_string()),
        name: Some(name.to_string()),
        ..ObjectMeta::default()
    }
}

pub fn secret(namespace: &str, name: &str, entries: &[(&str, &[u8])]) -> Secret {
    Secret {
        metadata: meta(namespace, name),
        data: Some(
            entries
                .iter()
                .map(|(k, v)| ((*k).to_string(), ByteString(v.to_vec())))
                .collect(),
        ),
        ..Secret::default()
    }
}

/// Remote writer that lands every write in the local mirror, as the watch would
pub struct MirrorWriter<K: Resource<DynamicType = ()> + Clone + 'static> {
    mirror: Mutex<Writer<K>>,
    writes: Mutex<Vec<String>>,
}

impl<K: Resource<DynamicType = ()> + Clone + 'static> MirrorWriter<K> {
    pub fn new(mirror: Writer<K>) -> Self {
        Self {
            mirror: Mutex::new(mirror),
            writes: Mutex::default(),
        }
    }

    pub fn seed(&self, obj: K) {
        self.mirror
            .lock()
            .unwrap()
            .apply_watcher_event(&watcher::Event::Apply(obj));
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    fn record(&self, verb: &str, obj: &K) {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.writes.lock().unwrap().push(format!("{verb} {name}"));
        self.seed(obj.clone());
    }
}

#[async_trait]
impl<K> RemoteWriter<K> for MirrorWriter<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync,
{
    async fn create(&self, obj: &K) -> kube::Result<()> {
        self.record("create", obj);
        Ok(())
    }

    async fn update(&self, obj: &K) -> kube::Result<()> {
        self.record("update", obj);
        Ok(())
    }
}
