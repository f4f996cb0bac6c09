/**
 * Remote create/update against the API server
 */
use super::listers::ObjectLister;
use super::object_key::ObjectKey;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::{debug, info};

/// Remote writes for one namespaced kind
///
/// No retry or timeout happens here; failures surface immediately.
#[async_trait]
pub trait RemoteWriter<K>: Send + Sync {
    async fn create(&self, obj: &K) -> kube::Result<()>;

    async fn update(&self, obj: &K) -> kube::Result<()>;
}

#[async_trait]
impl<K> RemoteWriter<K> for Client
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn create(&self, obj: &K) -> kube::Result<()> {
        let api = namespaced_api::<K>(self.clone(), obj);
        api.create(&PostParams::default(), obj).await?;
        Ok(())
    }

    async fn update(&self, obj: &K) -> kube::Result<()> {
        let api = namespaced_api::<K>(self.clone(), obj);
        api.replace(&obj.name_any(), &PostParams::default(), obj).await?;
        Ok(())
    }
}

fn namespaced_api<K>(client: Client, obj: &K) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    Api::namespaced(client, &obj.namespace().unwrap_or_default())
}

/// Create `obj` remotely when the local mirror lacks it, update it otherwise
///
/// The lookup is not atomic against a concurrent creator of the same name;
/// every name written here has a single logical writer.
///
/// # Errors
///
/// Returns `Error::RemoteWrite` carrying the API error verbatim.
pub async fn create_or_update<K>(
    lister: &dyn ObjectLister<K>,
    writer: &dyn RemoteWriter<K>,
    obj: &K,
) -> Result<()>
where
    K: ResourceExt + Sync,
{
    let key = ObjectKey::from_resource(obj);
    let outcome = if lister.get(&key).is_some() {
        debug!("📝 Updating {}", key);
        writer.update(obj).await
    } else {
        debug!("➕ Creating {}", key);
        writer.create(obj).await
    };
    outcome.map_err(|source| Error::RemoteWrite {
        namespace: key.namespace.clone(),
        name: key.name.clone(),
        source,
    })?;
    info!("💾 Stored {}", key);
    Ok(())
}
