/**
 * ACME credential storage
 *
 * Account key, issued certificates and HTTP-01 challenge tokens. Only the
 * storage contract lives here; the ACME protocol itself is driven elsewhere.
 */
use super::certs::{ParsedCertificate, parse_certificate, validate_private_key};
use super::config::{ACME_KEY_BITS, SECRET_TYPE_TLS, TLS_CERT_ENTRY, TLS_KEY_ENTRY};
use super::listers::ObjectLister;
use super::object_key::ObjectKey;
use super::resolver::entry;
use super::writer::{RemoteWriter, create_or_update};
use crate::error::{Error, Result};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rsa::RsaPrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::DecodePrivateKey;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A certificate issued through ACME together with its PEM private key
#[derive(Debug, Clone)]
pub struct AcmeCertificate {
    pub certificate: ParsedCertificate,
    pub key_pem: Vec<u8>,
}

/// Storage for the ACME account key, issued certificates and challenge tokens
pub struct AcmeStore {
    account_secret: ObjectKey,
    token_config_map: ObjectKey,
    secrets: Arc<dyn ObjectLister<Secret>>,
    config_maps: Arc<dyn ObjectLister<ConfigMap>>,
    secret_writer: Arc<dyn RemoteWriter<Secret>>,
    config_map_writer: Arc<dyn RemoteWriter<ConfigMap>>,
    /// Last account key decoded or persisted, serializing `signer` calls
    signer: Mutex<Option<RsaPrivateKey>>,
}

impl AcmeStore {
    pub fn new(
        account_secret: ObjectKey,
        token_config_map: ObjectKey,
        secrets: Arc<dyn ObjectLister<Secret>>,
        config_maps: Arc<dyn ObjectLister<ConfigMap>>,
        secret_writer: Arc<dyn RemoteWriter<Secret>>,
        config_map_writer: Arc<dyn RemoteWriter<ConfigMap>>,
    ) -> Self {
        Self {
            account_secret,
            token_config_map,
            secrets,
            config_maps,
            secret_writer,
            config_map_writer,
            signer: Mutex::new(None),
        }
    }

    /// The ACME account key, generated and persisted on first use
    ///
    /// A new 2048-bit RSA key is only generated when the account secret or
    /// its `tls.key` entry is absent. Other entries of an existing secret
    /// are preserved. A key persisted by an earlier call is returned until
    /// the mirror reflects it, so only one key is ever created.
    ///
    /// # Errors
    ///
    /// Returns a parse error when the stored key is present but unreadable,
    /// and a remote-write error when persisting a new key fails.
    pub async fn signer(&self) -> Result<RsaPrivateKey> {
        let mut signer = self.signer.lock().await;

        let existing = self.secrets.get(&self.account_secret);
        if let Some(pem) = existing.as_deref().and_then(|s| entry(s, TLS_KEY_ENTRY)) {
            debug!("🔑 Using stored ACME account key {}", self.account_secret);
            let key = decode_rsa_key(pem)?;
            *signer = Some(key.clone());
            return Ok(key);
        }
        if let Some(key) = signer.as_ref() {
            debug!("🔑 Account key {} not mirrored yet, reusing it", self.account_secret);
            return Ok(key.clone());
        }

        info!("🔑 Generating {}-bit ACME account key", ACME_KEY_BITS);
        let key = tokio::task::spawn_blocking(|| {
            RsaPrivateKey::new(&mut rand::thread_rng(), ACME_KEY_BITS)
        })
        .await
        .map_err(|e| Error::Custom(format!("account key generation aborted: {e}")))?
        .map_err(|e| Error::Custom(format!("account key generation failed: {e}")))?;

        let pem = key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| Error::Custom(format!("failed to encode account key: {e}")))?;

        let mut secret = existing.map_or_else(
            || Secret {
                metadata: object_meta(&self.account_secret),
                ..Secret::default()
            },
            |s| (*s).clone(),
        );
        secret
            .data
            .get_or_insert_with(Default::default)
            .insert(TLS_KEY_ENTRY.to_string(), ByteString(pem.as_bytes().to_vec()));

        create_or_update(self.secrets.as_ref(), self.secret_writer.as_ref(), &secret).await?;
        *signer = Some(key.clone());
        Ok(key)
    }

    /// A certificate previously issued into `key`
    ///
    /// `None` means "not issued yet": the secret is absent, an entry is
    /// missing or the content does not parse. Any private key rustls can
    /// load is accepted (PKCS#1, PKCS#8 or SEC1), not only PKCS#1 RSA.
    #[must_use]
    pub fn tls_secret(&self, key: &ObjectKey) -> Option<AcmeCertificate> {
        let secret = self.secrets.get(key)?;
        let crt = entry(&secret, TLS_CERT_ENTRY)?;
        let key_pem = entry(&secret, TLS_KEY_ENTRY)?;

        let certificate = parse_certificate(crt)
            .and_then(|certificate| validate_private_key(key_pem).map(|()| certificate));
        match certificate {
            Ok(certificate) => Some(AcmeCertificate {
                certificate,
                key_pem: key_pem.to_vec(),
            }),
            Err(e) => {
                warn!("Ignoring unreadable ACME certificate {}: {}", key, e);
                None
            }
        }
    }

    /// Store an issued certificate as a `kubernetes.io/tls` secret
    ///
    /// # Errors
    ///
    /// Returns a remote-write error when the API server rejects the write.
    pub async fn store_tls_secret(&self, key: &ObjectKey, crt: &[u8], key_pem: &[u8]) -> Result<()> {
        let mut secret = self.secrets.get(key).map_or_else(
            || Secret {
                metadata: object_meta(key),
                ..Secret::default()
            },
            |s| (*s).clone(),
        );
        secret.type_ = Some(SECRET_TYPE_TLS.to_string());
        let data = secret.data.get_or_insert_with(Default::default);
        data.insert(TLS_CERT_ENTRY.to_string(), ByteString(crt.to_vec()));
        data.insert(TLS_KEY_ENTRY.to_string(), ByteString(key_pem.to_vec()));

        create_or_update(self.secrets.as_ref(), self.secret_writer.as_ref(), &secret).await
    }

    /// The challenge token for `uri` under `domain`
    ///
    /// `None` when the token config map, the domain entry or a value for
    /// exactly this `uri` is missing.
    #[must_use]
    pub fn token(&self, domain: &str, uri: &str) -> Option<String> {
        let config_map = self.config_maps.get(&self.token_config_map)?;
        let value = config_map.data.as_ref()?.get(domain)?;
        let token = decode_token(value, uri)?;
        (!token.is_empty()).then(|| token.to_string())
    }

    /// Publish the challenge token for `domain`; an empty token removes it
    ///
    /// # Errors
    ///
    /// Returns a remote-write error when the API server rejects the write.
    pub async fn set_token(&self, domain: &str, uri: &str, token: &str) -> Result<()> {
        let mut config_map = self.config_maps.get(&self.token_config_map).map_or_else(
            || ConfigMap {
                metadata: object_meta(&self.token_config_map),
                ..ConfigMap::default()
            },
            |cm| (*cm).clone(),
        );
        let data = config_map.data.get_or_insert_with(Default::default);
        if token.is_empty() {
            debug!("🧹 Removing challenge token of {}", domain);
            data.remove(domain);
        } else {
            debug!("🎫 Publishing challenge token of {} at {}", domain, uri);
            data.insert(domain.to_string(), encode_token(uri, token));
        }

        create_or_update(
            self.config_maps.as_ref(),
            self.config_map_writer.as_ref(),
            &config_map,
        )
        .await
    }
}

impl std::fmt::Debug for AcmeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeStore")
            .field("account_secret", &self.account_secret)
            .field("token_config_map", &self.token_config_map)
            .finish_non_exhaustive()
    }
}

fn encode_token(uri: &str, token: &str) -> String {
    format!("{uri}={token}")
}

fn decode_token<'a>(value: &'a str, uri: &str) -> Option<&'a str> {
    value.strip_prefix(uri)?.strip_prefix('=')
}

/// PKCS#1 `RSA PRIVATE KEY`, with PKCS#8 `PRIVATE KEY` also accepted
fn decode_rsa_key(pem: &[u8]) -> Result<RsaPrivateKey> {
    let pem = std::str::from_utf8(pem)
        .map_err(|e| Error::parse(format!("account key is not valid PEM: {e}")))?;
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| Error::parse(format!("invalid account key: {e}")))
}

fn object_meta(key: &ObjectKey) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(key.namespace.clone()),
        name: Some(key.name.clone()),
        ..ObjectMeta::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kube::Resource;
    use kube::runtime::reflector::{self, Store, store::Writer};
    use kube::runtime::watcher;
    use std::collections::BTreeMap;

    const TLS_CRT: &[u8] = include_bytes!("../../../tests/fixtures/tls.crt");
    const TLS_KEY: &[u8] = include_bytes!("../../../tests/fixtures/tls.key");

    /// Applies every write straight to the mirror, like a watch would
    struct MirrorWriter<K: Resource<DynamicType = ()> + Clone + 'static> {
        mirror: std::sync::Mutex<Writer<K>>,
        writes: std::sync::Mutex<Vec<&'static str>>,
    }

    impl<K: Resource<DynamicType = ()> + Clone + 'static> MirrorWriter<K> {
        fn new(mirror: Writer<K>) -> Self {
            Self {
                mirror: std::sync::Mutex::new(mirror),
                writes: std::sync::Mutex::default(),
            }
        }

        fn record(&self, verb: &'static str, obj: &K) {
            self.writes.lock().unwrap().push(verb);
            self.mirror
                .lock()
                .unwrap()
                .apply_watcher_event(&watcher::Event::Apply(obj.clone()));
        }

        fn writes(&self) -> Vec<&'static str> {
            self.writes.lock().unwrap().clone()
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

    /// Records writes without feeding them back, like a watch that has not caught up
    #[derive(Default)]
    struct DetachedWriter {
        writes: std::sync::Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl RemoteWriter<Secret> for DetachedWriter {
        async fn create(&self, _obj: &Secret) -> kube::Result<()> {
            self.writes.lock().unwrap().push("create");
            Ok(())
        }

        async fn update(&self, _obj: &Secret) -> kube::Result<()> {
            self.writes.lock().unwrap().push("update");
            Ok(())
        }
    }

    struct Fixture {
        store: AcmeStore,
        secrets: Store<Secret>,
        secret_writer: Arc<MirrorWriter<Secret>>,
        config_map_writer: Arc<MirrorWriter<ConfigMap>>,
    }

    fn fixture(seed: Vec<Secret>) -> Fixture {
        let (secrets, mut secrets_mirror) = reflector::store::<Secret>();
        for secret in seed {
            secrets_mirror.apply_watcher_event(&watcher::Event::Apply(secret));
        }
        let (config_maps, config_maps_mirror) = reflector::store::<ConfigMap>();
        let secret_writer = Arc::new(MirrorWriter::new(secrets_mirror));
        let config_map_writer = Arc::new(MirrorWriter::new(config_maps_mirror));

        let store = AcmeStore::new(
            ObjectKey::new("ingress", "acme-private-key"),
            ObjectKey::new("ingress", "acme-validation-tokens"),
            Arc::new(secrets.clone()),
            Arc::new(config_maps),
            secret_writer.clone(),
            config_map_writer.clone(),
        );
        Fixture {
            store,
            secrets,
            secret_writer,
            config_map_writer,
        }
    }

    fn secret(name: &str, entries: &[(&str, &[u8])]) -> Secret {
        Secret {
            metadata: object_meta(&ObjectKey::new("ingress", name)),
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), ByteString(v.to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Secret::default()
        }
    }

    #[tokio::test]
    async fn test_signer_reuses_stored_key() {
        let f = fixture(vec![secret("acme-private-key", &[(TLS_KEY_ENTRY, TLS_KEY)])]);

        let first = f.store.signer().await.unwrap();
        let second = f.store.signer().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first,
            RsaPrivateKey::from_pkcs1_pem(std::str::from_utf8(TLS_KEY).unwrap()).unwrap()
        );
        assert!(f.secret_writer.writes().is_empty());
    }

    #[tokio::test]
    async fn test_signer_generates_once_and_keeps_other_entries() {
        let f = fixture(vec![secret("acme-private-key", &[("email", b"ops@example.com")])]);

        let generated = f.store.signer().await.unwrap();
        let again = f.store.signer().await.unwrap();
        assert_eq!(generated, again);
        assert_eq!(f.secret_writer.writes(), vec!["update"]);

        let stored = ObjectLister::get(&f.secrets, &ObjectKey::new("ingress", "acme-private-key")).unwrap();
        assert_eq!(entry(&stored, "email"), Some(b"ops@example.com".as_slice()));
        assert!(entry(&stored, TLS_KEY_ENTRY).is_some());
    }

    #[tokio::test]
    async fn test_signer_is_stable_before_the_mirror_catches_up() {
        let (secrets, _mirror) = reflector::store::<Secret>();
        let (config_maps, config_maps_mirror) = reflector::store::<ConfigMap>();
        let writer = Arc::new(DetachedWriter::default());
        let store = AcmeStore::new(
            ObjectKey::new("ingress", "acme-private-key"),
            ObjectKey::new("ingress", "acme-validation-tokens"),
            Arc::new(secrets),
            Arc::new(config_maps),
            writer.clone(),
            Arc::new(MirrorWriter::new(config_maps_mirror)),
        );

        let first = store.signer().await.unwrap();
        let second = store.signer().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(*writer.writes.lock().unwrap(), vec!["create"]);
    }

    #[tokio::test]
    async fn test_corrupt_account_key_is_never_regenerated() {
        let f = fixture(vec![secret("acme-private-key", &[(TLS_KEY_ENTRY, b"garbage")])]);

        assert!(matches!(f.store.signer().await, Err(Error::Parse(_))));
        assert!(f.secret_writer.writes().is_empty());
    }

    #[tokio::test]
    async fn test_tls_secret_round_trip() {
        let f = fixture(vec![secret("half-issued", &[(TLS_CERT_ENTRY, TLS_CRT)])]);
        let key = ObjectKey::new("ingress", "www-example-com");

        assert!(f.store.tls_secret(&key).is_none());
        assert!(f.store.tls_secret(&ObjectKey::new("ingress", "half-issued")).is_none());

        f.store.store_tls_secret(&key, TLS_CRT, TLS_KEY).await.unwrap();
        let issued = f.store.tls_secret(&key).unwrap();
        assert_eq!(issued.certificate.identity.common_name, "www.example.com");
        assert_eq!(issued.key_pem, TLS_KEY);

        let stored = ObjectLister::get(&f.secrets, &key).unwrap();
        assert_eq!(stored.type_.as_deref(), Some(SECRET_TYPE_TLS));
        assert_eq!(f.secret_writer.writes(), vec!["create"]);
    }

    #[tokio::test]
    async fn test_issued_certificate_accepts_pkcs8_key() {
        use rsa::pkcs8::EncodePrivateKey;

        let f = fixture(vec![]);
        let key = ObjectKey::new("ingress", "pkcs8");
        let rsa_key = RsaPrivateKey::from_pkcs1_pem(std::str::from_utf8(TLS_KEY).unwrap()).unwrap();
        let pkcs8 = rsa_key.to_pkcs8_pem(LineEnding::LF).unwrap();

        f.store.store_tls_secret(&key, TLS_CRT, pkcs8.as_bytes()).await.unwrap();
        let issued = f.store.tls_secret(&key).unwrap();
        assert_eq!(issued.key_pem, pkcs8.as_bytes());
    }

    #[tokio::test]
    async fn test_unparseable_issued_certificate_reads_as_absent() {
        let f = fixture(vec![secret(
            "broken",
            &[(TLS_CERT_ENTRY, b"garbage"), (TLS_KEY_ENTRY, TLS_KEY)],
        )]);
        assert!(f.store.tls_secret(&ObjectKey::new("ingress", "broken")).is_none());
    }

    #[tokio::test]
    async fn test_token_set_get_and_clear() {
        let f = fixture(vec![]);

        assert_eq!(f.store.token("example.com", "/acme/x"), None);

        f.store.set_token("example.com", "/acme/x", "tok1").await.unwrap();
        assert_eq!(f.store.token("example.com", "/acme/x"), Some("tok1".to_string()));
        assert_eq!(f.store.token("example.com", "/acme/y"), None);
        assert_eq!(f.store.token("other.com", "/acme/x"), None);

        f.store.set_token("example.com", "/acme/x", "").await.unwrap();
        assert_eq!(f.store.token("example.com", "/acme/x"), None);
        assert_eq!(f.config_map_writer.writes(), vec!["create", "update"]);
    }

    #[test]
    fn test_token_prefix_must_match_exactly() {
        assert_eq!(decode_token("/acme/x=tok1", "/acme/x"), Some("tok1"));
        assert_eq!(decode_token("/acme/xy=tok1", "/acme/x"), None);
        assert_eq!(decode_token("/acme/x=a=b", "/acme/x"), Some("a=b"));
        assert_eq!(encode_token("/acme/x", "tok1"), "/acme/x=tok1");
    }
}
