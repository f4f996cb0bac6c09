/**
 * Secret/Credential Resolver
 *
 * Resolves namespaced secret references under the cross-namespace policy and
 * turns secret entries into files the proxy configuration can point at.
 */
use super::certs::{CertificateStore, fingerprint, parse_certificate, validate_private_key};
use super::config::{CA_CERT_ENTRY, CA_CRL_ENTRY, DH_PARAM_ENTRY, TLS_CERT_ENTRY, TLS_KEY_ENTRY};
use super::listers::ObjectLister;
use super::object_key::ObjectKey;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Secret;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

/// A materialised credential file and the fingerprint of its content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialFile {
    pub filename: PathBuf,
    pub fingerprint: String,
}

/// A TLS keypair file plus the identity of its certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtFile {
    pub filename: PathBuf,
    pub fingerprint: String,
    pub common_name: String,
    pub not_after: OffsetDateTime,
}

/// CA bundle with its optional revocation list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaFiles {
    pub ca: CredentialFile,
    pub crl: Option<CredentialFile>,
}

pub struct SecretResolver {
    allow_cross_namespace: bool,
    secrets: Arc<dyn ObjectLister<Secret>>,
    store: Arc<CertificateStore>,
}

impl SecretResolver {
    pub fn new(
        allow_cross_namespace: bool,
        secrets: Arc<dyn ObjectLister<Secret>>,
        store: Arc<CertificateStore>,
    ) -> Self {
        Self {
            allow_cross_namespace,
            secrets,
            store,
        }
    }

    /// Resolve `reference` as seen from an object living in `default_namespace`
    ///
    /// A bare reference lands in `default_namespace`; an empty default
    /// namespace accepts the reference as written.
    ///
    /// # Errors
    ///
    /// Returns a parse error for a malformed reference and an authorization
    /// error when it points to another namespace while cross-namespace
    /// access is disabled.
    pub fn resolve_ref(&self, default_namespace: &str, reference: &str) -> Result<ObjectKey> {
        let key = ObjectKey::parse(reference)?;
        if default_namespace.is_empty() {
            return Ok(key);
        }
        if key.namespace.is_empty() {
            return Ok(ObjectKey::new(default_namespace, key.name));
        }
        if self.allow_cross_namespace || key.namespace == default_namespace {
            return Ok(key);
        }
        Err(Error::Authorization {
            reference: reference.to_string(),
            namespace: default_namespace.to_string(),
        })
    }

    /// Certificate and private key of a TLS secret, written as one PEM file
    ///
    /// # Errors
    ///
    /// Fails if the reference is rejected, the secret or one of its
    /// `tls.crt`/`tls.key` entries is missing, or either is malformed.
    pub fn tls_certificate(&self, default_namespace: &str, reference: &str) -> Result<CrtFile> {
        let key = self.resolve_ref(default_namespace, reference)?;
        let secret = self.secret(&key)?;
        let crt = required_entry(&secret, &key, TLS_CERT_ENTRY)?;
        let pem_key = required_entry(&secret, &key, TLS_KEY_ENTRY)?;

        let certificate = parse_certificate(crt)?;
        validate_private_key(pem_key)?;

        let filename = self.store.store_tls(&key, crt, pem_key)?;
        debug!("🔐 Resolved TLS secret {} ({})", key, certificate.identity.common_name);
        Ok(CrtFile {
            filename,
            fingerprint: fingerprint(&[crt, pem_key]),
            common_name: certificate.identity.common_name,
            not_after: certificate.identity.not_after,
        })
    }

    /// CA bundle and, if present, its CRL; both share one fingerprint
    ///
    /// # Errors
    ///
    /// Fails if the reference is rejected, the secret or its `ca.crt`
    /// entry is missing, or the CA certificate is malformed.
    pub fn ca_certificate(&self, default_namespace: &str, reference: &str) -> Result<CaFiles> {
        let key = self.resolve_ref(default_namespace, reference)?;
        let secret = self.secret(&key)?;
        let ca = required_entry(&secret, &key, CA_CERT_ENTRY)?;
        let crl = entry(&secret, CA_CRL_ENTRY);

        parse_certificate(ca)?;

        let hash = match crl {
            Some(crl) => fingerprint(&[ca, crl]),
            None => fingerprint(&[ca]),
        };
        let (ca_path, crl_path) = self.store.store_ca(&key, ca, crl)?;
        Ok(CaFiles {
            ca: CredentialFile {
                filename: ca_path,
                fingerprint: hash.clone(),
            },
            crl: crl_path.map(|filename| CredentialFile {
                filename,
                fingerprint: hash,
            }),
        })
    }

    /// Diffie-Hellman parameters, written once per distinct content
    ///
    /// # Errors
    ///
    /// Fails if the reference is rejected, the secret or its `dhparam.pem`
    /// entry is missing, or the file can not be written.
    pub fn dh_params(&self, default_namespace: &str, reference: &str) -> Result<CredentialFile> {
        let key = self.resolve_ref(default_namespace, reference)?;
        let secret = self.secret(&key)?;
        let dh = required_entry(&secret, &key, DH_PARAM_ENTRY)?;

        let filename = self.store.store_dh_param(&key, dh)?;
        Ok(CredentialFile {
            filename,
            fingerprint: fingerprint(&[dh]),
        })
    }

    /// Raw bytes of one secret entry
    ///
    /// # Errors
    ///
    /// Fails if the reference is rejected or the secret or entry is missing.
    pub fn secret_content(
        &self,
        default_namespace: &str,
        reference: &str,
        entry_name: &str,
    ) -> Result<Vec<u8>> {
        let key = self.resolve_ref(default_namespace, reference)?;
        let secret = self.secret(&key)?;
        required_entry(&secret, &key, entry_name).map(<[u8]>::to_vec)
    }

    fn secret(&self, key: &ObjectKey) -> Result<Arc<Secret>> {
        self.secrets
            .get(key)
            .ok_or_else(|| Error::not_found(&key.namespace, &key.name))
    }
}

impl std::fmt::Debug for SecretResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretResolver")
            .field("allow_cross_namespace", &self.allow_cross_namespace)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

pub(crate) fn entry<'a>(secret: &'a Secret, name: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(name))
        .map(|bytes| bytes.0.as_slice())
}

fn required_entry<'a>(secret: &'a Secret, key: &ObjectKey, name: &str) -> Result<&'a [u8]> {
    entry(secret, name).ok_or_else(|| Error::missing_entry(&key.namespace, &key.name, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::reflector::{self, Store};
    use kube::runtime::watcher;
    use std::collections::BTreeMap;

    const TLS_CRT: &[u8] = include_bytes!("../../../tests/fixtures/tls.crt");
    const TLS_KEY: &[u8] = include_bytes!("../../../tests/fixtures/tls.key");
    const CA_CRT: &[u8] = include_bytes!("../../../tests/fixtures/ca.crt");
    const DH_PARAM: &[u8] = include_bytes!("../../../tests/fixtures/dhparam.pem");

    fn secret(namespace: &str, name: &str, entries: &[(&str, &[u8])]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), ByteString(v.to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Secret::default()
        }
    }

    fn resolver(allow_cross_namespace: bool, secrets: Vec<Secret>) -> (SecretResolver, tempfile::TempDir) {
        let (reader, mut writer): (Store<Secret>, _) = reflector::store();
        for s in secrets {
            writer.apply_watcher_event(&watcher::Event::Apply(s));
        }
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CertificateStore::new(dir.path()));
        (
            SecretResolver::new(allow_cross_namespace, Arc::new(reader), store),
            dir,
        )
    }

    #[test]
    fn test_cross_namespace_policy() {
        let (strict, _dir) = resolver(false, vec![]);
        assert!(matches!(
            strict.resolve_ref("a", "b/secret1"),
            Err(Error::Authorization { .. })
        ));
        assert_eq!(strict.resolve_ref("a", "a/secret1").unwrap(), ObjectKey::new("a", "secret1"));
        assert_eq!(strict.resolve_ref("a", "secret1").unwrap(), ObjectKey::new("a", "secret1"));
        assert_eq!(strict.resolve_ref("", "b/secret1").unwrap(), ObjectKey::new("b", "secret1"));

        let (relaxed, _dir) = resolver(true, vec![]);
        assert_eq!(relaxed.resolve_ref("a", "b/secret1").unwrap(), ObjectKey::new("b", "secret1"));
    }

    #[test]
    fn test_tls_certificate() {
        let (resolver, _dir) = resolver(
            false,
            vec![secret("web", "site-tls", &[(TLS_CERT_ENTRY, TLS_CRT), (TLS_KEY_ENTRY, TLS_KEY)])],
        );

        let crt = resolver.tls_certificate("web", "site-tls").unwrap();
        assert_eq!(crt.common_name, "www.example.com");
        assert!(crt.filename.ends_with("web_site-tls.pem"));
        assert_eq!(crt.fingerprint, fingerprint(&[TLS_CRT, TLS_KEY]));
        assert!(crt.filename.exists());
    }

    #[test]
    fn test_tls_certificate_requires_both_entries() {
        let (resolver, _dir) = resolver(
            false,
            vec![secret("web", "crt-only", &[(TLS_CERT_ENTRY, TLS_CRT)])],
        );

        let err = resolver.tls_certificate("web", "crt-only").unwrap_err();
        assert!(matches!(
            err,
            Error::NotFound { ref entry, .. } if entry.as_deref() == Some(TLS_KEY_ENTRY)
        ));
        assert!(matches!(
            resolver.tls_certificate("web", "missing"),
            Err(Error::NotFound { entry: None, .. })
        ));
    }

    #[test]
    fn test_malformed_tls_is_a_hard_failure() {
        let (resolver, _dir) = resolver(
            false,
            vec![secret(
                "web",
                "broken",
                &[(TLS_CERT_ENTRY, b"garbage"), (TLS_KEY_ENTRY, TLS_KEY)],
            )],
        );
        assert!(matches!(
            resolver.tls_certificate("web", "broken"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_ca_with_optional_crl() {
        let (resolver, _dir) = resolver(
            false,
            vec![
                secret("web", "ca", &[(CA_CERT_ENTRY, CA_CRT)]),
                secret("web", "ca-crl", &[(CA_CERT_ENTRY, CA_CRT), (CA_CRL_ENTRY, b"crl")]),
            ],
        );

        let plain = resolver.ca_certificate("web", "ca").unwrap();
        assert!(plain.crl.is_none());
        assert_eq!(plain.ca.fingerprint, fingerprint(&[CA_CRT]));

        let with_crl = resolver.ca_certificate("web", "ca-crl").unwrap();
        let crl = with_crl.crl.unwrap();
        assert_eq!(crl.fingerprint, with_crl.ca.fingerprint);
        assert_ne!(with_crl.ca.fingerprint, plain.ca.fingerprint);
        assert!(crl.filename.ends_with("ca/web_ca-crl-crl.pem"));
    }

    #[test]
    fn test_ca_certificate_requires_ca_entry() {
        let (resolver, _dir) = resolver(
            false,
            vec![
                secret("web", "crl-only", &[(CA_CRL_ENTRY, b"crl")]),
                secret("web", "bad-ca", &[(CA_CERT_ENTRY, b"garbage")]),
            ],
        );

        assert!(matches!(
            resolver.ca_certificate("web", "crl-only"),
            Err(Error::NotFound { ref entry, .. }) if entry.as_deref() == Some(CA_CERT_ENTRY)
        ));
        assert!(matches!(
            resolver.ca_certificate("web", "bad-ca"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_dh_params_require_dh_entry() {
        let (resolver, dir) = resolver(false, vec![secret("web", "no-dh", &[("auth", b"x")])]);

        assert!(matches!(
            resolver.dh_params("web", "no-dh"),
            Err(Error::NotFound { ref entry, .. }) if entry.as_deref() == Some(DH_PARAM_ENTRY)
        ));
        assert!(!dir.path().join("dhparam").exists());
    }

    #[test]
    fn test_dh_params_and_raw_content() {
        let (resolver, _dir) = resolver(
            false,
            vec![secret("web", "dh", &[(DH_PARAM_ENTRY, DH_PARAM), ("auth", b"user:pass")])],
        );

        let first = resolver.dh_params("web", "dh").unwrap();
        let second = resolver.dh_params("web", "web/dh").unwrap();
        assert_eq!(first, second);
        assert!(first.filename.ends_with("dhparam/web_dh.pem"));
        assert_eq!(first.fingerprint, fingerprint(&[DH_PARAM]));

        assert_eq!(resolver.secret_content("web", "dh", "auth").unwrap(), b"user:pass");
        assert!(matches!(
            resolver.secret_content("web", "dh", "missing"),
            Err(Error::NotFound { .. })
        ));
    }
}
