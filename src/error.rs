use derive_more::From;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Kube(kube::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    #[from]
    HttpHeader(hyper::http::Error),

    #[from]
    Io(std::io::Error),

    /// Malformed object reference, PEM/DER content or label selector
    Parse(String),

    /// Referenced object, or a required entry inside it, is missing
    NotFound {
        namespace: String,
        name: String,
        entry: Option<String>,
    },

    /// Cross-namespace reference rejected by policy
    Authorization { reference: String, namespace: String },

    /// Create or update against the API server failed
    RemoteWrite {
        namespace: String,
        name: String,
        source: kube::Error,
    },

    /// Custom error message
    Custom(String),
}

impl Error {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    pub fn not_found(namespace: &str, name: &str) -> Self {
        Self::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
            entry: None,
        }
    }

    pub fn missing_entry(namespace: &str, name: &str, entry: &str) -> Self {
        Self::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
            entry: Some(entry.to_string()),
        }
    }

    /// Only transport and API-server write failures are retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteWrite { .. } | Self::Kube(_))
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Kube(e) => write!(fmt, "kubernetes api error: {e}"),
            Self::Infer(e) => write!(fmt, "cannot infer kubernetes config: {e}"),
            Self::HttpHeader(e) => write!(fmt, "invalid http header: {e}"),
            Self::Io(e) => write!(fmt, "i/o error: {e}"),
            Self::Parse(message) => write!(fmt, "parse error: {message}"),
            Self::NotFound {
                namespace,
                name,
                entry: None,
            } => write!(fmt, "'{namespace}/{name}' not found"),
            Self::NotFound {
                namespace,
                name,
                entry: Some(entry),
            } => write!(fmt, "secret '{namespace}/{name}' does not have key '{entry}'"),
            Self::Authorization {
                reference,
                namespace,
            } => write!(
                fmt,
                "trying to read secret '{reference}' from namespace '{namespace}', but cross-namespace reading is disabled"
            ),
            Self::RemoteWrite {
                namespace,
                name,
                source,
            } => write!(fmt, "error writing '{namespace}/{name}': {source}"),
            Self::Custom(message) => write!(fmt, "{message}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Kube(e) | Self::RemoteWrite { source: e, .. } => Some(e),
            Self::Infer(e) => Some(e),
            Self::HttpHeader(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_names_the_entry() {
        let err = Error::missing_entry("web", "site-tls", "tls.key");
        assert_eq!(
            err.to_string(),
            "secret 'web/site-tls' does not have key 'tls.key'"
        );

        let err = Error::not_found("web", "site-tls");
        assert_eq!(err.to_string(), "'web/site-tls' not found");
    }

    #[test]
    fn test_policy_errors_are_not_retryable() {
        let denied = Error::Authorization {
            reference: "other/secret".to_string(),
            namespace: "web".to_string(),
        };
        assert!(!denied.is_retryable());
        assert!(!Error::parse("bad pem").is_retryable());
        assert!(!Error::not_found("a", "b").is_retryable());
    }
}
