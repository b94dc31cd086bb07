//! Error types for the convergence harness
//!
//! Errors carry enough context (resource name, attempt count, last observed
//! value) to diagnose a failed run without re-running it.

use thiserror::Error;

/// Main error type for harness operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes client error that has no more specific classification
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A named resource does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (setting, deployment, ...)
        kind: String,
        /// Resource name
        name: String,
    },

    /// A stored payload could not be decoded
    #[error("failed to decode {resource}: {message}")]
    Decode {
        /// Resource whose payload was malformed
        resource: String,
        /// Decoder message
        message: String,
    },

    /// A payload could not be encoded for writing
    #[error("failed to encode {resource}: {message}")]
    Encode {
        /// Resource being written
        resource: String,
        /// Encoder message
        message: String,
    },

    /// The server rejected a write because the resource changed underneath us
    #[error("write conflict on {resource}: {message}")]
    WriteConflict {
        /// Resource being written
        resource: String,
        /// Server message
        message: String,
    },

    /// API or transport failure talking to the cluster or control plane
    #[error("api error [{context}]: {message}")]
    Api {
        /// Operation that failed (e.g. "get deployment cattle-system/rancher")
        context: String,
        /// Description of what failed
        message: String,
        /// Whether retrying may succeed
        retryable: bool,
    },

    /// Polling exhausted its attempt budget without the condition holding
    #[error(
        "{operation} did not converge after {attempts} attempts (last observed: {})",
        .last_observed.as_deref().unwrap_or("nothing")
    )]
    PollTimeout {
        /// What was being polled
        operation: String,
        /// Attempts made
        attempts: u32,
        /// Last successfully fetched value, rendered
        last_observed: Option<String>,
    },

    /// Polling exhausted its budget and at least one fetch failed
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// What was being polled
        operation: String,
        /// Attempts made
        attempts: u32,
        /// Last successfully fetched value, rendered
        last_observed: Option<String>,
        /// Most recent fetch error
        #[source]
        source: Box<Error>,
    },

    /// A deployment did not reach its desired ready replica count in time
    #[error(
        "deployment {namespace}/{name} did not reach {desired} ready replicas after {attempts} attempts (last ready: {})",
        .last_ready.map(|r| r.to_string()).unwrap_or_else(|| "unknown".to_string())
    )]
    ScaleTimeout {
        /// Deployment namespace
        namespace: String,
        /// Deployment name
        name: String,
        /// Requested replica count
        desired: i32,
        /// Ready replicas observed on the last successful fetch
        last_ready: Option<i32>,
        /// Attempts made
        attempts: u32,
    },

    /// Remote command failed inside a single replica
    #[error("exec in {replica} failed: {message}")]
    Exec {
        /// Pod the command ran in
        replica: String,
        /// Failure description (status message or transport error)
        message: String,
    },

    /// Replicas could not be listed
    #[error("failed to list replicas in {namespace} matching '{selector}': {message}")]
    ListReplicas {
        /// Namespace searched
        namespace: String,
        /// Label selector used
        selector: String,
        /// Failure description
        message: String,
    },

    /// The selector matched no live replicas, so nothing could be confirmed
    #[error("no live replicas in {namespace} match '{selector}'")]
    NoReplicas {
        /// Namespace searched
        namespace: String,
        /// Label selector used
        selector: String,
    },

    /// Polling was cancelled from outside
    #[error("{operation} cancelled after {attempts} attempts")]
    Cancelled {
        /// What was being polled
        operation: String,
        /// Attempts made before cancellation
        attempts: u32,
    },

    /// One or more cleanup actions failed while releasing a session
    #[error("{} cleanup action(s) failed: {}", .failures.len(), .failures.join("; "))]
    Cleanup {
        /// Rendered failure of every action that did not complete
        failures: Vec<String>,
    },

    /// Invalid or unreadable harness configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a retryable API error with context
    pub fn api(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Api {
            context: context.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create an API error that retrying will not fix (e.g. 4xx responses)
    pub fn api_permanent(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Api {
            context: context.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a per-replica exec failure
    pub fn exec(replica: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Exec {
            replica: replica.into(),
            message: msg.into(),
        }
    }

    /// Classify a kube-rs error raised while operating on a named resource.
    ///
    /// 404 becomes `NotFound`, 409 becomes `WriteConflict`, other API
    /// responses and transport failures become `Api`.
    pub fn from_kube(kind: &str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => Self::not_found(kind, name),
            kube::Error::Api(resp) if resp.code == 409 => Self::WriteConflict {
                resource: format!("{kind} {name}"),
                message: resp.message,
            },
            kube::Error::Api(resp) => Self::Api {
                context: format!("{kind} {name}"),
                message: resp.message,
                retryable: resp.code >= 500 || resp.code == 429,
            },
            other => Self::api(format!("{kind} {name}"), other.to_string()),
        }
    }

    /// Whether a poll loop may retry after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Api { retryable, .. } => *retryable,
            Error::Kube { .. } | Error::ListReplicas { .. } => true,
            _ => false,
        }
    }
}
