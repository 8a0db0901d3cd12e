//! Error types for module resolution and config conversion.

use std::fmt;
use std::time::Duration;

/// Module resolution and conversion errors.
///
/// Errors are `Clone` because one fetch outcome is handed to every caller
/// waiting on the same key.
///
/// A failed fetch is either [`WasmError::FetchFailure`] or, when the request
/// timeout ran out, [`WasmError::Timeout`]. Both are fetch failures: use
/// [`WasmError::is_fetch_failure`] rather than matching one variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WasmError {
    /// Resource cannot be parsed as an extension config.
    #[error("malformed extension config: {message}")]
    MalformedInput { message: String },

    /// A pull secret was referenced but its content is missing.
    #[error("missing image pull secret for {resource}")]
    MissingCredential { resource: String },

    /// A wasm filter has neither a remote nor a local code source.
    #[error("no remote or local code source in wasm filter {resource}")]
    NoFetchSourceSpecified { resource: String },

    /// Remote code source without an HTTP URI.
    #[error("remote code source of {resource} does not specify an http uri")]
    MissingFetchHint { resource: String },

    /// Expected checksum is not a sha256 hex digest.
    #[error("invalid checksum {checksum:?}: {reason}")]
    InvalidChecksum { checksum: String, reason: String },

    /// Network or transport failure.
    #[error("failed to fetch {uri}: {message}")]
    FetchFailure { uri: String, message: String },

    /// The fetch did not complete within the request timeout.
    ///
    /// A fetch failure like [`WasmError::FetchFailure`], kept apart so callers
    /// can tell a slow source from a broken one.
    #[error("fetching {uri} timed out after {timeout:?}")]
    Timeout { uri: String, timeout: Duration },

    /// Downloaded content does not match the expected checksum.
    #[error("checksum mismatch for {uri}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        uri: String,
        expected: String,
        actual: String,
    },

    /// Downloaded content is not a Wasm binary.
    #[error("module fetched from {uri} is not a valid wasm binary: {message}")]
    InvalidModule { uri: String, message: String },

    /// Pull policy forbids fetching and no artifact is cached.
    #[error("module {uri} is not cached and pull policy is Never")]
    NotCached { uri: String },

    /// Local store failure.
    #[error("store error: {message}")]
    Store { message: String },

    /// The rewritten resource could not be encoded.
    #[error("failed to encode extension config: {message}")]
    SerializationFailure { message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A conversion task ended without reporting a result.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Outcome category reported to conversion metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    UnmarshalFailure,
    FetchFailure,
    ChecksumFailure,
    NoRemoteLoad,
    MissRemoteFetchHint,
    MarshalFailure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::UnmarshalFailure => "unmarshal-failure",
            Self::FetchFailure => "fetch-failure",
            Self::ChecksumFailure => "checksum-failure",
            Self::NoRemoteLoad => "no-remote-load",
            Self::MissRemoteFetchHint => "miss-remote-fetch-hint",
            Self::MarshalFailure => "marshal-failure",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WasmError {
    /// Whether a fresh attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_fetch_failure()
    }

    /// Whether the network fetch failed, including by timing out.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, Self::FetchFailure { .. } | Self::Timeout { .. })
    }

    /// Metrics category of this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::MalformedInput { .. } | Self::NoFetchSourceSpecified { .. } => {
                Outcome::UnmarshalFailure
            }
            Self::MissingFetchHint { .. } => Outcome::MissRemoteFetchHint,
            Self::ChecksumMismatch { .. } | Self::InvalidChecksum { .. } => {
                Outcome::ChecksumFailure
            }
            Self::SerializationFailure { .. } => Outcome::MarshalFailure,
            Self::MissingCredential { .. }
            | Self::FetchFailure { .. }
            | Self::Timeout { .. }
            | Self::InvalidModule { .. }
            | Self::NotCached { .. }
            | Self::Store { .. }
            | Self::Config { .. }
            | Self::Internal { .. } => Outcome::FetchFailure,
        }
    }

    pub(crate) fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for WasmError {
    fn from(err: reqwest::Error) -> Self {
        Self::FetchFailure {
            uri: err.url().map(|u| u.to_string()).unwrap_or_default(),
            message: err.to_string(),
        }
    }
}

/// Result type for module operations.
pub type WasmResult<T> = Result<T, WasmError>;

/// One failed resource in a conversion batch.
#[derive(Debug, Clone)]
pub struct ResourceFailure {
    /// Position of the resource in the batch.
    pub index: usize,

    /// Extension config name, when it could be decoded.
    pub resource: Option<String>,

    pub error: WasmError,
}

/// Aggregated failures of a conversion batch.
///
/// Never contains pass-through resources; only real failures are recorded.
#[derive(Debug, Clone, Default)]
pub struct ConversionErrors {
    failures: Vec<ResourceFailure>,
}

impl ConversionErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, failure: ResourceFailure) {
        self.failures.push(failure);
    }

    pub fn failures(&self) -> &[ResourceFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Err(self)` if anything failed.
    pub fn into_result(mut self) -> Result<(), Self> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            self.failures.sort_by_key(|f| f.index);
            Err(self)
        }
    }
}

impl fmt::Display for ConversionErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} extension config(s) failed to convert:",
            self.failures.len()
        )?;
        for failure in &self.failures {
            match &failure.resource {
                Some(name) => write!(f, "\n  * [{}] {}: {}", failure.index, name, failure.error)?,
                None => write!(f, "\n  * [{}] {}", failure.index, failure.error)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for ConversionErrors {}
