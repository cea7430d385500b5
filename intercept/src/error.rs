use swizzle_runtime::RuntimeError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("the target does not respond to the selector")]
    NoSuchSelector,

    #[error("selector is managed by the runtime and cannot be intercepted")]
    BlacklistedSelector,

    #[error("closure signature does not fit the method: {0}")]
    SignatureMismatch(String),

    #[error("closure is already registered for this target and mode")]
    DuplicateInterceptor,

    #[error("unsupported type encoding: {0}")]
    UnsupportedType(String),

    #[error("failed to prepare call interface: {0}")]
    CallInterfaceError(String),

    #[error("failed to create trampoline: {0}")]
    TrampolineError(String),

    #[error("deallocation of this object cannot be intercepted")]
    UnsupportedDeallocInterception,

    #[error("no type information available")]
    NoSignature,

    #[error("class objects must be intercepted with Target::ClassMethod")]
    ClassObjectAsInstance,

    #[error("association key {0} holds a value the interceptor did not attach")]
    ForeignAssociation(&'static str),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid subclass prefix '{0}': expected a non-empty identifier")]
    InvalidPrefix(String),
}

pub type Result<T> = std::result::Result<T, HookError>;
