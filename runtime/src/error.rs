use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("class '{0}' already exists")]
    ClassExists(String),

    #[error("'{class}' does not respond to '{selector}'")]
    NoSuchMethod { class: String, selector: String },

    #[error("'{class}' already defines '{selector}'")]
    MethodExists { class: String, selector: String },

    #[error("'{0}' is not an observable setter (expected v@:q)")]
    UnsupportedSetter(String),

    #[error("object was deallocated")]
    ObjectDeallocated,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
