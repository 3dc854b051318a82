use thiserror::Error;

/// SDK-visible error kinds. Transport and origin errors are mapped onto
/// this set at the gateway boundary; nothing else leaks to SDK callers.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Context canceled")]
    ContextCanceled,

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Bad role")]
    BadRole,

    #[error("Disabled API key")]
    DisabledApiKey,

    #[error("Tag is required")]
    TagRequired,

    #[error("User is required")]
    UserRequired,

    #[error("User id is required")]
    UserIdRequired,

    #[error("Feature id is required")]
    FeatureIdRequired,

    #[error("Feature not found")]
    FeatureNotFound,

    #[error("Missing events")]
    MissingEvents,

    #[error("Missing event id")]
    MissingEventId,

    #[error("Internal")]
    Internal,
}
