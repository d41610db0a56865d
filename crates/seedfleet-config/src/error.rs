use thiserror::Error;

/// Failures raised while assembling the process configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable was present but could not be parsed into its target type.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Environment variable that failed to parse.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
    /// The bootstrap secret still carries its shipped default.
    #[error(
        "bootstrap secret is still the shipped default; set SEEDFLEET_BOOTSTRAP_SECRET \
         or explicitly permit it with SEEDFLEET_ALLOW_DEFAULT_SECRET=true"
    )]
    DefaultSecret,
}
