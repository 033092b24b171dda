//! Dispatcher settings.

use serde::{Deserialize, Serialize};

/// Tunables for a [`Dispatcher`](crate::Dispatcher).
///
/// Deserializable so it can live in the application's config file; missing
/// fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Message sent for unclassified failures in place of the real error.
    pub internal_error_message: String,

    /// Log classified 4xx failures at `debug` level.
    pub log_client_errors: bool,

    /// Turn panics inside services and middleware into 500 responses.
    pub catch_panics: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            internal_error_message: "Internal server error".to_string(),
            log_client_errors: false,
            catch_panics: true,
        }
    }
}
