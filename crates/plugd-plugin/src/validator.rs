//! Host allow-list request validator.

use url::Url;

use crate::error::{PluginError, PluginResult};
use crate::traits::RequestValidator;

/// Allows calls only to hosts on a configured list.
///
/// An empty list allows everything. Empty target URLs are always allowed since
/// not every plugin talks to an external system.
#[derive(Debug, Clone, Default)]
pub struct AllowListValidator {
    allowed_hosts: Vec<String>,
}

impl AllowListValidator {
    /// Creates a validator; host names are compared case-insensitively.
    pub fn new(allowed_hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.into().to_ascii_lowercase())
                .collect(),
        }
    }

    fn is_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.iter().any(|allowed| {
            host == allowed
                || allowed
                    .strip_prefix("*.")
                    .is_some_and(|suffix| host.ends_with(&format!(".{suffix}")))
        })
    }
}

impl RequestValidator for AllowListValidator {
    fn validate(
        &self,
        target_url: &str,
        _request: Option<&http::request::Parts>,
    ) -> PluginResult<()> {
        if self.allowed_hosts.is_empty() || target_url.is_empty() {
            return Ok(());
        }

        let url = Url::parse(target_url).map_err(|e| PluginError::AccessDenied {
            reason: format!("invalid target URL: {e}"),
        })?;

        let host = url
            .host_str()
            .ok_or_else(|| PluginError::AccessDenied {
                reason: "target URL has no host".to_string(),
            })?
            .to_ascii_lowercase();

        if !self.is_allowed(&host) {
            return Err(PluginError::AccessDenied {
                reason: format!("host {host} is not allowed"),
            });
        }

        Ok(())
    }
}
