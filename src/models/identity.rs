use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Maximum accepted length for any identity component.
pub const MAX_IDENTITY_FIELD_LEN: usize = 255;

const OAUTH_PROVIDER_PREFIX: &str = "oauth:";

/// Composite identity of a billing principal.
///
/// The provider string carries an `oauth:` prefix (`oauth:google`,
/// `oauth:github`, ...); `wa_id` and `tenant_id` are optional qualifiers
/// that are persisted but not part of the unique key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    pub oauth_provider: String,
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wa_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl AccountIdentity {
    pub fn new(oauth_provider: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            oauth_provider: oauth_provider.into(),
            external_id: external_id.into(),
            wa_id: None,
            tenant_id: None,
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let provider_name = self
            .oauth_provider
            .strip_prefix(OAUTH_PROVIDER_PREFIX)
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "oauth_provider must start with '{}': {}",
                    OAUTH_PROVIDER_PREFIX, self.oauth_provider
                ))
            })?;
        if provider_name.is_empty() {
            return Err(AppError::Validation(
                "oauth_provider must name a provider after the 'oauth:' prefix".to_string(),
            ));
        }
        if self.external_id.is_empty() {
            return Err(AppError::Validation(
                "external_id must not be empty".to_string(),
            ));
        }
        for (field, value) in [
            ("oauth_provider", Some(&self.oauth_provider)),
            ("external_id", Some(&self.external_id)),
            ("wa_id", self.wa_id.as_ref()),
            ("tenant_id", self.tenant_id.as_ref()),
        ] {
            if let Some(value) = value {
                if value.len() > MAX_IDENTITY_FIELD_LEN {
                    return Err(AppError::Validation(format!(
                        "{} exceeds {} bytes",
                        field, MAX_IDENTITY_FIELD_LEN
                    )));
                }
            }
        }
        Ok(())
    }
}
