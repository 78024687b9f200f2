use std::mem::take;

/// Credentials attached to every signing-server request.
///
/// The two schemes are mutually exclusive, the server accepts either a
/// bearer token or an API key but never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// `X-API-Key: <key>`
    ApiKey(String),
}

impl Credential {
    pub(crate) fn header(&self) -> (&'static str, String) {
        match self {
            Self::Bearer(token) => ("Authorization", format!("Bearer {}", token)),
            Self::ApiKey(key) => ("X-API-Key", key.to_owned()),
        }
    }
}

/// Static configuration for the signing channel.
///
/// Built once at library initialization and injected into every
/// [`SigningChannel`](crate::SigningChannel); read-only thereafter.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    endpoint: String,
    credential: Option<Credential>,
}

impl ServiceConfig {
    /// Create a service configuration builder.
    #[inline]
    pub fn builder(endpoint: impl Into<String>) -> ServiceConfigBuilder {
        ServiceConfigBuilder(Self {
            endpoint: endpoint.into(),
            credential: None,
        })
    }

    /// Signing-server endpoint, e.g. `https://example.com/api/uploads`.
    #[inline]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Configured credential, if any.
    #[inline]
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder(ServiceConfig);

impl ServiceConfigBuilder {
    /// Authenticate with a bearer token.
    #[inline]
    pub fn bearer_token(&mut self, token: impl Into<String>) -> &mut Self {
        self.0.credential = Some(Credential::Bearer(token.into()));
        self
    }

    /// Authenticate with an API key.
    #[inline]
    pub fn api_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.0.credential = Some(Credential::ApiKey(key.into()));
        self
    }

    /// Build the service configuration.
    #[inline]
    pub fn build(&mut self) -> ServiceConfig {
        take(&mut self.0)
    }
}
