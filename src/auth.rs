use crate::config::{DemoConfig, SessionConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::users::UserStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const API_KEY_PREFIX: &str = "lo-";
pub const DEMO_UID: &str = "demo";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: String,
    pub email: String,
}

/// Resolves a raw `Authorization` header value to an [`Identity`].
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: Option<&str>) -> GatewayResult<Identity>;
}

pub struct ApiKeyAuthenticator {
    users: UserStore,
}

impl ApiKeyAuthenticator {
    pub fn new(users: UserStore) -> Self {
        Self { users }
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(&self, credential: Option<&str>) -> GatewayResult<Identity> {
        let credential = credential
            .filter(|c| !c.is_empty())
            .ok_or(GatewayError::AuthMissing)?;
        let api_key = credential.strip_prefix("Bearer ").ok_or_else(|| {
            GatewayError::invalid_credential("Authorization header needs to start with 'Bearer '")
        })?;
        if !api_key.starts_with(API_KEY_PREFIX) {
            return Err(GatewayError::invalid_credential(
                "API Key needs to start with 'lo-'. Please make sure you are using a gateway API Key.",
            ));
        }
        let user = self
            .users
            .get_user_by_api_key(api_key)
            .await
            .map_err(GatewayError::internal)?
            .ok_or_else(|| GatewayError::invalid_credential("API Key not found."))?;
        Ok(Identity {
            uid: user.uid,
            email: user.email,
        })
    }
}

/// Third-party session verification: token in, identity out.
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, String>;
}

pub struct SessionAuthenticator {
    verifier: Arc<dyn SessionVerifier>,
}

impl SessionAuthenticator {
    pub fn new(verifier: Arc<dyn SessionVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl Authenticator for SessionAuthenticator {
    async fn authenticate(&self, credential: Option<&str>) -> GatewayResult<Identity> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(GatewayError::AuthMissing)?;
        let token = credential.strip_prefix("Bearer ").unwrap_or(credential);
        self.verifier.verify(token).await.map_err(|err| {
            tracing::debug!("session verification failed: {err}");
            GatewayError::invalid_credential("session token could not be verified")
        })
    }
}

#[derive(Debug, Deserialize)]
struct SessionClaims {
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// Verifies HS256-signed session tokens locally.
pub struct JwtSessionVerifier {
    key: jsonwebtoken::DecodingKey,
    validation: jsonwebtoken::Validation,
}

impl JwtSessionVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_aud = false;
        Self {
            key: jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl SessionVerifier for JwtSessionVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, String> {
        let data = jsonwebtoken::decode::<SessionClaims>(token, &self.key, &self.validation)
            .map_err(|err| err.to_string())?;
        let claims = data.claims;
        let uid = claims
            .uid
            .or(claims.sub)
            .ok_or_else(|| "token has no subject".to_string())?;
        let email = claims
            .email
            .ok_or_else(|| "token has no email".to_string())?;
        Ok(Identity { uid, email })
    }
}

#[derive(Debug, Deserialize)]
struct RemoteSessionResponse {
    user: RemoteSessionUser,
}

#[derive(Debug, Deserialize)]
struct RemoteSessionUser {
    user_id: String,
    #[serde(default)]
    emails: Vec<RemoteSessionEmail>,
}

#[derive(Debug, Deserialize)]
struct RemoteSessionEmail {
    email: String,
}

/// Calls an external `sessions/authenticate` endpoint with project credentials.
pub struct RemoteSessionVerifier {
    http: reqwest::Client,
    url: String,
    project_id: String,
    secret: String,
}

impl RemoteSessionVerifier {
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        project_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            project_id: project_id.into(),
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl SessionVerifier for RemoteSessionVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, String> {
        let resp = self
            .http
            .post(&self.url)
            .basic_auth(&self.project_id, Some(&self.secret))
            .json(&serde_json::json!({ "session_token": token }))
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("session provider returned {status}"));
        }
        let body: RemoteSessionResponse = resp.json().await.map_err(|err| err.to_string())?;
        let email = body
            .user
            .emails
            .into_iter()
            .next()
            .map(|e| e.email)
            .ok_or_else(|| "session user has no email".to_string())?;
        Ok(Identity {
            uid: body.user.user_id,
            email,
        })
    }
}

/// Builds the session verifier configured for session mode. A local JWT
/// secret takes precedence over a remote provider.
pub fn session_verifier_from_config(
    config: &SessionConfig,
    http: reqwest::Client,
) -> Result<Arc<dyn SessionVerifier>, String> {
    if let Some(secret) = config.jwt_secret.as_deref() {
        return Ok(Arc::new(JwtSessionVerifier::new(secret)));
    }
    match (
        config.remote_url.as_deref(),
        config.project_id.as_deref(),
        config.secret.as_deref(),
    ) {
        (Some(url), Some(project_id), Some(secret)) => Ok(Arc::new(RemoteSessionVerifier::new(
            http, url, project_id, secret,
        ))),
        _ => Err("session mode needs GATEWAY_SESSION_JWT_SECRET or GATEWAY_SESSION_URL, \
                  GATEWAY_SESSION_PROJECT_ID and GATEWAY_SESSION_SECRET"
            .to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub identity: Identity,
    /// Set for the shared demo credential, which is subject to rate limiting.
    pub rate_limited: bool,
}

/// Entry point of the pipeline: the reserved demo credential first, then the
/// configured authenticator.
#[derive(Clone)]
pub struct AuthGate {
    authenticator: Arc<dyn Authenticator>,
    demo_credential: String,
    demo_identity: Identity,
}

impl AuthGate {
    pub fn new(authenticator: Arc<dyn Authenticator>, demo: &DemoConfig) -> Self {
        Self {
            authenticator,
            demo_credential: demo.credential.clone(),
            demo_identity: Identity {
                uid: DEMO_UID.to_string(),
                email: demo.email.clone(),
            },
        }
    }

    pub fn is_demo(&self, credential: Option<&str>) -> bool {
        credential.is_some_and(|c| c == self.demo_credential)
    }

    pub async fn authenticate(&self, credential: Option<&str>) -> GatewayResult<Authenticated> {
        if self.is_demo(credential) {
            return Ok(Authenticated {
                identity: self.demo_identity.clone(),
                rate_limited: true,
            });
        }
        let identity = self.authenticator.authenticate(credential).await?;
        Ok(Authenticated {
            identity,
            rate_limited: false,
        })
    }
}
