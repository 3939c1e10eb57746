//! Authentication of API requests and the permissions of the user.

use crate::configuration::ExternalApiConfig;
use crate::error::{ApiError, AuthError, StorageError};
use crate::storage::{Store, Transaction};
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Authorization header value following RFC 1945.
#[allow(clippy::unwrap_used)]
static BEARER_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^bearer (.*)$").unwrap());

/// Extracts the token of an authorization header.
///
/// A value without the `Bearer` scheme is accepted as token with a warning.
///
/// # Errors
///
/// Returns [`AuthError::MissingToken`] without a header.
pub fn token_from_header(value: Option<&str>) -> Result<String, AuthError> {
    let value = value.filter(|v| !v.is_empty()).ok_or(AuthError::MissingToken)?;
    match BEARER_REGEX.captures(value).and_then(|c| c.get(1)) {
        Some(token) => Ok(token.as_str().to_owned()),
        None => {
            let prefix: String = value.chars().take(16).collect();
            warn!("Deprecated Authorization header: {prefix}");
            Ok(value.to_owned())
        }
    }
}

/// Token of the request's authorization header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for BearerToken {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        Ok(BearerToken(token_from_header(header)?))
    }
}

impl aide::OperationInput for BearerToken {}

/// Claims of the API tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Username of the user.
    pub username: String,
    /// Audience.
    pub aud: String,
    /// Expiry as unix timestamp.
    pub exp: i64,
}

/// Validates HS256 signed JWTs.
#[derive(Clone)]
pub struct JwtValidator {
    /// Key derived from the secret.
    key: DecodingKey,
    /// Algorithm, audience and expiry checks.
    validation: Validation,
}

impl fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtValidator")
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}

impl JwtValidator {
    /// Creates a validator for tokens signed with `secret` for `audience`.
    #[must_use]
    pub fn new(secret: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience]);
        JwtValidator {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Returns the claims of a valid token.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature, audience or expiry is invalid or the username is empty.
    pub fn claims(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)?.claims;
        if claims.username.is_empty() {
            return Err(AuthError::UnknownUser);
        }
        Ok(claims)
    }
}

/// The authenticated user and its permissions in one organization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// User ID.
    pub user_id: i64,
    /// Username.
    pub username: String,
    /// Global admin.
    pub is_global_admin: bool,
    /// Member of the organization.
    pub is_org_user: bool,
    /// Admin of the organization.
    pub is_org_admin: bool,
    /// Device admin of the organization.
    pub is_device_admin: bool,
    /// Gateway admin of the organization.
    pub is_gateway_admin: bool,
}

/// Shorthand for a permission check.
fn require(allowed: bool) -> Result<(), AuthError> {
    if allowed {
        Ok(())
    } else {
        Err(AuthError::PermissionDenied)
    }
}

impl Credentials {
    /// Loads the user and, for `org_id > 0`, its membership in the organization.
    ///
    /// # Errors
    ///
    /// Returns an error if the user does not exist or is inactive.
    pub async fn load(
        tx: &mut dyn Transaction,
        username: &str,
        org_id: i64,
    ) -> Result<Self, AuthError> {
        let user = match tx.get_user_by_username(username).await {
            Ok(user) => user,
            Err(StorageError::DoesNotExist) => return Err(AuthError::UnknownUser),
            Err(err) => return Err(err.into()),
        };
        if !user.is_active {
            return Err(AuthError::InactiveUser);
        }

        let mut credentials = Credentials {
            user_id: user.id,
            username: user.username,
            is_global_admin: user.is_admin,
            ..Credentials::default()
        };
        if org_id > 0 {
            match tx.get_organization_user(org_id, user.id).await {
                Ok(org_user) => {
                    credentials.is_org_user = true;
                    credentials.is_org_admin = org_user.is_admin;
                    credentials.is_device_admin = org_user.is_device_admin;
                    credentials.is_gateway_admin = org_user.is_gateway_admin;
                }
                Err(StorageError::DoesNotExist) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if credentials.is_global_admin {
            credentials.is_org_user = true;
            credentials.is_org_admin = true;
            credentials.is_device_admin = true;
            credentials.is_gateway_admin = true;
        }
        Ok(credentials)
    }

    /// Requires global admin rights.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::PermissionDenied`] unless the user is a global admin.
    pub fn is_global_admin(&self) -> Result<(), AuthError> {
        require(self.is_global_admin)
    }

    /// Requires membership in the organization.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::PermissionDenied`] unless the user belongs to the organization.
    pub fn is_org_user(&self) -> Result<(), AuthError> {
        require(self.is_org_user)
    }

    /// Requires organization admin rights.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::PermissionDenied`] unless the user administers the organization.
    pub fn is_org_admin(&self) -> Result<(), AuthError> {
        require(self.is_org_admin)
    }

    /// Requires device admin rights.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::PermissionDenied`] unless the user administers the devices of the
    /// organization.
    pub fn is_device_admin(&self) -> Result<(), AuthError> {
        require(self.is_device_admin)
    }

    /// Requires gateway admin rights.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::PermissionDenied`] unless the user administers the gateways of the
    /// organization.
    pub fn is_gateway_admin(&self) -> Result<(), AuthError> {
        require(self.is_gateway_admin)
    }
}

/// Resolves tokens into [`Credentials`].
#[derive(Debug, Clone)]
pub struct Authenticator {
    /// Token validation.
    validator: JwtValidator,
    /// Store of the users.
    store: Arc<dyn Store>,
}

impl Authenticator {
    /// Creates a new [`Authenticator`].
    #[must_use]
    pub fn new(config: &ExternalApiConfig, store: Arc<dyn Store>) -> Self {
        Authenticator {
            validator: JwtValidator::new(&config.jwt_secret, &config.jwt_audience),
            store,
        }
    }

    /// Validates the token without touching the store.
    ///
    /// Handlers which look up the organization of an object validate the token first and load
    /// the [`Credentials`] in their own transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is invalid.
    pub fn claims(&self, token: &BearerToken) -> Result<Claims, AuthError> {
        self.validator.claims(&token.0)
    }

    /// Returns the credentials of the token's user for the organization, `0` for none.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is invalid or the user unknown or inactive.
    pub async fn credentials(&self, token: &BearerToken, org_id: i64) -> Result<Credentials, AuthError> {
        let claims = self.claims(token)?;
        let mut tx = self.store.begin().await?;
        let credentials = Credentials::load(tx.as_mut(), &claims.username, org_id).await;
        tx.rollback().await?;
        credentials
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::memory::fixtures::{organization_user, user};
    use crate::storage::memory::MemoryStore;
    use jsonwebtoken::{EncodingKey, Header};

    pub(crate) const SECRET: &str = "verysecret";

    /// A token of `username` valid for an hour.
    pub(crate) fn token(username: &str, audience: &str) -> BearerToken {
        let claims = Claims {
            username: username.to_owned(),
            aud: audience.to_owned(),
            exp: chrono::Utc::now().timestamp() + 3600,
        };
        BearerToken(
            jsonwebtoken::encode(
                &Header::new(Algorithm::HS256),
                &claims,
                &EncodingKey::from_secret(SECRET.as_bytes()),
            )
            .unwrap(),
        )
    }

    /// Store with an org user (1), an inactive user (2), a global admin (3), a device admin (4)
    /// and a gateway admin (5) of organization 1.
    pub(crate) async fn user_store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .with_data(|d| {
                d.users.push(user(1, "member"));
                let mut inactive = user(2, "inactive");
                inactive.is_active = false;
                d.users.push(inactive);
                let mut admin = user(3, "admin");
                admin.is_admin = true;
                d.users.push(admin);
                d.users.push(user(4, "device-admin"));
                d.users.push(user(5, "gateway-admin"));

                d.organization_users.push(organization_user(1, 1));
                let mut device_admin = organization_user(1, 4);
                device_admin.is_device_admin = true;
                d.organization_users.push(device_admin);
                let mut gateway_admin = organization_user(1, 5);
                gateway_admin.is_gateway_admin = true;
                d.organization_users.push(gateway_admin);
            })
            .await;
        store
    }

    fn authenticator(store: MemoryStore) -> Authenticator {
        Authenticator::new(
            &ExternalApiConfig {
                jwt_secret: SECRET.to_owned(),
                jwt_audience: "lora-app-server".to_owned(),
            },
            Arc::new(store),
        )
    }

    #[test]
    fn header_token() {
        assert_eq!(token_from_header(Some("Bearer abc")).unwrap(), "abc");
        assert_eq!(token_from_header(Some("bEaReR abc")).unwrap(), "abc");
        assert_eq!(token_from_header(Some("abc")).unwrap(), "abc");
        assert!(matches!(
            token_from_header(None),
            Err(AuthError::MissingToken)
        ));
    }

    #[tokio::test]
    async fn token_validation() {
        let auth = authenticator(user_store().await);
        assert!(matches!(
            auth.credentials(&token("member", "other-audience"), 0).await,
            Err(AuthError::Jwt(_))
        ));
        assert!(matches!(
            auth.credentials(&BearerToken("garbage".to_owned()), 0).await,
            Err(AuthError::Jwt(_))
        ));
        assert!(matches!(
            auth.credentials(&token("inactive", "lora-app-server"), 0).await,
            Err(AuthError::InactiveUser)
        ));
        assert!(matches!(
            auth.credentials(&token("ghost", "lora-app-server"), 0).await,
            Err(AuthError::UnknownUser)
        ));
    }

    #[tokio::test]
    async fn organization_permissions() {
        let auth = authenticator(user_store().await);

        let member = auth
            .credentials(&token("member", "lora-app-server"), 1)
            .await
            .unwrap();
        assert_eq!(member.user_id, 1);
        assert!(member.is_org_user().is_ok());
        assert!(matches!(
            member.is_org_admin(),
            Err(AuthError::PermissionDenied)
        ));
        assert!(member.is_global_admin().is_err());

        let other_org = auth
            .credentials(&token("member", "lora-app-server"), 2)
            .await
            .unwrap();
        assert!(matches!(
            other_org.is_org_user(),
            Err(AuthError::PermissionDenied)
        ));

        let device_admin = auth
            .credentials(&token("device-admin", "lora-app-server"), 1)
            .await
            .unwrap();
        assert!(device_admin.is_device_admin().is_ok());
        assert!(device_admin.is_gateway_admin().is_err());

        let gateway_admin = auth
            .credentials(&token("gateway-admin", "lora-app-server"), 1)
            .await
            .unwrap();
        assert!(gateway_admin.is_gateway_admin().is_ok());
        assert!(gateway_admin.is_device_admin().is_err());
    }

    #[tokio::test]
    async fn global_admin_has_every_org_flag() {
        let auth = authenticator(user_store().await);
        let admin = auth
            .credentials(&token("admin", "lora-app-server"), 42)
            .await
            .unwrap();
        assert!(admin.is_global_admin().is_ok());
        assert!(admin.is_org_user().is_ok());
        assert!(admin.is_org_admin().is_ok());
        assert!(admin.is_device_admin().is_ok());
        assert!(admin.is_gateway_admin().is_ok());
    }
}
