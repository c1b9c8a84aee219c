//! Bearer token verification.
//!
//! Tokens are issued by the account service, not by this server. They are HS256 JWTs carrying the user id, and this
//! module only checks them. Roles are never taken from the token: admin routes look the user up and check the stored
//! role.
use std::future::{ready, Ready};

use actix_web::{dev::Payload, http::header::AUTHORIZATION, web, FromRequest, HttpRequest};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::*;
use membership_engine::{db_types::User, AccountApi, AccountManagement};
use serde::{Deserialize, Serialize};

use crate::{
    config::AuthConfig,
    errors::{AuthError, ServerError},
};

pub const TOKEN_HEADER: &str = "token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    #[serde(rename = "userId")]
    pub user_id: i64,
    /// Expiry, in seconds since the Unix epoch
    pub exp: i64,
}

pub struct JwtAuthority {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

impl JwtAuthority {
    pub fn new(config: &AuthConfig) -> Self {
        let secret = config.jwt_secret.reveal().as_bytes();
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            encoding_key: EncodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<JwtClaims, AuthError> {
        use jsonwebtoken::errors::ErrorKind;
        let data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation).map_err(|e| match e.kind() {
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                AuthError::PoorlyFormattedToken(e.to_string())
            },
            _ => AuthError::ValidationError(e.to_string()),
        })?;
        Ok(data.claims)
    }

    /// Signs a token for the given user. Tokens are normally issued elsewhere; this is for tooling and tests.
    pub fn issue(&self, user_id: i64, valid_for: chrono::Duration) -> Result<String, AuthError> {
        let exp = (chrono::Utc::now() + valid_for).timestamp();
        encode(&Header::new(Algorithm::HS256), &JwtClaims { user_id, exp }, &self.encoding_key)
            .map_err(|e| AuthError::ValidationError(e.to_string()))
    }
}

/// Pulls the raw token out of `Authorization: Bearer <jwt>`, or failing that, a bare `token` header. Browsers cannot
/// set headers on an `EventSource`, so a `token` query parameter is the last resort.
fn raw_token(req: &HttpRequest) -> Option<String> {
    let bearer = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    let header = || req.headers().get(TOKEN_HEADER).and_then(|v| v.to_str().ok()).map(str::trim);
    bearer.or_else(header).map(str::to_string).or_else(|| {
        web::Query::<TokenQuery>::from_query(req.query_string()).ok().map(|q| q.into_inner().token)
    })
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

impl FromRequest for JwtClaims {
    type Error = ServerError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let result = match req.app_data::<web::Data<JwtAuthority>>() {
            None => Err(ServerError::ConfigurationError("No JWT authority has been registered".into())),
            Some(authority) => match raw_token(req) {
                None => Err(AuthError::MissingToken.into()),
                Some(token) => authority.verify(&token).map_err(|e| {
                    debug!("💻️ Rejected token for {}: {e}", req.path());
                    ServerError::from(e)
                }),
            },
        };
        ready(result)
    }
}

/// Loads the caller's account and checks that its stored role is Admin.
pub async fn require_admin<B: AccountManagement>(
    api: &AccountApi<B>,
    claims: &JwtClaims,
) -> Result<User, ServerError> {
    let user = api.user(claims.user_id).await?.ok_or(AuthError::AccountNotFound)?;
    if !user.role.is_admin() {
        warn!("💻️ User #{} ({}) tried to access an admin route", user.id, user.role);
        return Err(AuthError::InsufficientPermissions("This route is for administrators only".into()).into());
    }
    Ok(user)
}
