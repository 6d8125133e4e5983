//! GitHub App credential flow: mint the app JWT, trade it for an
//! installation access token, and inspect token expiry claims.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::error::{error_from_response, ActionsError};
use crate::http;
use crate::types::AccessToken;

#[derive(Debug, Serialize)]
struct AppJwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Sign a short-lived RS256 JWT identifying the GitHub App.
///
/// Issued-at is backdated 60 s to absorb clock skew; expiry is 9 minutes
/// after that (the backend caps app JWTs at 10 minutes).
pub fn create_app_jwt(app_id: i64, private_key_pem: &str) -> Result<String, ActionsError> {
    let issued_at = Utc::now() - ChronoDuration::seconds(60);
    let expires_at = issued_at + ChronoDuration::minutes(9);

    let claims = AppJwtClaims {
        iat: issued_at.timestamp(),
        exp: expires_at.timestamp(),
        iss: app_id.to_string(),
    };

    let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .map_err(|e| ActionsError::Token(format!("failed to parse RSA private key: {e}")))?;

    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| ActionsError::Token(format!("failed to sign app JWT: {e}")))
}

/// Exchange the app JWT for an installation access token.
pub async fn fetch_access_token(
    client: &reqwest::Client,
    api_url: &str,
    app_id: i64,
    installation_id: i64,
    private_key_pem: &str,
) -> Result<AccessToken, ActionsError> {
    let jwt = create_app_jwt(app_id, private_key_pem)?;

    let url = format!(
        "{}/app/installations/{installation_id}/access_tokens",
        api_url.trim_end_matches('/')
    );

    let mut headers = http::bearer_headers(&jwt)?;
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
    );

    let request = client
        .post(&url)
        .headers(headers)
        .build()
        .map_err(ActionsError::from)?;

    let response = http::send_with_retry(client, request).await?;
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    Ok(response.json().await?)
}

#[derive(Debug, Deserialize)]
struct ExpiryClaim {
    exp: i64,
}

/// Read the `exp` claim out of a JWT without verifying its signature.
///
/// The admin token is opaque to us except for its expiry, which drives the
/// 60-second refresh window.
pub fn token_expiration(jwt: &str) -> Result<DateTime<Utc>, ActionsError> {
    let payload = jwt
        .split('.')
        .nth(1)
        .ok_or_else(|| ActionsError::Token("token is not a JWT".into()))?;

    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| ActionsError::Token(format!("failed to decode JWT payload: {e}")))?;

    let claim: ExpiryClaim = serde_json::from_slice(&decoded)
        .map_err(|_| ActionsError::Token("missing expiration claim in token".into()))?;

    Utc.timestamp_opt(claim.exp, 0)
        .single()
        .ok_or_else(|| ActionsError::Token("expiration claim is out of range".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jwt(payload: &str) -> String {
        format!(
            "eyJhbGciOiJub25lIn0.{}.sig",
            URL_SAFE_NO_PAD.encode(payload.as_bytes())
        )
    }

    #[test]
    fn test_token_expiration_reads_exp() {
        let jwt = fake_jwt("{\"exp\":1900000000,\"sub\":\"x\"}");
        let expires = token_expiration(&jwt).unwrap();
        assert_eq!(expires.timestamp(), 1_900_000_000);
    }

    #[test]
    fn test_token_expiration_rejects_non_jwt() {
        assert!(token_expiration("opaque-token").is_err());
    }

    #[test]
    fn test_token_expiration_requires_exp_claim() {
        let jwt = fake_jwt("{\"sub\":\"x\"}");
        assert!(token_expiration(&jwt).is_err());
    }

    #[test]
    fn test_app_jwt_rejects_garbage_key() {
        assert!(create_app_jwt(1234, "not a pem").is_err());
    }
}
