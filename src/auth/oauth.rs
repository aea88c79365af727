// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! OAuth 2.0 authorization-code sign-in.
//!
//! The provider only turns an authorization code into a [`FederatedIdentity`];
//! the external id and e-mail always come from the provider's userinfo
//! endpoint, never from the client. State and PKCE verifier bookkeeping lives
//! in [`AuthGate`](super::AuthGate).

use async_trait::async_trait;
use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken,
    EndpointNotSet, EndpointSet, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope,
    TokenResponse, TokenUrl,
};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use super::{AuthError, FederatedIdentity};
use crate::config::OAuthClientSettings;

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Where to send the browser, plus what the callback needs to finish.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: Url,
    pub state: String,
    pub pkce_verifier: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn authorization_request(&self) -> AuthorizationRequest;

    /// Redeem `code` and fetch the signed-in identity.
    async fn exchange(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<FederatedIdentity, AuthError>;
}

/// Userinfo claims used for the merge.
#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
}

/// Google (or any OIDC-style provider with a userinfo endpoint).
pub struct OAuthProvider {
    client: ConfiguredClient,
    http: reqwest::Client,
    userinfo_url: Url,
}

impl OAuthProvider {
    pub fn new(settings: &OAuthClientSettings) -> Result<Self, AuthError> {
        let client = BasicClient::new(ClientId::new(settings.client_id.clone()))
            .set_client_secret(ClientSecret::new(settings.client_secret.clone()))
            .set_auth_uri(AuthUrl::from_url(settings.auth_url.clone()))
            .set_token_uri(TokenUrl::from_url(settings.token_url.clone()))
            .set_redirect_uri(RedirectUrl::from_url(settings.redirect_url.clone()));

        // The token exchange must not follow redirects
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AuthError::Internal(format!("OAuth HTTP client: {e}")))?;

        Ok(Self {
            client,
            http,
            userinfo_url: settings.userinfo_url.clone(),
        })
    }

    async fn fetch_user_info(&self, access_token: &str) -> Result<UserInfo, reqwest::Error> {
        self.http
            .get(self.userinfo_url.clone())
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

#[async_trait]
impl IdentityProvider for OAuthProvider {
    fn authorization_request(&self) -> AuthorizationRequest {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let (url, state) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new("openid".to_string()))
            .add_scope(Scope::new("email".to_string()))
            .add_scope(Scope::new("profile".to_string()))
            .set_pkce_challenge(pkce_challenge)
            .url();

        AuthorizationRequest {
            url,
            state: state.secret().clone(),
            pkce_verifier: pkce_verifier.secret().clone(),
        }
    }

    async fn exchange(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<FederatedIdentity, AuthError> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| {
                warn!(error = %e, "OAuth code exchange failed");
                AuthError::FederatedLoginFailed
            })?;

        let info = self
            .fetch_user_info(token.access_token().secret())
            .await
            .map_err(|e| {
                warn!(error = %e, "OAuth userinfo request failed");
                AuthError::FederatedLoginFailed
            })?;

        identity_from(info)
    }
}

/// Only a verified e-mail may be merged into an existing account.
fn identity_from(info: UserInfo) -> Result<FederatedIdentity, AuthError> {
    match info.email {
        Some(email) if info.email_verified && !info.sub.is_empty() => Ok(FederatedIdentity {
            external_id: info.sub,
            email,
        }),
        _ => {
            warn!(subject = %info.sub, "Provider returned no verified e-mail");
            Err(AuthError::FederatedLoginFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> OAuthClientSettings {
        OAuthClientSettings {
            client_id: "client-1".to_string(),
            client_secret: "shh".to_string(),
            auth_url: Url::parse("https://accounts.example.com/auth").unwrap(),
            token_url: Url::parse("https://accounts.example.com/token").unwrap(),
            userinfo_url: Url::parse("https://accounts.example.com/userinfo").unwrap(),
            redirect_url: Url::parse("https://api.example.com/v1/auth/google/callback").unwrap(),
        }
    }

    #[test]
    fn authorization_url_carries_state_and_pkce() {
        let provider = OAuthProvider::new(&settings()).unwrap();
        let request = provider.authorization_request();

        let params: Vec<(String, String)> = request.url.query_pairs().into_owned().collect();
        let param = |name: &str| {
            params
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        };
        assert_eq!(param("client_id").as_deref(), Some("client-1"));
        assert_eq!(param("state").as_deref(), Some(request.state.as_str()));
        assert_eq!(param("code_challenge_method").as_deref(), Some("S256"));
        assert!(param("scope").is_some_and(|scope| scope.contains("email")));
        assert!(!request.pkce_verifier.is_empty());

        // Every request gets its own state
        assert_ne!(provider.authorization_request().state, request.state);
    }

    #[test]
    fn unverified_or_missing_email_is_rejected() {
        let verified = identity_from(UserInfo {
            sub: "g-1".to_string(),
            email: Some("a@x.com".to_string()),
            email_verified: true,
        })
        .unwrap();
        assert_eq!(verified.external_id, "g-1");

        for (email, email_verified) in [(Some("a@x.com"), false), (None, true)] {
            let err = identity_from(UserInfo {
                sub: "g-1".to_string(),
                email: email.map(str::to_string),
                email_verified,
            })
            .unwrap_err();
            assert_eq!(err, AuthError::FederatedLoginFailed);
        }
    }
}
