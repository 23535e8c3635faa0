#![forbid(unsafe_code)]

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parley_domain::UserId;
use parley_util::time::unix_secs_now;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SecretString;
use crate::server::store::{ChatStore, UserRecord};

const TOKEN_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	pub user_id: UserId,
	pub exp: u64,
}

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("invalid token format")]
	Format,

	#[error("invalid token encoding")]
	Encoding(#[from] base64::DecodeError),

	#[error("invalid token signature")]
	Signature,

	#[error("invalid token claims")]
	Claims(#[from] serde_json::Error),

	#[error("token expired")]
	Expired,

	#[error("invalid hmac key")]
	Key,
}

impl AuthError {
	pub fn kind(&self) -> &'static str {
		match self {
			AuthError::Format => "format",
			AuthError::Encoding(_) => "encoding",
			AuthError::Signature => "signature",
			AuthError::Claims(_) => "claims",
			AuthError::Expired => "expired",
			AuthError::Key => "key",
		}
	}
}

/// Verify a `v1.<payload>.<signature>` token and return its claims.
pub fn verify_token(token: &str, secret: &str) -> Result<AuthClaims, AuthError> {
	verify_token_at(token, secret, unix_secs_now())
}

pub fn verify_token_at(token: &str, secret: &str, now_secs: u64) -> Result<AuthClaims, AuthError> {
	let mut parts = token.trim().split('.');
	let (Some(version), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(AuthError::Format);
	};
	if version != TOKEN_VERSION {
		return Err(AuthError::Format);
	}

	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64)?;
	mac(secret)?
		.chain_update(payload_b64.as_bytes())
		.verify_slice(&provided_sig)
		.map_err(|_| AuthError::Signature)?;

	let payload = URL_SAFE_NO_PAD.decode(payload_b64)?;
	let claims: AuthClaims = serde_json::from_slice(&payload)?;
	if claims.exp <= now_secs {
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

/// Mint a token for `user` valid for `ttl_secs`.
pub fn mint_token(user: UserId, ttl_secs: u64, secret: &str) -> Result<String, AuthError> {
	let claims = AuthClaims {
		user_id: user,
		exp: unix_secs_now().saturating_add(ttl_secs),
	};
	let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
	let sig = mac(secret)?.chain_update(payload_b64.as_bytes()).finalize().into_bytes();

	Ok(format!("{TOKEN_VERSION}.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn mac(secret: &str) -> Result<Hmac<Sha256>, AuthError> {
	Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::Key)
}

/// Resolved identity of a connection. Decided once at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
	User(UserRecord),
	Anonymous,
}

impl Identity {
	pub fn into_user(self) -> Option<UserRecord> {
		match self {
			Identity::User(u) => Some(u),
			Identity::Anonymous => None,
		}
	}
}

/// Resolves handshake credentials to an [`Identity`].
#[derive(Clone)]
pub struct Authenticator {
	secret: SecretString,
	store: Arc<dyn ChatStore>,
}

impl Authenticator {
	pub fn new(secret: SecretString, store: Arc<dyn ChatStore>) -> Self {
		Self { secret, store }
	}

	/// Never fails: anything other than a valid token for an existing user is anonymous.
	pub async fn authenticate(&self, token: Option<&str>) -> Identity {
		let Some(token) = token.filter(|t| !t.trim().is_empty()) else {
			metrics::counter!("parley_server_auth_failures_total", "reason" => "missing").increment(1);
			return Identity::Anonymous;
		};

		let claims = match verify_token(token, self.secret.expose()) {
			Ok(c) => c,
			Err(e) => {
				debug!(error = %e, "auth: token rejected");
				metrics::counter!("parley_server_auth_failures_total", "reason" => e.kind()).increment(1);
				return Identity::Anonymous;
			}
		};

		match self.store.user(claims.user_id).await {
			Ok(Some(user)) => Identity::User(user),
			Ok(None) => {
				debug!(user_id = %claims.user_id, "auth: token for unknown user");
				metrics::counter!("parley_server_auth_failures_total", "reason" => "unknown_user").increment(1);
				Identity::Anonymous
			}
			Err(e) => {
				warn!(user_id = %claims.user_id, error = %format!("{e:#}"), "auth: user lookup failed");
				metrics::counter!("parley_server_auth_failures_total", "reason" => "lookup").increment(1);
				Identity::Anonymous
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::store::InMemoryStore;

	const SECRET: &str = "test-secret";

	#[test]
	fn minted_tokens_verify() {
		let token = mint_token(UserId(7), 60, SECRET).unwrap();
		let claims = verify_token(&token, SECRET).unwrap();
		assert_eq!(claims.user_id, UserId(7));
	}

	#[test]
	fn tampered_and_foreign_tokens_are_rejected() {
		let token = mint_token(UserId(7), 60, SECRET).unwrap();
		assert!(matches!(verify_token(&token, "other"), Err(AuthError::Signature)));

		let forged = URL_SAFE_NO_PAD.encode(br#"{"user_id":1,"exp":99999999999}"#);
		let mut parts: Vec<&str> = token.split('.').collect();
		parts[1] = &forged;
		assert!(matches!(verify_token(&parts.join("."), SECRET), Err(AuthError::Signature)));

		assert!(matches!(verify_token("v2.a.b", SECRET), Err(AuthError::Format)));
		assert!(matches!(verify_token("v1.a", SECRET), Err(AuthError::Format)));
		assert!(matches!(verify_token("v1.a.b.c", SECRET), Err(AuthError::Format)));
		assert!(matches!(verify_token("v1.a.!!", SECRET), Err(AuthError::Encoding(_))));
	}

	#[test]
	fn expired_tokens_are_rejected() {
		let token = mint_token(UserId(7), 10, SECRET).unwrap();
		let far_future = unix_secs_now() + 3600;
		assert!(matches!(verify_token_at(&token, SECRET, far_future), Err(AuthError::Expired)));
	}

	#[tokio::test]
	async fn authenticate_degrades_to_anonymous() {
		let store = Arc::new(InMemoryStore::default());
		let alice = store.create_user("alice", "", "").await.unwrap();
		let auth = Authenticator::new(SecretString::new(SECRET), store);

		let token = mint_token(alice.id, 60, SECRET).unwrap();
		assert_eq!(auth.authenticate(Some(&token)).await, Identity::User(alice));

		assert_eq!(auth.authenticate(None).await, Identity::Anonymous);
		assert_eq!(auth.authenticate(Some("")).await, Identity::Anonymous);
		assert_eq!(auth.authenticate(Some("garbage")).await, Identity::Anonymous);

		let ghost = mint_token(UserId(999), 60, SECRET).unwrap();
		assert_eq!(auth.authenticate(Some(&ghost)).await, Identity::Anonymous);
	}
}
