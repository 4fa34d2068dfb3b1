//! Socket authentication. The OTP flow lives in an external auth service;
//! all this side does is verify the signature of the token it issued and
//! read the player identity out of its claims.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing auth token")]
    MissingToken,
    #[error("invalid auth token")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    /// the player's user id
    pub sub: String,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Who a socket belongs to.
#[derive(Clone, Debug)]
pub struct SocketIdentity {
    pub user_id: String,
}

/// Resolve the identity of a connecting socket. With a signing secret
/// configured the token is mandatory and its `sub` claim wins; without one
/// (local development) the `user_id` connect param is trusted, or an
/// anonymous id is generated.
pub fn authenticate(
    secret: Option<&str>,
    token: Option<&str>,
    user_id_param: Option<&str>,
) -> Result<SocketIdentity, AuthError> {
    match secret {
        Some(secret) => {
            let token = token.ok_or(AuthError::MissingToken)?;
            let key = DecodingKey::from_secret(secret.as_bytes());
            let data = decode::<Claims>(token, &key, &Validation::new(Algorithm::HS256))?;
            Ok(SocketIdentity { user_id: data.claims.sub })
        }
        None => {
            let user_id = user_id_param
                .map(str::to_owned)
                .filter(|id| !id.is_empty())
                .unwrap_or_else(generate_user_id);
            Ok(SocketIdentity { user_id })
        }
    }
}

fn generate_user_id() -> String { format!("anon-{:08x}", rand::random::<u32>()) }

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_for(user_id: &str, secret: &str) -> String {
        let claims = Claims {
            sub: user_id.to_owned(),
            exp: crate::world::now_unix() + 3600,
            phone: Some("+15550100".to_owned()),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn claims_identify_the_player() {
        let token = token_for("u-42", "sekrit");
        let identity = authenticate(Some("sekrit"), Some(&token), None).unwrap();
        assert_eq!(identity.user_id, "u-42");
    }

    #[test]
    fn claims_override_the_connect_param() {
        let token = token_for("u-42", "sekrit");
        let identity = authenticate(Some("sekrit"), Some(&token), Some("spoofed")).unwrap();
        assert_eq!(identity.user_id, "u-42");
    }

    #[test]
    fn bad_signature_is_rejected() {
        let token = token_for("u-42", "other-secret");
        assert!(matches!(
            authenticate(Some("sekrit"), Some(&token), None),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn token_is_mandatory_when_secret_is_set() {
        assert!(matches!(
            authenticate(Some("sekrit"), None, Some("u-1")),
            Err(AuthError::MissingToken)
        ));
    }

    #[test]
    fn dev_mode_generates_anonymous_ids() {
        let identity = authenticate(None, None, None).unwrap();
        assert!(identity.user_id.starts_with("anon-"));

        let identity = authenticate(None, None, Some("u-7")).unwrap();
        assert_eq!(identity.user_id, "u-7");
    }
}
