use axum::http;
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde_json::Value;

use crate::auth::auth::{user_prpls, CallerIdentity};

// Get the auth token from a request
pub fn get_auth_token<B>(req: &http::Request<B>) -> Result<String, String> {
    // 1. Try to get token from Authorization header
    if let Some(auth_header) = req.headers().get(http::header::AUTHORIZATION) {
        let auth_str = auth_header.to_str().map_err(|_| "Invalid Authorization header".to_string())?;
        Ok(auth_str
            .strip_prefix("Bearer ")
            .unwrap_or(auth_str)
            .to_string())
    }
    // 2. Try to get token from cookies
    else {
        let cookie_header = req.headers().get(http::header::COOKIE)
            .ok_or_else(|| "Missing Authorization header or Cookie".to_string())?
            .to_str()
            .map_err(|_| "Invalid Cookie header".to_string())?;

        for cookie in cookie::Cookie::split_parse(cookie_header).flatten() {
            if cookie.name() == "auth_token" {
                return Ok(cookie.value().to_string());
            }
        }
        Err("auth_token cookie not found".to_string())
    }
}

// Validate a JWT token and return the token data
pub fn validate_jwt(token: &str, secret: &str) -> Result<TokenData<Value>, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<Value>(token, &decoding_key, &validation)
}

/// Turn validated claims into a caller identity.
///
/// User tokens carry the user id in `sub` and optional `roles`; service
/// tokens carry the service name in `sub`.
pub fn identity_from_claims(claims: &Value) -> Result<CallerIdentity, String> {
    let sub = claims
        .get("sub")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "JWT token does not contain 'sub' claim".to_string())?;

    // Tokens without a type are user tokens
    match claims.get("type").and_then(|v| v.as_str()).unwrap_or("user") {
        "user" => {
            let roles = match claims.get("roles").and_then(|v| v.as_array()) {
                Some(roles_array) => roles_array.iter().filter_map(|r| r.as_str().map(|s| s.to_string())).collect::<Vec<String>>(),
                None => Vec::new(),
            };
            Ok(CallerIdentity {
                uid: sub.to_string(),
                prpls: user_prpls(sub, &roles),
            })
        }
        "service" => Ok(CallerIdentity {
            uid: sub.to_string(),
            prpls: vec![format!("s/{}", sub)],
        }),
        other => Err(format!("Invalid token type: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn token(claims: Value) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 600
    }

    #[test]
    fn bearer_header_wins_over_cookie() {
        let req = http::Request::builder()
            .header(http::header::AUTHORIZATION, "Bearer abc")
            .header(http::header::COOKIE, "auth_token=def")
            .body(())
            .unwrap();
        assert_eq!(get_auth_token(&req).unwrap(), "abc");
    }

    #[test]
    fn cookie_is_used_without_header() {
        let req = http::Request::builder()
            .header(http::header::COOKIE, "theme=dark; auth_token=def")
            .body(())
            .unwrap();
        assert_eq!(get_auth_token(&req).unwrap(), "def");

        let bare = http::Request::builder().body(()).unwrap();
        assert!(get_auth_token(&bare).is_err());
    }

    #[test]
    fn user_token_resolves_identity() {
        let jwt = token(json!({"sub": "user-1", "type": "user", "roles": ["Editor"], "exp": exp()}));
        let data = validate_jwt(&jwt, SECRET).unwrap();
        let identity = identity_from_claims(&data.claims).unwrap();
        assert_eq!(identity.uid, "user-1");
        assert_eq!(identity.prpls, vec!["u/user-1", "r/Editor"]);
    }

    #[test]
    fn service_token_resolves_service_principal() {
        let jwt = token(json!({"sub": "colabri-app", "type": "service", "exp": exp()}));
        let data = validate_jwt(&jwt, SECRET).unwrap();
        let identity = identity_from_claims(&data.claims).unwrap();
        assert!(identity.is_service());
    }

    #[test]
    fn bad_tokens_are_rejected() {
        let jwt = token(json!({"sub": "user-1", "exp": exp()}));
        assert!(validate_jwt(&jwt, "other-secret").is_err());

        let expired = token(json!({"sub": "user-1", "exp": chrono::Utc::now().timestamp() - 3600}));
        assert!(validate_jwt(&expired, SECRET).is_err());

        assert!(identity_from_claims(&json!({"type": "user"})).is_err());
        assert!(identity_from_claims(&json!({"sub": "x", "type": "robot"})).is_err());
    }
}
