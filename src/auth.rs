//! Bearer tokens for upstream calls.
//!
//! The mock issuer signs a Supabase-shaped HS256 JWT for a fixed test user so
//! that a locally running inference backend accepts our requests. It is a
//! development shim, nothing here verifies tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{ Hmac, Mac };
use serde_json::json;
use sha2::Sha256;

use crate::cli::Args;

type HmacSha256 = Hmac<Sha256>;

const FALLBACK_SECRET: &str = "mock-jwt-secret-for-testing";
const TOKEN_TTL_SECS: i64 = 3600;

#[derive(Debug, Clone)]
pub enum TokenSource {
    Static(String),
    Mock(MockTokenIssuer),
}

impl TokenSource {
    /// A configured static token wins over the mock issuer.
    pub fn from_args(args: &Args) -> Option<Self> {
        if let Some(token) = args.upstream_token.as_ref().filter(|t| !t.is_empty()) {
            return Some(TokenSource::Static(token.clone()));
        }
        if !args.mock_auth {
            return None;
        }
        let secret = MockTokenIssuer::resolve_secret(
            args.mock_jwt_secret.as_deref(),
            Some(args.supabase_service_role_key.as_str())
        );
        Some(
            TokenSource::Mock(
                MockTokenIssuer::new(secret, args.supabase_url.as_deref(), args.default_user_id.clone())
            )
        )
    }

    pub fn bearer(&self) -> String {
        match self {
            TokenSource::Static(token) => format!("Bearer {}", token),
            TokenSource::Mock(issuer) => format!("Bearer {}", issuer.issue()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockTokenIssuer {
    secret: String,
    issuer: String,
    user_id: String,
}

impl MockTokenIssuer {
    pub fn new(secret: impl Into<String>, supabase_url: Option<&str>, user_id: impl Into<String>) -> Self {
        let issuer = supabase_url
            .and_then(project_ref)
            .map(|r| format!("https://{}.supabase.co/auth/v1", r))
            .unwrap_or_else(|| "https://api.example.com/auth/v1".to_string());
        Self {
            secret: secret.into(),
            issuer,
            user_id: user_id.into(),
        }
    }

    /// Picks the signing secret: an explicit one wins, then the signature
    /// segment of the service-role key, then a fixed test secret.
    pub fn resolve_secret(explicit: Option<&str>, service_role_key: Option<&str>) -> String {
        if let Some(s) = explicit.filter(|s| !s.is_empty()) {
            return s.to_string();
        }
        service_role_key
            .and_then(|k| k.rsplit('.').next())
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| FALLBACK_SECRET.to_string())
    }

    pub fn issue(&self) -> String {
        let now = Utc::now().timestamp();
        let header = json!({ "alg": "HS256", "typ": "JWT" });
        let claims =
            json!({
            "iss": self.issuer,
            "sub": self.user_id,
            "aud": "authenticated",
            "exp": now + TOKEN_TTL_SECS,
            "iat": now,
            "email": "test@example.com",
            "phone": "",
            "app_metadata": { "provider": "email", "providers": ["email"] },
            "user_metadata": { "name": "Test User" },
            "role": "authenticated"
        });

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );
        let signature = sign(&self.secret, &signing_input);
        format!("{}.{}", signing_input, signature)
    }
}

fn sign(secret: &str, input: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(input.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

fn project_ref(supabase_url: &str) -> Option<String> {
    let parsed = url::Url::parse(supabase_url).ok()?;
    parsed
        .host_str()?
        .split('.')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_resolution_order() {
        assert_eq!(MockTokenIssuer::resolve_secret(Some("explicit"), Some("a.b.sig")), "explicit");
        assert_eq!(MockTokenIssuer::resolve_secret(None, Some("a.b.sig")), "sig");
        assert_eq!(MockTokenIssuer::resolve_secret(Some(""), None), FALLBACK_SECRET);
    }

    #[test]
    fn token_is_verifiable_hs256() {
        let issuer = MockTokenIssuer::new("secret", Some("https://abcd.supabase.co"), "test-user-123");
        let token = issuer.issue();
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let expected = sign("secret", &format!("{}.{}", parts[0], parts[1]));
        assert_eq!(parts[2], expected);

        let claims: serde_json::Value = serde_json
            ::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap())
            .unwrap();
        assert_eq!(claims["sub"], "test-user-123");
        assert_eq!(claims["iss"], "https://abcd.supabase.co/auth/v1");
        assert_eq!(
            claims["exp"].as_i64().unwrap() - claims["iat"].as_i64().unwrap(),
            TOKEN_TTL_SECS
        );
    }

    #[test]
    fn static_token_header() {
        assert_eq!(TokenSource::Static("abc".into()).bearer(), "Bearer abc");
    }
}
