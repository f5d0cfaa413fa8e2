//! Login parameter shaping for the `login` method.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

/// Algorithm tag sent alongside a password digest.
pub const DIGEST_ALGORITHM: &str = "sha-256";

/// SHA-256 over the UTF-8 password bytes, standard base64 encoded.
pub fn password_digest(password: &str) -> String {
    STANDARD.encode(Sha256::digest(password.as_bytes()))
}

/// `{user: {username}, password: {digest, algorithm}}`
pub fn password_login_params(username: &str, password: &str) -> Value {
    json!({
        "user": { "username": username },
        "password": {
            "digest": password_digest(password),
            "algorithm": DIGEST_ALGORITHM,
        },
    })
}

/// `{resume: token}`
pub fn token_login_params(token: &str) -> Value {
    json!({ "resume": token })
}

/// Extract the resume token from a successful login result.
pub(crate) fn login_token(result: &Value) -> Option<&str> {
    result.get("token").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_digest_known_value() {
        // sha256("password")
        assert_eq!(
            password_digest("password"),
            "XohImNooBHFR0OVvjcYpJ3NgPQ1qq73WKhHvch0VQtg="
        );
    }

    #[test]
    fn test_password_login_params_shape() {
        let params = password_login_params("a", "password");

        assert_eq!(params["user"]["username"], "a");
        assert_eq!(params["password"]["algorithm"], "sha-256");
        assert_eq!(
            params["password"]["digest"],
            "XohImNooBHFR0OVvjcYpJ3NgPQ1qq73WKhHvch0VQtg="
        );
    }

    #[test]
    fn test_token_login_params_shape() {
        assert_eq!(token_login_params("t"), json!({ "resume": "t" }));
    }

    #[test]
    fn test_login_token_extraction() {
        assert_eq!(login_token(&json!({"id": "u1", "token": "t"})), Some("t"));
        assert_eq!(login_token(&json!({"id": "u1"})), None);
    }
}
