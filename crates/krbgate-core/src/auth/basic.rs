use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Build the `Proxy-Authorization` value for static credentials: the scheme
/// name followed by base64 over `user:password`.
pub fn header_value(user: &str, password: &str) -> String {
    let mut raw = String::with_capacity(user.len() + password.len() + 1);
    raw.push_str(user);
    raw.push(':');
    raw.push_str(password);
    format!("Basic {}", STANDARD.encode(raw))
}

/// Recover the credential pair from a `Basic` header value. The password may
/// itself contain colons; only the first one separates the user.
pub fn parse(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let split = decoded.find(':')?;
    Some((
        decoded[..split].to_string(),
        decoded[split + 1..].to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_value() {
        assert_eq!(
            header_value("test_user", "test_password"),
            "Basic dGVzdF91c2VyOnRlc3RfcGFzc3dvcmQ="
        );
    }

    #[test]
    fn test_parse_keeps_colons_in_password() {
        let (user, password) = parse(&header_value("svc@corp", "a:b:c!")).unwrap();
        assert_eq!(user, "svc@corp");
        assert_eq!(password, "a:b:c!");
    }

    #[test]
    fn test_parse_rejects_other_schemes_and_garbage() {
        assert!(parse("Negotiate dGVzdA==").is_none());
        assert!(parse("Basic not-base64!").is_none());
        assert!(parse("Basic dGVzdA==").is_none()); // no colon inside
    }
}
