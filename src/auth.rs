use axum::http::{header::AUTHORIZATION, HeaderMap};

/// Checks `Authorization: Bearer <key>`. No configured key means the endpoint is open.
pub fn verify_bearer(headers: &HeaderMap, expected_key: Option<&str>) -> Result<(), &'static str> {
    let Some(expected_key) = expected_key else {
        return Ok(());
    };

    let token = extract_bearer_token(headers)?;
    if token.trim() != expected_key {
        return Err("Invalid API key");
    }

    Ok(())
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, &'static str> {
    let Some(raw_header) = headers.get(AUTHORIZATION) else {
        return Err("Missing Authorization header");
    };

    let Ok(value) = raw_header.to_str() else {
        return Err("Invalid Authorization header");
    };

    value
        .strip_prefix("Bearer ")
        .ok_or("Authorization must use Bearer token")
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn open_when_no_key_is_configured() {
        assert!(verify_bearer(&HeaderMap::new(), None).is_ok());
    }

    #[test]
    fn bearer_token_must_match() {
        assert!(verify_bearer(&headers("Bearer s3cret"), Some("s3cret")).is_ok());
        assert_eq!(
            verify_bearer(&headers("Bearer nope"), Some("s3cret")),
            Err("Invalid API key")
        );
        assert_eq!(
            verify_bearer(&headers("Basic abc"), Some("s3cret")),
            Err("Authorization must use Bearer token")
        );
        assert_eq!(
            verify_bearer(&HeaderMap::new(), Some("s3cret")),
            Err("Missing Authorization header")
        );
    }
}
