//! Bearer-token extraction and verification for HTTP and WS handlers.

use axum::http::HeaderMap;

use convoai_core::{ConvoError, Result};
use convoai_identity::Claims;

use crate::app::AppState;

/// Pull a bearer token out of the Authorization header or, for WS clients
/// that cannot set headers, a `token` query parameter.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Result<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        let value = value
            .to_str()
            .map_err(|_| ConvoError::InvalidToken("authorization header is not ASCII".into()))?;
        return match value.strip_prefix("Bearer ") {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => Err(ConvoError::InvalidToken(
                "expected 'Bearer <token>'".to_string(),
            )),
        };
    }
    if let Some(token) = query_token {
        if !token.is_empty() {
            return Ok(token.to_string());
        }
    }
    Err(ConvoError::InvalidToken("no bearer token presented".into()))
}

/// Extract and verify in one step — the common path for HTTP handlers.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<(Claims, String)> {
    let token = extract_token(headers, None)?;
    let claims = state.verifier.verify(&token)?;
    Ok((claims, token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn header_takes_priority_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        let token = extract_token(&headers, Some("query-token")).unwrap();
        assert_eq!(token, "abc");
    }

    #[test]
    fn query_token_works_without_header() {
        let token = extract_token(&HeaderMap::new(), Some("qt")).unwrap();
        assert_eq!(token, "qt");
    }

    #[test]
    fn missing_token_is_invalid() {
        let err = extract_token(&HeaderMap::new(), None).unwrap_err();
        assert_eq!(err.code(), "INVALID_TOKEN");
    }

    #[test]
    fn malformed_scheme_is_invalid() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(extract_token(&headers, None).is_err());
    }
}
