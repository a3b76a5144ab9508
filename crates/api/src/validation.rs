use std::collections::BTreeMap;

use axum::http::HeaderMap;
use validator::Validate;

use crate::error::ApiError;
use crate::middleware::USER_EMAIL_HEADER;

const USER_EMAIL_PARAM: &str = "user_email";

pub fn validate<T: Validate>(value: &T) -> Result<(), ApiError> {
    value
        .validate()
        .map_err(|err| ApiError::Validation(err.to_string()))?;
    Ok(())
}

#[derive(Debug, Validate)]
struct Caller {
    #[validate(email)]
    email: String,
}

/// The calling user, from the `x-user-email` header or the `user_email`
/// query parameter. The parameter is removed from `params` either way so it
/// never takes part in the request fingerprint.
pub fn caller(
    headers: &HeaderMap,
    params: &mut BTreeMap<String, String>,
) -> Result<Option<String>, ApiError> {
    let from_query = params.remove(USER_EMAIL_PARAM);
    let from_header = match headers.get(USER_EMAIL_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| ApiError::Validation("invalid user email header".into()))?
                .to_string(),
        ),
        None => None,
    };
    let Some(email) = from_header.or(from_query) else {
        return Ok(None);
    };
    let email = email.trim().to_ascii_lowercase();
    if email.is_empty() {
        return Ok(None);
    }
    let caller = Caller { email };
    validate(&caller)?;
    Ok(Some(caller.email))
}

pub fn require_caller(
    headers: &HeaderMap,
    params: &mut BTreeMap<String, String>,
) -> Result<String, ApiError> {
    caller(headers, params)?
        .ok_or_else(|| ApiError::Validation("user email is required".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn header_wins_over_query_and_query_param_is_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_EMAIL_HEADER, HeaderValue::from_static("Reader@Example.com"));
        let mut params = BTreeMap::from([
            ("user_email".to_string(), "other@example.com".to_string()),
            ("title".to_string(), "Dune".to_string()),
        ]);
        let user = caller(&headers, &mut params).unwrap();
        assert_eq!(user.as_deref(), Some("reader@example.com"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn missing_user_is_not_an_error_unless_required() {
        let headers = HeaderMap::new();
        let mut params = BTreeMap::new();
        assert_eq!(caller(&headers, &mut params).unwrap(), None);
        assert!(require_caller(&headers, &mut params).is_err());
    }

    #[test]
    fn rejects_malformed_email() {
        let headers = HeaderMap::new();
        let mut params = BTreeMap::from([("user_email".to_string(), "not-an-email".to_string())]);
        assert!(matches!(
            caller(&headers, &mut params),
            Err(ApiError::Validation(_))
        ));
    }
}
