use std::time::Duration;

use crate::client::{ApiErrorClass, DocsError};

/// Result of a single remote call, tagged by what the caller should do next.
#[derive(Debug)]
pub enum FetchOutcome<T> {
    Ok(T),
    RateLimited { retry_after: Option<Duration> },
    NotFound,
    Transient(String),
    Fatal(DocsError),
}

impl<T> FetchOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FetchOutcome<U> {
        match self {
            FetchOutcome::Ok(value) => FetchOutcome::Ok(f(value)),
            FetchOutcome::RateLimited { retry_after } => FetchOutcome::RateLimited { retry_after },
            FetchOutcome::NotFound => FetchOutcome::NotFound,
            FetchOutcome::Transient(message) => FetchOutcome::Transient(message),
            FetchOutcome::Fatal(err) => FetchOutcome::Fatal(err),
        }
    }

    pub fn ok(self) -> Option<T> {
        match self {
            FetchOutcome::Ok(value) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn from_error(err: DocsError, retry_after: Option<Duration>) -> Self {
        match err.classification() {
            Some(ApiErrorClass::RateLimit) => FetchOutcome::RateLimited { retry_after },
            Some(ApiErrorClass::NotFound) => FetchOutcome::NotFound,
            Some(ApiErrorClass::Transient) => FetchOutcome::Transient(err.to_string()),
            Some(ApiErrorClass::Auth | ApiErrorClass::Permanent) => FetchOutcome::Fatal(err),
            None => {
                if err.is_connection_level() {
                    FetchOutcome::Transient(err.to_string())
                } else {
                    FetchOutcome::Fatal(err)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    fn api(status: StatusCode) -> DocsError {
        DocsError::Api {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn status_codes_map_to_tags() {
        assert!(matches!(
            FetchOutcome::<()>::from_error(api(StatusCode::TOO_MANY_REQUESTS), None),
            FetchOutcome::RateLimited { retry_after: None }
        ));
        assert!(matches!(
            FetchOutcome::<()>::from_error(api(StatusCode::NOT_FOUND), None),
            FetchOutcome::NotFound
        ));
        assert!(matches!(
            FetchOutcome::<()>::from_error(api(StatusCode::BAD_GATEWAY), None),
            FetchOutcome::Transient(_)
        ));
        assert!(matches!(
            FetchOutcome::<()>::from_error(api(StatusCode::FORBIDDEN), None),
            FetchOutcome::Fatal(_)
        ));
        assert!(matches!(
            FetchOutcome::<()>::from_error(api(StatusCode::BAD_REQUEST), None),
            FetchOutcome::Fatal(_)
        ));
    }

    #[test]
    fn map_preserves_non_ok_tags() {
        let limited: FetchOutcome<u32> = FetchOutcome::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(matches!(
            limited.map(|v| v + 1),
            FetchOutcome::RateLimited {
                retry_after: Some(d)
            } if d == Duration::from_secs(2)
        ));
        assert_eq!(FetchOutcome::Ok(1u32).map(|v| v + 1).ok(), Some(2));
    }
}
