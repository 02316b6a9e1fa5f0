use shot_guard::BlockError;
#[cfg(feature = "axum")]
use shot_guard::BlockReason;

/// Errors produced by the guard middleware.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GuardError {
    /// A rule of the engine rejected the request.
    ///
    /// When the `axum` feature is enabled this converts to
    /// `429 Too Many Requests` for flow and hot-parameter limits (with a
    /// `Retry-After` header), `503 Service Unavailable` for open circuits and
    /// system protection, and `403 Forbidden` for authority rules.
    #[error(transparent)]
    Blocked(#[from] BlockError),

    /// The inner service failed. The entry was recorded as an exception.
    ///
    /// The string contains the `Display` representation of the inner error.
    #[error("Internal service error: {0}")]
    Inner(String),

    /// The guard itself could not run the checks.
    #[error("Guard failure: {0}")]
    Internal(String),
}

impl GuardError {
    pub fn is_blocked(&self) -> bool {
        matches!(self, GuardError::Blocked(_))
    }

    pub fn block_error(&self) -> Option<&BlockError> {
        match self {
            GuardError::Blocked(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for GuardError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, msg, headers) = match &self {
            Self::Blocked(err) => match err.reason() {
                BlockReason::FlowRule | BlockReason::ParamFlow | BlockReason::Custom => (
                    StatusCode::TOO_MANY_REQUESTS,
                    self.to_string(),
                    Some((
                        axum::http::header::RETRY_AFTER,
                        axum::http::HeaderValue::from(1u64),
                    )),
                ),
                BlockReason::DegradeRule | BlockReason::SystemRule => {
                    (StatusCode::SERVICE_UNAVAILABLE, self.to_string(), None)
                }
                BlockReason::AuthorityRule => (StatusCode::FORBIDDEN, self.to_string(), None),
            },
            Self::Inner(_) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string(), None)
            }
        };

        let mut response = (status, msg).into_response();
        if let Some((name, value)) = headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}
