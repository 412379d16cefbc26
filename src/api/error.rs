use axum::{Json, http::StatusCode, response::IntoResponse};
use tracing::Span;

use crate::error::{Error as CoreError, ErrorEnvelope};

/// Core error rendered as the `{code, msg}` envelope with the status its
/// kind maps to.
pub struct Error(CoreError);

impl<E> From<E> for Error
where
    E: Into<CoreError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.0.kind().http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let envelope: ErrorEnvelope = self.0.envelope();
        Span::current().record("error", envelope.code.as_str());
        (status, Json(envelope)).into_response()
    }
}
