use crate::error::Error;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub(crate) struct APIError(anyhow::Error);

fn rejection_status(rejection: &JsonRejection) -> StatusCode {
    match rejection {
        JsonRejection::JsonDataError(_) => StatusCode::UNPROCESSABLE_ENTITY,
        JsonRejection::JsonSyntaxError(_) => StatusCode::BAD_REQUEST,
        JsonRejection::MissingJsonContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for APIError {
    fn into_response(self) -> Response {
        let any_err = self.0;
        let status = match any_err.downcast_ref::<Error>() {
            Some(Error::Unauthorized) => StatusCode::UNAUTHORIZED,
            Some(Error::AuthForbidden(_, _)) => StatusCode::FORBIDDEN,
            Some(Error::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(Error::NotImplemented) => StatusCode::NOT_IMPLEMENTED,
            Some(Error::InvalidDNS01 | Error::InvalidAllowFrom(_)) => StatusCode::BAD_REQUEST,
            Some(Error::JsonExtractorRejection(err)) => rejection_status(err),
            Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
            None => match any_err.downcast_ref::<JsonRejection>() {
                Some(err) => rejection_status(err),
                None if any_err.is::<serde_json::Error>() => StatusCode::BAD_REQUEST,
                None => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error serving request: {any_err:?}");
            "internal server error".to_string()
        } else {
            format!("{any_err}")
        };
        let body = Json(json!({
            "error": message,
        }));
        (status, body).into_response()
    }
}

impl<E> From<E> for APIError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
