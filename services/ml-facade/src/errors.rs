use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use facade_core::{Error as FacadeError, ErrorClass};
use thiserror::Error;

const SERVER_ERROR_MESSAGE: &str =
    "the server encountered a problem and could not process your request";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Facade(#[from] FacadeError),

    #[error("invalid JSON in request body")]
    InvalidJson(String),

    #[error("the requested resource could not be found")]
    NotFound,

    #[error("the {0} method is not supported for this resource")]
    MethodNotAllowed(String),

    #[error("rate limit exceeded")]
    RateLimited,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Facade(e) => e.code(),
            ApiError::InvalidJson(_) => "INVALID_JSON",
            ApiError::NotFound => "NOT_FOUND",
            ApiError::MethodNotAllowed(_) => "METHOD_NOT_ALLOWED",
            ApiError::RateLimited => "RATE_LIMITED",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Facade(e) if e.class() == ErrorClass::Internal => {
                SERVER_ERROR_MESSAGE.to_string()
            }
            other => other.to_string(),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Facade(e) => match e {
                FacadeError::LengthMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                FacadeError::ThresholdNotFound(_) => StatusCode::NOT_FOUND,
                FacadeError::ScorerTransport(_)
                | FacadeError::ScorerStatus { .. }
                | FacadeError::ScorerDecode(_)
                | FacadeError::ScorerUnhealthy { .. } => StatusCode::BAD_GATEWAY,
                other if other.class() == ErrorClass::Input => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::InvalidJson(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.code(),
            "message": self.message()
        }))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
