//! HTTP response types for the Nexus server

use actix_web::{HttpResponse, HttpResponseBuilder, http::StatusCode};
use nexus_common::ErrorCode;
use serde::{Deserialize, Serialize};

/// Generic result wrapper for API responses
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Result<T> {
    pub code: i32,
    pub message: String,
    pub data: T,
}

impl<T> Result<T> {
    pub fn new(code: i32, message: String, data: T) -> Self {
        Result::<T> {
            code,
            message,
            data,
        }
    }

    pub fn success(data: T) -> Result<T> {
        Result::<T> {
            code: 0,
            message: "success".to_string(),
            data,
        }
    }

    pub fn http_success(data: impl Serialize) -> HttpResponse {
        HttpResponse::Ok().json(Result::success(data))
    }

    pub fn http_response(
        status: u16,
        code: i32,
        message: String,
        data: impl Serialize,
    ) -> HttpResponse {
        HttpResponseBuilder::new(
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        )
        .json(Result::new(code, message, data))
    }

    /// Error response carrying `error_code` and a detail message
    pub fn http_error(
        status: StatusCode,
        error_code: ErrorCode<'_>,
        detail: String,
        data: impl Serialize,
    ) -> HttpResponse {
        HttpResponseBuilder::new(status).json(Result::new(
            error_code.code,
            format!("{}: {}", error_code.message, detail),
            data,
        ))
    }
}
