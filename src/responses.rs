use actix::MailboxError;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Error, ErrorKind, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
  pub error: String,
  pub message: String,
}

/// Stable code for API callers. Policy violations carry their own.
pub fn error_code(e: &Error) -> &'static str {
  match e {
    Error::Policy(p) => p.code(),
    Error::NotReady(_) => "not_ready",
    Error::EmptyLeafSet { .. } => "empty_leaf_set",
    Error::Config(_) => "invalid_request",
    _ => match e.kind() {
      ErrorKind::Transient => "transient",
      ErrorKind::DataIntegrity => "data_integrity",
      ErrorKind::Invariant => "invariant",
      ErrorKind::Storage => "storage",
      ErrorKind::Policy => "policy",
    },
  }
}

pub fn status_for(e: &Error) -> StatusCode {
  match e {
    Error::Policy(_) => StatusCode::CONFLICT,
    Error::Config(_) => StatusCode::BAD_REQUEST,
    Error::NotReady(_) | Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

pub fn error_response(e: &Error) -> HttpResponse {
  HttpResponse::build(status_for(e)).json(ErrorResponse {
    error: error_code(e).to_owned(),
    message: e.to_string(),
  })
}

pub fn bad_request(message: &str) -> HttpResponse {
  HttpResponse::BadRequest().json(ErrorResponse { error: "invalid_request".to_owned(), message: message.to_owned() })
}

/// Renders a job actor's reply.
pub fn reply(result: std::result::Result<Result<Value>, MailboxError>) -> HttpResponse {
  match result {
    Ok(Ok(body)) => HttpResponse::Ok().json(body),
    Ok(Err(e)) => {
      match e.kind() {
        ErrorKind::Policy => debug!("Rejected: {}", e),
        ErrorKind::Transient => warn!("{}", e),
        _ => error!("{}", e),
      }
      error_response(&e)
    },
    Err(e) => {
      error!("Job pool unavailable: {}", e);
      HttpResponse::InternalServerError().json(ErrorResponse { error: "unavailable".to_owned(), message: e.to_string() })
    },
  }
}
