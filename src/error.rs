/// Error module.
///
/// Every fallible operation in the crate returns `error::Result`. The error
/// doubles as a Rocket responder so handlers can just use `?`: the status it
/// maps to is forwarded to the matching catcher.
use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not authorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("drive request failed with status {status}: {message}")]
    Drive { status: u16, message: String },

    #[error("unsupported matrix format: {0}")]
    UnsupportedFormat(String),

    #[error("variable `{0}` not found in matrix file")]
    MissingVariable(String),

    #[error("matrix error: {0}")]
    Matrix(String),

    #[error("bad shape: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("png error: {0}")]
    Png(#[from] png::EncodingError),

    #[error("protobuf error: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Error::NotFound(_) | Error::MissingVariable(_) => Status::NotFound,
            Error::Unauthorized => Status::Unauthorized,
            Error::BadRequest(_) | Error::UnsupportedFormat(_) | Error::Shape(_) => {
                Status::BadRequest
            }
            Error::Drive { status: 401, .. } | Error::Drive { status: 403, .. } => {
                Status::Unauthorized
            }
            Error::Drive { status: 404, .. } => Status::NotFound,
            Error::Drive { .. } | Error::Http(_) => Status::BadGateway,
            _ => Status::InternalServerError,
        }
    }
}

impl<'r> Responder<'r, 'static> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if status.code >= 500 {
            error!("{} {}: {}", req.method(), req.uri(), self);
        } else {
            warn!("{} {}: {}", req.method(), req.uri(), self);
        }
        Err(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_auth_failures_send_user_to_login() {
        let err = Error::Drive {
            status: 401,
            message: "expired".to_string(),
        };
        assert_eq!(Status::Unauthorized, err.status());
    }

    #[test]
    fn test_upstream_failures_are_bad_gateway() {
        let err = Error::Drive {
            status: 500,
            message: "backend".to_string(),
        };
        assert_eq!(Status::BadGateway, err.status());
        assert_eq!(
            Status::NotFound,
            Error::MissingVariable("images".to_string()).status()
        );
    }
}
