//! Building HTTP responses.

use std::fmt;

use hyper::{Body, Response as HyperResponse, StatusCode};

pub struct Response(HyperResponse<Body>);

impl Response {
    pub fn not_found() -> Self {
        Self::error(StatusCode::NOT_FOUND, "resource not found")
    }

    pub fn method_not_allowed() -> Self {
        Self::error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    }

    pub fn bad_request(message: impl fmt::Display) -> Self {
        Self::error(StatusCode::BAD_REQUEST, message)
    }

    pub fn error(status: StatusCode, message: impl fmt::Display) -> Self {
        ResponseBuilder::new(status)
            .content_type(ContentType::TEXT)
            .body(message.to_string())
    }

    pub fn into_hyper(self) -> HyperResponse<Body> {
        self.0
    }
}


//------------ ResponseBuilder ---------------------------------------------------

pub struct ResponseBuilder {
    builder: hyper::http::response::Builder,
}

impl ResponseBuilder {
    pub fn new(status: StatusCode) -> Self {
        ResponseBuilder {
            builder: HyperResponse::builder()
                .status(status)
                .header("Access-Control-Allow-Origin", "*"),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn content_type(self, content_type: ContentType) -> Self {
        ResponseBuilder {
            builder: self.builder.header("Content-Type", content_type.0),
        }
    }

    pub fn body(self, body: impl Into<Body>) -> Response {
        Response(
            self.builder.body(body.into())
                .expect("broken HTTP response builder")
        )
    }
}


//------------ ContentType --------------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct ContentType(&'static str);

impl ContentType {
    pub const JSON: ContentType = ContentType("application/json");
    pub const TEXT: ContentType = ContentType("text/plain;charset=utf-8");
    pub const PROMETHEUS: ContentType = ContentType("text/plain; version=0.0.4");
}
