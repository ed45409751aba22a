//! Response staging.
//!
//! Handlers never write to the wire. They stage a status, headers and a body
//! on the [`Context`](crate::Context); the pipeline turns the staged state
//! into exactly one `http::Response` once the context has ended.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, StatusCode};
use http_body_util::Full;

/// Common content-type values for use with [`Context::bytes`](crate::Context::bytes).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    Csv,          // text/csv
    EventStream,  // text/event-stream  (SSE)
    FormData,     // application/x-www-form-urlencoded
    Html,         // text/html; charset=utf-8
    Json,         // application/json
    OctetStream,  // application/octet-stream
    Text,         // text/plain; charset=utf-8
    Xml,          // application/xml
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv         => "text/csv",
            Self::EventStream => "text/event-stream",
            Self::FormData    => "application/x-www-form-urlencoded",
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml",
        }
    }

    pub(crate) fn header_value(self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }
}

/// The outgoing response as staged by middleware.
///
/// `status == 0` means nobody set one: that resolves to `200 OK` when a body
/// was staged and `404 Not Found` otherwise.
#[derive(Debug, Default)]
pub(crate) struct Staged {
    pub(crate) status: u16,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

impl Staged {
    pub(crate) fn resolved_status(&self) -> StatusCode {
        match self.status {
            0 if self.body.is_empty() => StatusCode::NOT_FOUND,
            0 => StatusCode::OK,
            code => StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    pub(crate) fn set_content(&mut self, content_type: ContentType, body: Bytes) {
        self.headers.insert(CONTENT_TYPE, content_type.header_value());
        self.body = body;
    }

    pub(crate) fn into_http(self) -> http::Response<Full<Bytes>> {
        let status = self.resolved_status();
        let mut res = http::Response::new(Full::new(self.body));
        *res.status_mut() = status;
        *res.headers_mut() = self.headers;
        res
    }
}
