#![deny(rust_2018_idioms)]

//! The canonical request/response envelope and its ordered,
//! case-insensitive header map.

mod body;
mod headers;

pub use body::Body;
pub use headers::Headers;

use corral2_error::Error;

/// A single inbound or outbound call, independent of the transport that
/// carried it.
///
/// `body` is read at most once -- [`Body`] enforces this at runtime rather
/// than the type system, since the same `Request` value is threaded through
/// transport-specific encoders that don't all know about each other.
#[derive(Debug)]
pub struct Request {
    pub caller: String,
    pub service: String,
    pub transport: String,
    pub encoding: String,
    pub procedure: String,
    pub headers: Headers,
    pub shard_key: Option<String>,
    pub routing_key: Option<String>,
    pub routing_delegate: Option<String>,
    pub body: Body,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    /// Validates the fields the dispatcher requires to be non-empty before
    /// it will attempt to route this request: caller, service, procedure,
    /// and encoding must all be non-empty.
    pub fn validate(&self) -> Result<(), Error> {
        for (name, value) in [
            ("caller", &self.caller),
            ("service", &self.service),
            ("procedure", &self.procedure),
            ("encoding", &self.encoding),
        ] {
            if value.is_empty() {
                return Err(Error::bad_request(format!("request {} must not be empty", name)));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RequestBuilder {
    caller: String,
    service: String,
    transport: String,
    encoding: String,
    procedure: String,
    headers: Headers,
    shard_key: Option<String>,
    routing_key: Option<String>,
    routing_delegate: Option<String>,
    body: Option<Body>,
}

impl RequestBuilder {
    pub fn caller(mut self, v: impl Into<String>) -> Self {
        self.caller = v.into();
        self
    }
    pub fn service(mut self, v: impl Into<String>) -> Self {
        self.service = v.into();
        self
    }
    pub fn transport(mut self, v: impl Into<String>) -> Self {
        self.transport = v.into();
        self
    }
    pub fn encoding(mut self, v: impl Into<String>) -> Self {
        self.encoding = v.into();
        self
    }
    pub fn procedure(mut self, v: impl Into<String>) -> Self {
        self.procedure = v.into();
        self
    }
    pub fn headers(mut self, v: Headers) -> Self {
        self.headers = v;
        self
    }
    pub fn shard_key(mut self, v: impl Into<String>) -> Self {
        self.shard_key = Some(v.into());
        self
    }
    pub fn routing_key(mut self, v: impl Into<String>) -> Self {
        self.routing_key = Some(v.into());
        self
    }
    pub fn routing_delegate(mut self, v: impl Into<String>) -> Self {
        self.routing_delegate = Some(v.into());
        self
    }
    pub fn body(mut self, v: Body) -> Self {
        self.body = Some(v);
        self
    }

    pub fn build(self) -> Request {
        Request {
            caller: self.caller,
            service: self.service,
            transport: self.transport,
            encoding: self.encoding,
            procedure: self.procedure,
            headers: self.headers,
            shard_key: self.shard_key,
            routing_key: self.routing_key,
            routing_delegate: self.routing_delegate,
            body: self.body.unwrap_or_else(Body::empty),
        }
    }
}

/// The reply to a [`Request`].
///
/// `application_error` is kept distinct from a transport-level error: a
/// handler that returns a classified application error does not have its
/// response coerced into a transport failure.
#[derive(Debug)]
pub struct Response {
    pub headers: Headers,
    pub body: Body,
    pub application_error: Option<Error>,
}

impl Response {
    pub fn new(body: Body) -> Self {
        Self {
            headers: Headers::new(),
            body,
            application_error: None,
        }
    }

    pub fn from_application_error(err: Error) -> Self {
        Self {
            headers: Headers::new(),
            body: Body::empty(),
            application_error: Some(err),
        }
    }

    pub fn is_application_error(&self) -> bool {
        self.application_error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_fields() {
        let req = Request::builder()
            .caller("c")
            .service("s")
            .encoding("json")
            .body(Body::from_bytes(bytes::Bytes::new()))
            .build();
        let err = req.validate().unwrap_err();
        assert!(err.message().contains("procedure"));
    }

    #[test]
    fn validate_accepts_full_request() {
        let req = Request::builder()
            .caller("c")
            .service("s")
            .procedure("p")
            .encoding("json")
            .build();
        assert!(req.validate().is_ok());
    }
}
