#![deny(rust_2018_idioms)]

//! The classified error taxonomy described by the runtime's dispatch
//! contract: every transport, chooser and handler eventually produces (or
//! wraps) one of these kinds so that callers can make policy decisions
//! (retry, surface to a caller, log-and-drop) without parsing strings.

use std::error::Error as StdError;
use std::fmt;

/// A type-erased, thread-safe error, the same shape transports and
/// middleware pass around before it is classified.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// An uninhabited error type for futures that can never fail.
#[derive(Debug)]
pub enum Never {}

impl fmt::Display for Never {
    fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {}
    }
}

impl StdError for Never {}

/// The closed set of error kinds the runtime classifies every failure into.
///
/// This mirrors common RPC status taxonomies (gRPC's `Code`, YARPC's
/// `yarpcerrors.Code`): a small enum that every transport maps its
/// wire-level failures onto, so callers can reason about retryability and
/// presentation independent of which transport carried the call.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    BadRequest,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    DeadlineExceeded,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Cancelled,
}

impl Kind {
    fn as_str(self) -> &'static str {
        match self {
            Kind::BadRequest => "bad-request",
            Kind::Unauthenticated => "unauthenticated",
            Kind::PermissionDenied => "permission-denied",
            Kind::NotFound => "not-found",
            Kind::AlreadyExists => "already-exists",
            Kind::DeadlineExceeded => "deadline-exceeded",
            Kind::ResourceExhausted => "resource-exhausted",
            Kind::FailedPrecondition => "failed-precondition",
            Kind::Aborted => "aborted",
            Kind::OutOfRange => "out-of-range",
            Kind::Unimplemented => "unimplemented",
            Kind::Internal => "internal",
            Kind::Unavailable => "unavailable",
            Kind::DataLoss => "data-loss",
            Kind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified, causally-chained error.
///
/// `source` is boxed rather than generic so that `Error` can flow through
/// `tower`-shaped service boundaries (`Into<BoxError>`) without every
/// middleware layer needing to name the concrete error type underneath it.
#[derive(Debug)]
pub struct Error {
    kind: Kind,
    message: String,
    source: Option<BoxError>,
}

impl Error {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_cause(kind: Kind, message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Classifies an opaque error, preserving the innermost [`Kind`] already
    /// attached to it if one is found by walking `source()`, and falling
    /// back to `Internal` otherwise. This is the "wrapping preserves kind of
    /// the innermost classified cause" rule.
    pub fn classify(err: BoxError) -> Self {
        if let Some(classified) = find_classified(err.as_ref()) {
            return Self {
                kind: classified,
                message: err.to_string(),
                source: Some(err),
            };
        }
        Self {
            kind: Kind::Internal,
            message: err.to_string(),
            source: Some(err),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Kind::BadRequest, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Kind::DeadlineExceeded, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Kind::Unavailable, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Kind::NotFound, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Kind::FailedPrecondition, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Kind::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Kind::Internal, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Kind::Cancelled, message)
    }

    pub fn is(&self, kind: Kind) -> bool {
        self.kind == kind
    }
}

fn find_classified(err: &(dyn StdError + 'static)) -> Option<Kind> {
    let mut cur = Some(err);
    while let Some(e) = cur {
        if let Some(classified) = e.downcast_ref::<Error>() {
            return Some(classified.kind);
        }
        cur = e.source();
    }
    None
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

/// Aggregates multiple component errors (used by `Chooser::update`, whose
/// individual add/remove failures should not short-circuit the whole call).
#[derive(Debug)]
pub struct Aggregate(pub Vec<Error>);

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s): ", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl StdError for Aggregate {}

impl Aggregate {
    pub fn from_results<T>(results: Vec<Result<T, Error>>) -> Result<Vec<T>, Self> {
        let mut oks = Vec::with_capacity(results.len());
        let mut errs = Vec::new();
        for r in results {
            match r {
                Ok(v) => oks.push(v),
                Err(e) => errs.push(e),
            }
        }
        if errs.is_empty() {
            Ok(oks)
        } else {
            Err(Aggregate(errs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_unknown_is_internal() {
        let boxed: BoxError = "boom".into();
        let classified = Error::classify(boxed);
        assert_eq!(classified.kind(), Kind::Internal);
    }

    #[test]
    fn classify_preserves_innermost_kind() {
        let inner = Error::deadline_exceeded("timed out");
        let boxed: BoxError = Box::new(inner);
        let classified = Error::classify(boxed);
        assert_eq!(classified.kind(), Kind::DeadlineExceeded);
    }

    #[test]
    fn classify_walks_source_chain() {
        #[derive(Debug)]
        struct Wrapper(Error);
        impl fmt::Display for Wrapper {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "wrapped: {}", self.0)
            }
        }
        impl StdError for Wrapper {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                Some(&self.0)
            }
        }

        let wrapped = Wrapper(Error::unavailable("no peers"));
        let boxed: BoxError = Box::new(wrapped);
        let classified = Error::classify(boxed);
        assert_eq!(classified.kind(), Kind::Unavailable);
    }

    #[test]
    fn aggregate_collects_all_errors() {
        let results: Vec<Result<(), Error>> = vec![
            Ok(()),
            Err(Error::not_found("p1")),
            Err(Error::not_found("p2")),
        ];
        let err = Aggregate::from_results(results).unwrap_err();
        assert_eq!(err.0.len(), 2);
    }
}
