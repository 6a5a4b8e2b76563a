use crate::handler::{HandlerSpec, Procedure};
use corral2_error::{Error, Kind};
use corral2_request::Request;
use std::collections::HashMap;

/// The procedure registry. Registration is the owner's single-threaded
/// responsibility before the dispatcher starts -- [`Registry`] itself
/// enforces nothing about when it stops being mutated -- callers freeze
/// it by wrapping it in an `Arc` once setup is done.
#[derive(Default)]
pub struct Registry {
    by_service_procedure: HashMap<(String, String), HashMap<String, HandlerSpec>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `procedures`. A `(service, procedure, encoding)` collision
    /// with an already-registered procedure is fatal.
    pub fn register(&mut self, procedures: Vec<Procedure>) -> Result<(), Error> {
        for p in procedures {
            let key = (p.service.clone(), p.name.clone());
            let encodings = self.by_service_procedure.entry(key).or_default();
            if encodings.contains_key(&p.encoding) {
                return Err(Error::new(
                    Kind::AlreadyExists,
                    format!(
                        "procedure \"{}\"::\"{}\" is already registered for encoding \"{}\"",
                        p.service, p.name, p.encoding
                    ),
                ));
            }
            encodings.insert(p.encoding, p.handler);
        }
        Ok(())
    }

    /// Looks up the handler for `req.service`/`req.procedure`/`req.encoding`.
    /// A missing `(service, procedure)` pair is
    /// `BadRequest` annotated "unrecognized procedure"; a procedure that
    /// exists but not for the requested encoding is `BadRequest` listing
    /// the encodings that are accepted.
    pub fn choose(&self, req: &Request) -> Result<HandlerSpec, Error> {
        let key = (req.service.clone(), req.procedure.clone());
        let encodings = self.by_service_procedure.get(&key).ok_or_else(|| {
            Error::bad_request(format!(
                "unrecognized procedure \"{}\"::\"{}\"",
                req.service, req.procedure
            ))
        })?;

        encodings.get(&req.encoding).cloned().ok_or_else(|| {
            let mut accepted: Vec<&str> = encodings.keys().map(String::as_str).collect();
            accepted.sort_unstable();
            Error::bad_request(format!(
                "procedure \"{}\"::\"{}\" does not accept encoding \"{}\"; accepted encodings: [{}]",
                req.service,
                req.procedure,
                req.encoding,
                accepted.join(", ")
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.by_service_procedure.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
