//! Binary envelope format: the on-the-wire shape a [`Request`] and its
//! trace span context take when they travel through the queue backend as a
//! single opaque blob.
//!
//! Layout (all integers little-endian `u32`):
//!
//! ```text
//! version: u8 (always 0)
//! span_context: presence: u8, [len: u32, bytes]
//! caller:            len: u32, bytes
//! service:           len: u32, bytes
//! transport:         len: u32, bytes
//! encoding:          len: u32, bytes
//! procedure:         len: u32, bytes
//! shard_key:         presence: u8, [len: u32, bytes]
//! routing_key:       presence: u8, [len: u32, bytes]
//! routing_delegate:  presence: u8, [len: u32, bytes]
//! header_count:      u32
//! headers[]:         key(len: u32, bytes), value(len: u32, bytes)
//! body:              len: u32, bytes
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use corral2_error::{Error, Kind};
use corral2_request::{Body, Headers, Request};
use corral2_tracing::Carrier;

const VERSION: u8 = 0;

fn put_lp(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn put_optional_lp(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            put_lp(buf, v);
        }
        None => buf.put_u8(0),
    }
}

fn get_lp(buf: &mut Bytes) -> Result<Bytes, Error> {
    if buf.remaining() < 4 {
        return Err(Error::new(Kind::Internal, "envelope truncated reading a length prefix"));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(Error::new(Kind::Internal, "envelope truncated reading a field"));
    }
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes) -> Result<String, Error> {
    let raw = get_lp(buf)?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| Error::with_cause(Kind::Internal, "envelope field is not valid utf-8", e))
}

fn get_optional_lp(buf: &mut Bytes) -> Result<Option<Bytes>, Error> {
    if buf.remaining() < 1 {
        return Err(Error::new(Kind::Internal, "envelope truncated reading a presence byte"));
    }
    match buf.get_u8() {
        0 => Ok(None),
        _ => Ok(Some(get_lp(buf)?)),
    }
}

fn get_optional_string(buf: &mut Bytes) -> Result<Option<String>, Error> {
    match get_optional_lp(buf)? {
        None => Ok(None),
        Some(raw) => String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|e| Error::with_cause(Kind::Internal, "envelope field is not valid utf-8", e)),
    }
}

/// Injects `span_context` onto `req`, reads its body fully, and serializes
/// the pair into a single framed record prefixed with the version byte.
pub async fn to_bytes(span_context: Option<Carrier>, req: &mut Request) -> Result<Vec<u8>, Error> {
    let body = req.body.read_to_end().await?;

    let mut buf = BytesMut::new();
    buf.put_u8(VERSION);
    put_optional_lp(&mut buf, span_context.as_deref());
    put_lp(&mut buf, req.caller.as_bytes());
    put_lp(&mut buf, req.service.as_bytes());
    put_lp(&mut buf, req.transport.as_bytes());
    put_lp(&mut buf, req.encoding.as_bytes());
    put_lp(&mut buf, req.procedure.as_bytes());
    put_optional_lp(&mut buf, req.shard_key.as_deref().map(str::as_bytes));
    put_optional_lp(&mut buf, req.routing_key.as_deref().map(str::as_bytes));
    put_optional_lp(&mut buf, req.routing_delegate.as_deref().map(str::as_bytes));

    buf.put_u32(req.headers.len() as u32);
    for (k, v) in req.headers.iter() {
        put_lp(&mut buf, k.as_bytes());
        put_lp(&mut buf, v.as_bytes());
    }

    put_lp(&mut buf, &body);
    Ok(buf.to_vec())
}

/// Decodes a framed record back into a request and its (possibly absent)
/// parent span context. A missing span context is not an error -- the
/// record may have been sent by a caller with no tracer configured.
pub fn from_bytes(bytes: &[u8]) -> Result<(Option<Carrier>, Request), Error> {
    if bytes.len() < 2 {
        return Err(Error::new(Kind::Internal, "envelope shorter than the minimum frame"));
    }
    if bytes[0] != VERSION {
        return Err(Error::new(
            Kind::Internal,
            format!("unsupported envelope version {}", bytes[0]),
        ));
    }

    let mut buf = Bytes::copy_from_slice(&bytes[1..]);
    let span_context = get_optional_lp(&mut buf)?.map(|b| b.to_vec());
    let caller = get_string(&mut buf)?;
    let service = get_string(&mut buf)?;
    let transport = get_string(&mut buf)?;
    let encoding = get_string(&mut buf)?;
    let procedure = get_string(&mut buf)?;
    let shard_key = get_optional_string(&mut buf)?;
    let routing_key = get_optional_string(&mut buf)?;
    let routing_delegate = get_optional_string(&mut buf)?;

    if buf.remaining() < 4 {
        return Err(Error::new(Kind::Internal, "envelope truncated reading header count"));
    }
    let header_count = buf.get_u32();
    let mut headers = Headers::new();
    for _ in 0..header_count {
        let key = get_string(&mut buf)?;
        let value = get_string(&mut buf)?;
        headers.insert(key, value);
    }

    let body = get_lp(&mut buf)?;

    let mut builder = Request::builder()
        .caller(caller)
        .service(service)
        .transport(transport)
        .encoding(encoding)
        .procedure(procedure)
        .headers(headers)
        .body(Body::from_bytes(body));
    if let Some(v) = shard_key {
        builder = builder.shard_key(v);
    }
    if let Some(v) = routing_key {
        builder = builder.routing_key(v);
    }
    if let Some(v) = routing_delegate {
        builder = builder.routing_delegate(v);
    }

    Ok((span_context, builder.build()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> Request {
        Request::builder()
            .caller("caller")
            .service("svc")
            .transport("queue")
            .encoding("raw")
            .procedure("proc")
            .shard_key("shard-1")
            .headers(Headers::new().with("x-foo", "bar"))
            .body(Body::from_bytes(bytes::Bytes::from_static(b"payload")))
            .build()
    }

    #[tokio::test]
    async fn round_trips_a_request_with_a_span_context() {
        let mut original = req();
        let bytes = to_bytes(Some(vec![1, 2, 3]), &mut original).await.unwrap();

        let (span_context, mut decoded) = from_bytes(&bytes).unwrap();
        assert_eq!(span_context, Some(vec![1, 2, 3]));
        assert_eq!(decoded.caller, "caller");
        assert_eq!(decoded.shard_key.as_deref(), Some("shard-1"));
        assert_eq!(decoded.headers.get("x-foo"), Some("bar"));
        assert_eq!(&decoded.body.read_to_end().await.unwrap()[..], b"payload");
    }

    #[tokio::test]
    async fn missing_span_context_round_trips_as_none() {
        let mut original = req();
        let bytes = to_bytes(None, &mut original).await.unwrap();

        let (span_context, _) = from_bytes(&bytes).unwrap();
        assert_eq!(span_context, None);
    }

    #[test]
    fn rejects_a_frame_with_an_unknown_version_byte() {
        let err = from_bytes(&[7, 0]).unwrap_err();
        assert_eq!(err.kind(), Kind::Internal);
    }

    #[test]
    fn rejects_a_frame_shorter_than_the_minimum() {
        let err = from_bytes(&[0]).unwrap_err();
        assert_eq!(err.kind(), Kind::Internal);
    }
}
