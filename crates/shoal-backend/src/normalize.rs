//! Provider error normalization
//!
//! Native failures collapse into the shared taxonomy; 429/503 are marked
//! transient so the rate-limit layer can adapt.

use shoal_common::{Bck, Error};

/// Scope of a failed backend call (what a 404 means).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Bucket,
    Object,
}

pub fn normalize(status: u16, scope: Scope, bck: &Bck, name: &str, body: &str) -> Error {
    let what = || match scope {
        Scope::Bucket => bck.to_string(),
        Scope::Object => bck.cname(name),
    };
    match status {
        404 => match scope {
            Scope::Bucket => Error::BckNotFound(bck.clone()),
            Scope::Object => Error::ObjNotFound(bck.cname(name)),
        },
        401 | 403 => Error::AuthFailed(what()),
        409 => Error::AlreadyExists(what()),
        416 => Error::RangeNotSatisfiable(what()),
        429 => Error::RateLimited(what()),
        502 | 503 | 504 => Error::Unavailable(format!("{}: http {status}", what())),
        _ => Error::Fatal(format!("{}: http {status}: {}", what(), truncate(body))),
    }
}

pub fn transport_err(e: &reqwest::Error, bck: &Bck, name: &str) -> Error {
    let what = if name.is_empty() {
        bck.to_string()
    } else {
        bck.cname(name)
    };
    if e.is_timeout() || e.is_connect() {
        Error::Unavailable(format!("{what}: {e}"))
    } else {
        Error::Fatal(format!("{what}: {e}"))
    }
}

/// First 256 bytes, backed off to a character boundary (response bodies
/// are arbitrary and may split a multi-byte character at the cut).
fn truncate(s: &str) -> &str {
    if s.len() <= 256 {
        return s;
    }
    let mut end = 256;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
