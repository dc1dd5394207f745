//! Data-path query parsing
//!
//! The object fast path parses its query string by hand — no generic
//! multimap, no allocation per known key, and any unknown key is fatal
//! (400): a typo on the data path must never be silently ignored.

use shoal_common::{Error, Provider, Result};
use std::str::FromStr;

#[derive(Debug, Default)]
pub struct Dpq {
    pub provider: Option<Provider>,
    pub namespace: String,
    /// Skip the version-change check on warm GET.
    pub skip_vc: bool,
    pub unix_time: Option<i64>,
    pub uuid: String,
    pub arch_path: String,
    pub arch_mime: String,
    pub arch_regx: String,
    pub arch_mode: String,
    pub is_gfn: bool,
    pub orig_url: String,
    pub append_type: String,
    pub append_handle: String,
    pub owt: String,
    pub flt_presence: Option<u8>,
    pub dont_add_remote: bool,
    pub binfo: String,
    pub etl_name: String,
    pub silent: bool,
    pub latest_ver: bool,
    /// Re-checksum the payload on this GET.
    pub validate_cksum: bool,
}

impl Dpq {
    /// Parse `k=v&k=v`; keys are data-path-known or the request dies.
    pub fn parse(query: &str) -> Result<Self> {
        let mut dpq = Self::default();
        if query.is_empty() {
            return Ok(dpq);
        }
        for pair in query.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = percent_decode(value)?;
            match key {
                "provider" => dpq.provider = Some(Provider::from_str(&value)?),
                "namespace" => dpq.namespace = value,
                "skip-vc" => dpq.skip_vc = parse_bool(&value)?,
                "unix-time" => {
                    dpq.unix_time = Some(value.parse().map_err(|_| {
                        Error::Fatal(format!("invalid unix-time {value:?}"))
                    })?);
                }
                "uuid" => dpq.uuid = value,
                "arch-path" => dpq.arch_path = value,
                "arch-mime" => dpq.arch_mime = value,
                "arch-regx" => dpq.arch_regx = value,
                "arch-mode" => dpq.arch_mode = value,
                "is-gfn" => dpq.is_gfn = parse_bool(&value)?,
                "orig-url" => dpq.orig_url = value,
                "append-type" => dpq.append_type = value,
                "append-handle" => dpq.append_handle = value,
                "owt" => dpq.owt = value,
                "flt-presence" => {
                    dpq.flt_presence = Some(value.parse().map_err(|_| {
                        Error::Fatal(format!("invalid flt-presence {value:?}"))
                    })?);
                }
                "dont-add-remote" => dpq.dont_add_remote = parse_bool(&value)?,
                "binfo" => dpq.binfo = value,
                "etl-name" => dpq.etl_name = value,
                "silent" => dpq.silent = parse_bool(&value)?,
                "latest-ver" => dpq.latest_ver = parse_bool(&value)?,
                "validate-cksum" => dpq.validate_cksum = parse_bool(&value)?,
                _ => {
                    return Err(Error::Fatal(format!(
                        "failed to fast-parse [{query}]: unknown key {key:?}"
                    )));
                }
            }
        }
        Ok(dpq)
    }

    #[must_use]
    pub fn provider_or(&self, dflt: Provider) -> Provider {
        self.provider.unwrap_or(dflt)
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v {
        "" | "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::Fatal(format!("invalid boolean {v:?}"))),
    }
}

fn percent_decode(v: &str) -> Result<String> {
    if !v.contains('%') && !v.contains('+') {
        return Ok(v.to_string());
    }
    let bytes = v.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = v
                    .get(i + 1..i + 3)
                    .ok_or_else(|| Error::Fatal(format!("bad escape in {v:?}")))?;
                let b = u8::from_str_radix(hex, 16)
                    .map_err(|_| Error::Fatal(format!("bad escape in {v:?}")))?;
                out.push(b);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| Error::Fatal(format!("bad utf-8 in {v:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_keys() {
        let dpq =
            Dpq::parse("provider=s3&skip-vc=true&uuid=abc&latest-ver=1&flt-presence=2").unwrap();
        assert_eq!(dpq.provider, Some(Provider::S3));
        assert!(dpq.skip_vc);
        assert!(dpq.latest_ver);
        assert_eq!(dpq.uuid, "abc");
        assert_eq!(dpq.flt_presence, Some(2));
        assert!(!dpq.silent);
    }

    #[test]
    fn test_unknown_key_is_fatal() {
        let err = Dpq::parse("provider=s3&watermelon=1").unwrap_err();
        assert!(err.to_string().contains("watermelon"));
        assert_eq!(err.http_status(), 500); // mapped to 400 by the handler
    }

    #[test]
    fn test_empty_and_decoding() {
        assert!(Dpq::parse("").unwrap().provider.is_none());
        let dpq = Dpq::parse("orig-url=http%3A%2F%2Fx%2Fy+z").unwrap();
        assert_eq!(dpq.orig_url, "http://x/y z");
    }

    #[test]
    fn test_bad_values() {
        assert!(Dpq::parse("provider=floppy").is_err());
        assert!(Dpq::parse("skip-vc=perhaps").is_err());
        assert!(Dpq::parse("unix-time=yesterday").is_err());
    }
}
