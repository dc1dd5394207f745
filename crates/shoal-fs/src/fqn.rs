//! FQN generation and reverse parsing
//!
//! `<mpath>/<ct>/<provider>/@<ns>/<bucket>/<object-path>` — every absolute
//! path on a mountpath encodes where it belongs.

use crate::content::ContentType;
use crate::mountpath::{Mountpath, MountpathRegistry};
use shoal_common::{Bck, Error, Provider, Result};
use std::path::Path;
use std::sync::Arc;

/// The parts encoded in an FQN. `obj_name` is the bucket-relative path
/// with the ubase still encoded (use [`ContentType::parse_ubase`] on the
/// final segment to recover extras).
#[derive(Clone, Debug)]
pub struct ParsedFqn {
    pub mpath: Arc<Mountpath>,
    pub ct: ContentType,
    pub bck: Bck,
    pub obj_name: String,
}

impl ParsedFqn {
    /// Final path segment (the encoded ubase).
    #[must_use]
    pub fn ubase(&self) -> &str {
        self.obj_name
            .rsplit_once('/')
            .map_or(self.obj_name.as_str(), |(_, b)| b)
    }

    /// Bucket-relative object path with the ubase decoded to its base.
    #[must_use]
    pub fn base_name(&self) -> String {
        let info = self.ct.parse_ubase(self.ubase());
        match self.obj_name.rsplit_once('/') {
            Some((dir, _)) => format!("{dir}/{}", info.base),
            None => info.base,
        }
    }
}

/// Parse an absolute path back into its parts, validating the mountpath.
pub fn resolve_fqn(reg: &MountpathRegistry, fqn: &Path) -> Result<ParsedFqn> {
    let mpath = reg.resolve(fqn)?;
    let rel = fqn
        .strip_prefix(&mpath.path)
        .map_err(|_| Error::Fatal(format!("fqn {} escapes {}", fqn.display(), mpath)))?;
    let rel = rel.to_str().ok_or_else(|| {
        Error::Fatal(format!("fqn {} is not valid utf-8", fqn.display()))
    })?;

    let bad = || Error::Fatal(format!("failed to parse fqn {fqn:?}"));
    let mut it = rel.splitn(4, '/');
    let (Some(ct_s), Some(prov_s), Some(ns_s), Some(rest)) =
        (it.next(), it.next(), it.next(), it.next())
    else {
        return Err(bad());
    };
    let ct: ContentType = ct_s.parse()?;
    let provider: Provider = prov_s.parse()?;
    let ns = ns_s.strip_prefix('@').ok_or_else(bad)?;
    let (bck_name, obj_name) = rest.split_once('/').ok_or_else(bad)?;
    if obj_name.is_empty() {
        return Err(bad());
    }
    Ok(ParsedFqn {
        mpath,
        ct,
        bck: Bck {
            provider,
            ns: ns.to_string(),
            name: bck_name.to_string(),
        },
        obj_name: obj_name.to_string(),
    })
}
