//! VNID constants and namespace annotation accessors for multitenant
//! isolation.

use crate::registry::Namespace;
use crate::{Error, Result};

/// Maximum VXLAN Virtual Network Identifier (VNID) as per RFC 7348.
pub const MAX_VNID: u32 = (1 << 24) - 1;
/// VNIDs 1 to 9 are internally reserved for special cases in the future.
pub const MIN_VNID: u32 = 10;
/// Reserved for global namespaces, which can reach any network in the
/// cluster.
pub const GLOBAL_VNID: u32 = 0;

/// Currently assigned VNID for the namespace.
pub const VNID_ANNOTATION: &str = "pod.network.openshift.io/multitenant.vnid";
/// Desired VNID for the namespace, written by an administrator and consumed
/// by the VNID reconciler.
pub const REQUESTED_VNID_ANNOTATION: &str = "pod.network.openshift.io/multitenant.requested-vnid";

pub fn validate_vnid(vnid: u32) -> Result<()> {
    if vnid == GLOBAL_VNID {
        return Ok(());
    }
    if vnid < MIN_VNID {
        return Err(Error::InvalidVnid(format!(
            "vnid must be greater than or equal to {MIN_VNID}"
        )));
    }
    if vnid > MAX_VNID {
        return Err(Error::InvalidVnid(format!(
            "vnid must be less than or equal to {MAX_VNID}"
        )));
    }
    Ok(())
}

/// Assigned VNID carried by the namespace, `None` when the annotation is
/// absent.
pub fn vnid(ns: &Namespace) -> Result<Option<u32>> {
    annotation(ns, VNID_ANNOTATION)
}

pub fn set_vnid(ns: &mut Namespace, id: u32) -> Result<()> {
    set_annotation(ns, VNID_ANNOTATION, id)
}

pub fn clear_vnid(ns: &mut Namespace) {
    ns.annotations.remove(VNID_ANNOTATION);
}

/// Administrator-requested VNID, `None` when the annotation is absent.
pub fn requested_vnid(ns: &Namespace) -> Result<Option<u32>> {
    annotation(ns, REQUESTED_VNID_ANNOTATION)
}

pub fn set_requested_vnid(ns: &mut Namespace, id: u32) -> Result<()> {
    set_annotation(ns, REQUESTED_VNID_ANNOTATION, id)
}

pub fn clear_requested_vnid(ns: &mut Namespace) {
    ns.annotations.remove(REQUESTED_VNID_ANNOTATION);
}

fn annotation(ns: &Namespace, key: &str) -> Result<Option<u32>> {
    let Some(value) = ns.annotations.get(key) else {
        return Ok(None);
    };
    let id: u32 = value
        .parse()
        .map_err(|_| Error::InvalidVnid(format!("malformed {key} annotation: {value:?}")))?;
    validate_vnid(id)?;
    Ok(Some(id))
}

fn set_annotation(ns: &mut Namespace, key: &str, id: u32) -> Result<()> {
    validate_vnid(id)?;
    ns.annotations.insert(key.to_owned(), id.to_string());
    Ok(())
}
