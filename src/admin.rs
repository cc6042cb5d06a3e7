//! Administrative operations on tenant networks. These write only the
//! requested-VNID annotation; the VNID reconciler consumes it and performs
//! the actual assignment.

use tracing::info;

use crate::registry::{Namespace, Registry, Stored};
use crate::{Error, Result, netid};

const UPDATE_RETRIES: usize = 2;

/// Targets namespaces either by explicit name or by an equality label
/// selector (`key=value[,key2=value2]`). Exactly one of the two must be
/// given.
#[derive(Clone, Debug, Default)]
pub struct ProjectOptions {
    pub names: Vec<String>,
    pub selector: Option<String>,
}

impl ProjectOptions {
    pub fn for_projects(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            selector: None,
        }
    }

    pub fn for_selector(selector: impl Into<String>) -> Self {
        Self {
            names: Vec::new(),
            selector: Some(selector.into()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.selector, self.names.is_empty()) {
            (Some(_), false) => Err(Error::InvalidSelection(
                "either specify a selector or projects but not both".into(),
            )),
            (None, true) => Err(Error::InvalidSelection(
                "must provide a selector or projects".into(),
            )),
            (Some(selector), true) => {
                parse_selector(selector)?;
                Ok(())
            }
            (None, false) => Ok(()),
        }
    }

    /// The targeted namespaces. Explicit names must all exist; a selector
    /// may match nothing.
    pub fn namespaces(&self, registry: &Registry) -> Result<Vec<Stored<Namespace>>> {
        self.validate()?;
        if !self.names.is_empty() {
            return self
                .names
                .iter()
                .map(|name| registry.namespaces().get(name))
                .collect();
        }
        let selector = self.selector.as_deref().unwrap_or_default();
        let terms = parse_selector(selector)?;
        Ok(registry
            .namespaces()
            .list()
            .into_iter()
            .filter(|stored| {
                terms.iter().all(|(key, value)| {
                    stored.record.labels.get(key).map(String::as_str) == Some(value.as_str())
                })
            })
            .collect())
    }
}

fn parse_selector(selector: &str) -> Result<Vec<(String, String)>> {
    selector
        .split(',')
        .map(|term| {
            term.split_once('=')
                .map(|(key, value)| (key.trim().to_owned(), value.trim().to_owned()))
                .filter(|(key, value)| !key.is_empty() && !value.is_empty())
                .ok_or_else(|| {
                    Error::InvalidSelection(format!("invalid label selector term {term:?}"))
                })
        })
        .collect()
}

/// Requests a specific VNID for the targeted namespaces. The value must be
/// the global VNID or one that is already in use; the reconciler enforces
/// that when it consumes the annotation.
pub fn request_vnid(registry: &Registry, options: &ProjectOptions, vnid: u32) -> Result<()> {
    netid::validate_vnid(vnid)?;
    for stored in options.namespaces(registry)? {
        let name = stored.record.name.clone();
        annotate_with_retry(registry, stored, vnid)?;
        info!("requested vnid {vnid} for namespace {name:?}");
    }
    Ok(())
}

/// Makes the targeted namespaces global: they reach and are reachable from
/// all tenants.
pub fn make_global(registry: &Registry, options: &ProjectOptions) -> Result<()> {
    request_vnid(registry, options, netid::GLOBAL_VNID)
}

fn annotate_with_retry(registry: &Registry, stored: Stored<Namespace>, vnid: u32) -> Result<()> {
    let name = stored.record.name.clone();
    let mut stored = stored;
    for _ in 0..=UPDATE_RETRIES {
        let mut ns = stored.record.clone();
        netid::set_requested_vnid(&mut ns, vnid)?;
        match registry.namespaces().update(stored.revision, ns) {
            Ok(_) => return Ok(()),
            Err(e) if e.is_conflict() => {
                stored = registry.namespaces().get(&name)?;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Reconcile(format!(
        "unable to annotate namespace {name:?} after {UPDATE_RETRIES} retries"
    )))
}
