use std::borrow::Cow;
use std::sync::{LazyLock, RwLock};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use crate::Error;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("tenant_sdn")));

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControllerLabels {
    pub resource: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub resource: String,
    pub error: String,
}

#[derive(Clone)]
pub struct ControllerMetrics {
    runs: Family<ControllerLabels, Counter>,
    failures: Family<ErrorLabels, Counter>,
}

impl ControllerMetrics {
    pub fn new(controller_name: &str) -> Self {
        let mut guard = REGISTRY.write().unwrap();
        let registry = guard.sub_registry_with_label((
            Cow::Borrowed("controller_name"),
            Cow::Owned(controller_name.into()),
        ));
        let runs = Family::<ControllerLabels, Counter>::default();
        let failures = Family::<ErrorLabels, Counter>::default();
        registry.register("reconcile_runs", "Number of reconciliations", runs.clone());
        registry.register(
            "reconcile_failures",
            "Number of reconciliation errors",
            failures.clone(),
        );
        Self { runs, failures }
    }

    pub fn count_run(&self, resource: &str) {
        self.runs
            .get_or_create(&ControllerLabels {
                resource: resource.to_owned(),
            })
            .inc();
    }

    pub fn count_failure(&self, resource: &str, error: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                resource: resource.to_owned(),
                error: error.metric_label().to_owned(),
            })
            .inc();
    }
}
