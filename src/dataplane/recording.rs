//! Dataplane implementation that records every hook invocation, used by the
//! test suites to observe what the reconcilers programmed.

use std::sync::Mutex;

use ipnetwork::Ipv4Network;

use super::Dataplane;
use crate::registry::{HostSubnet, Service};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookCall {
    StartMaster {
        cluster_network: Ipv4Network,
        host_subnet_bits: u32,
    },
    StartNode {
        mtu: u32,
    },
    SetupSdn {
        local_subnet: Ipv4Network,
    },
    AddHostSubnetRules {
        host: String,
        subnet: Ipv4Network,
    },
    DeleteHostSubnetRules {
        host: String,
    },
    AddServiceRules {
        uid: String,
        vnid: u32,
    },
    DeleteServiceRules {
        uid: String,
    },
    UpdatePod {
        namespace: String,
        name: String,
    },
}

#[derive(Default)]
pub struct RecordingDataplane {
    calls: Mutex<Vec<HookCall>>,
    fail_setup: Mutex<bool>,
}

impl RecordingDataplane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<HookCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&HookCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    /// Makes the next `setup_sdn` invocations fail, to exercise the node
    /// startup error path.
    pub fn fail_setup(&self, fail: bool) {
        *self.fail_setup.lock().unwrap() = fail;
    }

    fn record(&self, call: HookCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Dataplane for RecordingDataplane {
    fn start_master(&self, cluster_network: Ipv4Network, host_subnet_bits: u32) -> Result<()> {
        self.record(HookCall::StartMaster {
            cluster_network,
            host_subnet_bits,
        });
        Ok(())
    }

    fn start_node(&self, mtu: u32) -> Result<()> {
        self.record(HookCall::StartNode { mtu });
        Ok(())
    }

    fn setup_sdn(
        &self,
        local_subnet: Ipv4Network,
        _cluster_network: Ipv4Network,
        _service_network: Ipv4Network,
        _mtu: u32,
    ) -> Result<bool> {
        if *self.fail_setup.lock().unwrap() {
            return Err(Error::Dataplane("setup_sdn failed".into()));
        }
        self.record(HookCall::SetupSdn { local_subnet });
        Ok(true)
    }

    fn add_host_subnet_rules(&self, subnet: &HostSubnet) -> Result<()> {
        self.record(HookCall::AddHostSubnetRules {
            host: subnet.host.clone(),
            subnet: subnet.subnet,
        });
        Ok(())
    }

    fn delete_host_subnet_rules(&self, subnet: &HostSubnet) -> Result<()> {
        self.record(HookCall::DeleteHostSubnetRules {
            host: subnet.host.clone(),
        });
        Ok(())
    }

    fn add_service_rules(&self, service: &Service, vnid: u32) -> Result<()> {
        self.record(HookCall::AddServiceRules {
            uid: service.uid.clone(),
            vnid,
        });
        Ok(())
    }

    fn delete_service_rules(&self, service: &Service) -> Result<()> {
        self.record(HookCall::DeleteServiceRules {
            uid: service.uid.clone(),
        });
        Ok(())
    }

    fn update_pod(&self, namespace: &str, name: &str, _container_id: &str) -> Result<()> {
        self.record(HookCall::UpdatePod {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        });
        Ok(())
    }
}
