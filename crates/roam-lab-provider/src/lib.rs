pub mod emulated;
#[cfg(feature = "netns")]
pub mod netns;
pub mod spec;

use anyhow::{Context, Result};
use std::sync::Arc;

use roam_lab_abstract::{TopologyProvider, TopologySpec};
use tracing::info;

pub use emulated::EmulatedTopology;

/// Describes which network backend hosts the topology.
#[derive(Clone, Debug)]
pub enum ProviderDescriptor {
    /// In-process emulation, no privileges needed.
    Emulated,
    /// Linux network namespaces named `<prefix><node>`.
    Netns { prefix: String },
}

/// Builder for a topology provider. The topology is fixed once built and
/// reused by every run of the batch.
#[derive(Default)]
pub struct ProviderBuilder {
    topology: Option<TopologySpec>,
}

impl ProviderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topology(mut self, spec: TopologySpec) -> Self {
        self.topology = Some(spec);
        self
    }

    pub fn build(self, descriptor: ProviderDescriptor) -> Result<Arc<dyn TopologyProvider>> {
        let spec = self
            .topology
            .context("no topology configured; call ProviderBuilder::topology first")?;
        info!(
            "Building {:?} topology with {} nodes and {} links",
            descriptor,
            spec.nodes().len(),
            spec.links().len()
        );
        match descriptor {
            ProviderDescriptor::Emulated => Ok(Arc::new(EmulatedTopology::new(spec))),
            ProviderDescriptor::Netns { prefix } => build_netns(spec, &prefix),
        }
    }
}

#[cfg(feature = "netns")]
fn build_netns(spec: TopologySpec, prefix: &str) -> Result<Arc<dyn TopologyProvider>> {
    Ok(Arc::new(netns::NetnsTopology::build(spec, prefix)?))
}

#[cfg(not(feature = "netns"))]
fn build_netns(_spec: TopologySpec, _prefix: &str) -> Result<Arc<dyn TopologyProvider>> {
    anyhow::bail!("netns support disabled at compile time");
}

#[cfg(test)]
mod tests {
    use super::*;
    use roam_lab_abstract::TopologyConfig;

    #[test]
    fn test_builder_requires_topology() {
        assert!(ProviderBuilder::new().build(ProviderDescriptor::Emulated).is_err());

        let spec = TopologySpec::platoons(&TopologyConfig::default()).unwrap();
        let provider = ProviderBuilder::new()
            .topology(spec)
            .build(ProviderDescriptor::Emulated)
            .unwrap();
        assert!(provider.resolve("unit_3_4").is_some());
        assert!(provider.resolve("unit_4_0").is_none());
    }
}
