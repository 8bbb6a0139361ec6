use anyhow::Result;

use crate::ProviderDescriptor;

/// Default namespace prefix, keeps lab namespaces apart from anything else
/// on the host.
pub const DEFAULT_NETNS_PREFIX: &str = "rl-";

/// Map a user-visible provider name to the descriptor used by the builder.
pub fn provider_by_name(name: &str) -> Result<ProviderDescriptor> {
    match name {
        "emulated" => Ok(ProviderDescriptor::Emulated),
        "netns" => Ok(ProviderDescriptor::Netns {
            prefix: DEFAULT_NETNS_PREFIX.to_string(),
        }),
        other => anyhow::bail!("Unknown provider '{other}'. Try 'emulated' or 'netns'."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_names() {
        assert!(matches!(
            provider_by_name("emulated").unwrap(),
            ProviderDescriptor::Emulated
        ));
        assert!(matches!(
            provider_by_name("netns").unwrap(),
            ProviderDescriptor::Netns { prefix } if prefix == "rl-"
        ));
        assert!(provider_by_name("mininet").is_err());
    }
}
