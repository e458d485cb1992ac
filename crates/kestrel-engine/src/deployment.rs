//! Submitting templates to the cloud

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde_json::Value;
use tracing::info;

use kestrel_cloud::{CloudClient, DeploymentResult};
use kestrel_common::{Result, ResultExt};
use kestrel_template::{Parameters, Template};

fn random31() -> u32 {
    rand::thread_rng().gen_range(0..=i32::MAX as u32)
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// `{resourceGroup}-{random}` so repeated runs do not collide
pub fn deployment_name(resource_group: &str) -> String {
    format!("{}-{}", resource_group, random31())
}

/// `k8s-upgrade-{role}-{index}-{timestamp}-{random}`
pub fn upgrade_deployment_name(role: &str, index: usize) -> String {
    format!(
        "k8s-upgrade-{}-{}-{}-{}",
        role,
        index,
        unix_seconds(),
        random31()
    )
}

/// Hex Unix time appended to DNS prefixes by `--auto-suffix`
pub fn auto_suffix() -> String {
    format!("{:x}", unix_seconds())
}

/// Deploy `template` with `parameters` under `name`
pub async fn submit(
    cloud: &dyn CloudClient,
    resource_group: &str,
    name: &str,
    template: &Template,
    parameters: &Parameters,
) -> Result<DeploymentResult> {
    let template = template.to_value()?;
    let parameters = Value::Object(parameters.as_map().clone());
    info!(deployment = %name, resource_group = %resource_group, "Starting deployment");
    let result = cloud
        .deploy_template(resource_group, name, &template, &parameters)
        .await
        .with_context(|| format!("deployment {}", name))?;
    info!(
        deployment = %name,
        state = %result.provisioning_state,
        "Deployment finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn names_have_the_expected_shape() {
        let plain = Regex::new(r"^my-rg-[0-9]+$").expect("regex");
        assert!(plain.is_match(&deployment_name("my-rg")));

        let upgrade = Regex::new(r"^k8s-upgrade-master-2-[0-9]+-[0-9]+$").expect("regex");
        assert!(upgrade.is_match(&upgrade_deployment_name("master", 2)));
    }

    #[test]
    fn auto_suffix_is_hex() {
        let suffix = auto_suffix();
        assert!(!suffix.is_empty());
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
