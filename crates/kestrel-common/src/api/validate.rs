//! API model validation
//!
//! Rules run in a fixed order and the first failure is returned, so the same
//! model always produces the same error. Field paths use the model's JSON
//! names, e.g. `properties.agentPoolProfiles[1].count`.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::types::*;
use crate::versions::VersionPolicy;
use crate::{Error, Result};

/// Largest OS or data disk accepted, in GB
pub const MAX_DISK_SIZE_GB: i32 = 1023;

/// Most data disks a pool may attach
pub const MAX_DATA_DISKS: usize = 4;

/// Largest pool size
pub const MAX_AGENT_COUNT: i32 = 100;

static POOL_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9]{0,11}$").ok());

static DNS_PREFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]{1,43}[A-Za-z0-9]$").ok());

fn matches(re: &LazyLock<Option<Regex>>, value: &str) -> bool {
    re.as_ref().map(|r| r.is_match(value)).unwrap_or(false)
}

/// Validate a DNS prefix
pub fn validate_dns_prefix(field: &str, prefix: &str) -> Result<()> {
    if matches(&DNS_PREFIX, prefix) {
        Ok(())
    } else {
        Err(Error::model_invalid(
            field,
            format!(
                "DNSPrefix '{}' is invalid. The DNSPrefix must contain between 3 and 45 characters and can contain only letters, numbers, and hyphens. It must start with a letter and must end with a letter or a number",
                prefix
            ),
        ))
    }
}

/// Validate a single pool's own fields
pub fn validate_agent_pool(
    field: &str,
    pool: &AgentPoolProfile,
    is_update: bool,
) -> Result<()> {
    if !matches(&POOL_NAME, &pool.name) {
        return Err(Error::model_invalid(
            format!("{}.name", field),
            format!(
                "pool name '{}' must start with a lowercase letter, contain only lowercase letters and numbers, and be at most 12 characters",
                pool.name
            ),
        ));
    }

    let min_count = if is_update { 0 } else { 1 };
    if pool.count < min_count || pool.count > MAX_AGENT_COUNT {
        return Err(Error::model_invalid(
            format!("{}.count", field),
            format!(
                "count must be between {} and {}, got {}",
                min_count, MAX_AGENT_COUNT, pool.count
            ),
        ));
    }

    if pool.vm_size.is_empty() {
        return Err(Error::model_invalid(format!("{}.vmSize", field), "is required"));
    }

    validate_disk_size(&format!("{}.osDiskSizeGB", field), pool.os_disk_size_gb)?;

    if pool.disk_sizes_gb.len() > MAX_DATA_DISKS {
        return Err(Error::model_invalid(
            format!("{}.diskSizesGB", field),
            format!("at most {} data disks are allowed", MAX_DATA_DISKS),
        ));
    }
    for (i, size) in pool.disk_sizes_gb.iter().enumerate() {
        validate_disk_size(&format!("{}.diskSizesGB[{}]", field, i), Some(*size))?;
    }

    if pool.storage_profile == Some(StorageProfile::StorageAccount) && !pool.disk_sizes_gb.is_empty()
        && pool.is_virtual_machine_scale_sets()
    {
        return Err(Error::model_invalid(
            format!("{}.storageProfile", field),
            "VirtualMachineScaleSets does not support storage account attached disks",
        ));
    }
    Ok(())
}

fn validate_disk_size(field: &str, size: Option<i32>) -> Result<()> {
    match size {
        Some(s) if !(1..=MAX_DISK_SIZE_GB).contains(&s) => Err(Error::model_invalid(
            field,
            format!("disk size must be between 1 and {} GB, got {}", MAX_DISK_SIZE_GB, s),
        )),
        _ => Ok(()),
    }
}

/// All pools must share one availability mode
pub fn validate_availability_consistency(pools: &[AgentPoolProfile]) -> Result<()> {
    let modes: HashSet<Option<AvailabilityProfile>> =
        pools.iter().map(|p| p.availability_profile).collect();
    if modes.len() > 1 {
        return Err(Error::model_invalid(
            "properties.agentPoolProfiles",
            "mixed mode availability profiles are not allowed. Please set either VirtualMachineScaleSets or AvailabilitySet in availabilityProfile for all agent pools",
        ));
    }
    Ok(())
}

/// Validate the whole model
pub fn validate(cs: &ContainerService, is_update: bool, policy: &VersionPolicy) -> Result<()> {
    let props = &cs.properties;

    let orchestrator = props.orchestrator_profile.as_ref().ok_or_else(|| {
        Error::model_invalid("properties.orchestratorProfile", "is required")
    })?;
    if !orchestrator.orchestrator_type.eq_ignore_ascii_case(KUBERNETES) {
        return Err(Error::model_invalid(
            "properties.orchestratorProfile.orchestratorType",
            format!(
                "orchestrator '{}' is not supported",
                orchestrator.orchestrator_type
            ),
        ));
    }
    let version = orchestrator.orchestrator_version.trim_start_matches('v');
    if !version.is_empty()
        && !policy.is_supported(version, is_update, props.has_windows(), props.is_azure_stack())
    {
        return Err(Error::unsupported_version(format!(
            "OrchestratorProfile is not able to be rationalized, check supported Release or Version: {}",
            orchestrator.orchestrator_version
        )));
    }

    match (&props.master_profile, &props.hosted_master_profile) {
        (None, None) => {
            return Err(Error::model_invalid(
                "properties.masterProfile",
                "masterProfile or hostedMasterProfile is required",
            ))
        }
        (Some(master), _) => validate_master(master)?,
        (None, Some(hosted)) => {
            if !hosted.dns_prefix.is_empty() {
                validate_dns_prefix("properties.hostedMasterProfile.dnsPrefix", &hosted.dns_prefix)?;
            }
        }
    }

    if props.agent_pool_profiles.is_empty() && !is_update {
        return Err(Error::model_invalid(
            "properties.agentPoolProfiles",
            "at least one agent pool is required",
        ));
    }
    let mut names = HashSet::new();
    for (i, pool) in props.agent_pool_profiles.iter().enumerate() {
        let field = format!("properties.agentPoolProfiles[{}]", i);
        validate_agent_pool(&field, pool, is_update)?;
        if !names.insert(pool.name.to_lowercase()) {
            return Err(Error::model_invalid(
                format!("{}.name", field),
                format!(
                    "duplicate name '{}' found in agent pool profiles; names must be unique",
                    pool.name
                ),
            ));
        }
    }
    validate_availability_consistency(&props.agent_pool_profiles)?;

    if let Some(linux) = &props.linux_profile {
        if linux.admin_username.is_empty() {
            return Err(Error::model_invalid(
                "properties.linuxProfile.adminUsername",
                "is required",
            ));
        }
        for (i, key) in linux.ssh.public_keys.iter().enumerate() {
            if key.key_data.trim().is_empty() {
                return Err(Error::model_invalid(
                    format!("properties.linuxProfile.ssh.publicKeys[{}].keyData", i),
                    "must not be empty",
                ));
            }
        }
    }

    if props.has_windows() {
        let windows = props.windows_profile.as_ref().ok_or_else(|| {
            Error::model_invalid(
                "properties.windowsProfile",
                "is required when a pool has osType Windows",
            )
        })?;
        if windows.admin_username.is_empty() {
            return Err(Error::model_invalid(
                "properties.windowsProfile.adminUsername",
                "is required",
            ));
        }
        if windows.admin_password.is_empty() {
            return Err(Error::model_invalid(
                "properties.windowsProfile.adminPassword",
                "is required",
            ));
        }
    }

    validate_identity(props)?;

    if let Some(certs) = &props.certificate_profile {
        if certs.ca_certificate.is_empty() != certs.ca_private_key.is_empty() {
            return Err(Error::model_invalid(
                "properties.certificateProfile",
                "caCertificate and caPrivateKey must be specified together",
            ));
        }
    }

    Ok(())
}

fn validate_master(master: &MasterProfile) -> Result<()> {
    if ![1, 3, 5].contains(&master.count) {
        return Err(Error::model_invalid(
            "properties.masterProfile.count",
            format!("count must be 1, 3, or 5, got {}", master.count),
        ));
    }
    validate_dns_prefix("properties.masterProfile.dnsPrefix", &master.dns_prefix)?;
    if master.vm_size.is_empty() {
        return Err(Error::model_invalid("properties.masterProfile.vmSize", "is required"));
    }
    validate_disk_size("properties.masterProfile.osDiskSizeGB", master.os_disk_size_gb)
}

fn validate_identity(props: &Properties) -> Result<()> {
    let sp = props.service_principal_profile.as_ref();
    if props.uses_managed_identity() {
        if sp.map(|sp| !sp.client_id.is_empty()).unwrap_or(false) {
            return Err(Error::model_invalid(
                "properties.servicePrincipalProfile",
                "servicePrincipalProfile must not be set when useManagedIdentity is true",
            ));
        }
        return Ok(());
    }
    if let Some(sp) = sp {
        if sp.client_id.is_empty() {
            return Err(Error::model_invalid(
                "properties.servicePrincipalProfile.clientId",
                "is required when useManagedIdentity is false",
            ));
        }
        if sp.secret.is_empty() && sp.keyvault_secret_ref.is_none() {
            return Err(Error::model_invalid(
                "properties.servicePrincipalProfile.secret",
                "secret or keyvaultSecretRef is required when useManagedIdentity is false",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn valid() -> ContainerService {
        ContainerService {
            properties: Properties {
                orchestrator_profile: Some(OrchestratorProfile {
                    orchestrator_type: KUBERNETES.to_string(),
                    orchestrator_version: "1.24.8".to_string(),
                    ..Default::default()
                }),
                master_profile: Some(MasterProfile {
                    count: 3,
                    dns_prefix: "mycluster".to_string(),
                    vm_size: "Standard_D2_v3".to_string(),
                    ..Default::default()
                }),
                agent_pool_profiles: vec![
                    AgentPoolProfile {
                        name: "agentpool1".to_string(),
                        count: 3,
                        vm_size: "Standard_D2_v3".to_string(),
                        availability_profile: Some(AvailabilityProfile::AvailabilitySet),
                        ..Default::default()
                    },
                    AgentPoolProfile {
                        name: "agentpool2".to_string(),
                        count: 1,
                        vm_size: "Standard_D2_v3".to_string(),
                        availability_profile: Some(AvailabilityProfile::AvailabilitySet),
                        ..Default::default()
                    },
                ],
                linux_profile: Some(LinuxProfile {
                    admin_username: "azureuser".to_string(),
                    ..Default::default()
                }),
                service_principal_profile: Some(ServicePrincipalProfile {
                    client_id: "id".to_string(),
                    secret: "secret".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn field_of(err: &Error) -> String {
        match err.root() {
            Error::ModelInvalid { field, .. } => field.clone(),
            other => panic!("expected ModelInvalid, got {:?}", other),
        }
    }

    #[test]
    fn valid_model_passes() {
        validate(&valid(), false, &VersionPolicy::builtin()).expect("valid model");
    }

    #[test]
    fn master_count_must_be_odd_and_small() {
        let mut cs = valid();
        cs.properties.master_profile.as_mut().expect("master").count = 2;
        let err = validate(&cs, false, &VersionPolicy::builtin()).expect_err("bad count");
        assert_eq!(field_of(&err), "properties.masterProfile.count");
    }

    #[test]
    fn pool_count_bounds_depend_on_mode() {
        let mut cs = valid();
        cs.properties.agent_pool_profiles[1].count = 0;
        let err = validate(&cs, false, &VersionPolicy::builtin()).expect_err("zero on create");
        assert_eq!(field_of(&err), "properties.agentPoolProfiles[1].count");
        validate(&cs, true, &VersionPolicy::builtin()).expect("zero allowed on update");

        cs.properties.agent_pool_profiles[1].count = 101;
        assert!(validate(&cs, true, &VersionPolicy::builtin()).is_err());
    }

    #[test]
    fn pool_names_are_unique_ignoring_case() {
        let mut cs = valid();
        cs.properties.agent_pool_profiles[1].name = "agentpool1".to_string();
        let err = validate(&cs, false, &VersionPolicy::builtin()).expect_err("duplicate");
        assert_eq!(field_of(&err), "properties.agentPoolProfiles[1].name");
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn pool_name_format() {
        let mut cs = valid();
        cs.properties.agent_pool_profiles[0].name = "Pool-1".to_string();
        let err = validate(&cs, false, &VersionPolicy::builtin()).expect_err("bad name");
        assert_eq!(field_of(&err), "properties.agentPoolProfiles[0].name");
    }

    #[test]
    fn mixed_availability_is_rejected() {
        let mut cs = valid();
        cs.properties.agent_pool_profiles[1].availability_profile =
            Some(AvailabilityProfile::VirtualMachineScaleSets);
        let err = validate(&cs, false, &VersionPolicy::builtin()).expect_err("mixed");
        assert!(err.to_string().contains("mixed mode availability profiles are not allowed"));
    }

    #[test]
    fn disks_are_bounded() {
        let mut cs = valid();
        cs.properties.agent_pool_profiles[0].disk_sizes_gb = vec![128; 5];
        let err = validate(&cs, false, &VersionPolicy::builtin()).expect_err("too many");
        assert_eq!(field_of(&err), "properties.agentPoolProfiles[0].diskSizesGB");

        cs.properties.agent_pool_profiles[0].disk_sizes_gb = vec![128, 2048];
        let err = validate(&cs, false, &VersionPolicy::builtin()).expect_err("too big");
        assert_eq!(field_of(&err), "properties.agentPoolProfiles[0].diskSizesGB[1]");

        let mut cs = valid();
        cs.properties.master_profile.as_mut().expect("master").os_disk_size_gb = Some(0);
        let err = validate(&cs, false, &VersionPolicy::builtin()).expect_err("zero disk");
        assert_eq!(field_of(&err), "properties.masterProfile.osDiskSizeGB");
    }

    #[test]
    fn service_principal_needs_secret_unless_managed_identity() {
        let mut cs = valid();
        cs.properties
            .service_principal_profile
            .as_mut()
            .expect("sp")
            .secret
            .clear();
        let err = validate(&cs, false, &VersionPolicy::builtin()).expect_err("no secret");
        assert_eq!(field_of(&err), "properties.servicePrincipalProfile.secret");

        cs.properties.service_principal_profile = None;
        cs.properties.kubernetes_config_mut().use_managed_identity = Some(true);
        validate(&cs, false, &VersionPolicy::builtin()).expect("managed identity");
    }

    #[test]
    fn ca_pair_must_be_complete() {
        let mut cs = valid();
        cs.properties.certificate_profile = Some(CertificateProfile {
            ca_certificate: "pem".to_string(),
            ..Default::default()
        });
        let err = validate(&cs, false, &VersionPolicy::builtin()).expect_err("half a CA");
        assert_eq!(field_of(&err), "properties.certificateProfile");
    }

    #[test]
    fn unsupported_version_has_its_own_kind() {
        let mut cs = valid();
        cs.properties
            .orchestrator_profile
            .as_mut()
            .expect("orchestrator")
            .orchestrator_version = "1.5.0".to_string();
        let err = validate(&cs, false, &VersionPolicy::builtin()).expect_err("old version");
        assert_eq!(err.kind(), ErrorKind::UnsupportedVersion);
    }

    #[test]
    fn dns_prefix_format() {
        assert!(validate_dns_prefix("f", "mycluster").is_ok());
        assert!(validate_dns_prefix("f", "my-cluster-1").is_ok());
        assert!(validate_dns_prefix("f", "1cluster").is_err());
        assert!(validate_dns_prefix("f", "ab").is_err());
        assert!(validate_dns_prefix("f", "cluster-").is_err());
    }
}
