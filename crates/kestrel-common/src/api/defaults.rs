//! Mode-aware defaulting of a loaded API model
//!
//! Defaulting only fills what is absent; explicit values are never replaced.
//! Certificate generation is decided here but performed by the engine, which
//! owns the PKI factory.

use tracing::debug;

use super::types::*;
use crate::cloud_env::set_custom_cloud_defaults;
use crate::versions::{KubernetesVersion, VersionPolicy};
use crate::{normalize_region, Error, Result, DEFAULT_ADMIN_USERNAME};

/// Which verb the model is being prepared for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultsMode {
    Create,
    Scale,
    Upgrade,
}

impl DefaultsMode {
    pub fn is_update(self) -> bool {
        !matches!(self, DefaultsMode::Create)
    }
}

/// What the engine must do about cluster certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateAction {
    /// Material is present (or a prior CA exists on an update)
    Keep,
    /// CA is present, derived certificates are missing
    DeriveFromCa,
    /// No CA: generate everything
    GenerateAll,
}

/// Result of defaulting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultsOutcome {
    pub certificates: CertificateAction,
}

/// Default the model in place
pub fn apply_defaults(
    cs: &mut ContainerService,
    mode: DefaultsMode,
    policy: &VersionPolicy,
) -> Result<DefaultsOutcome> {
    cs.location = normalize_region(&cs.location);
    let location = cs.location.clone();
    let props = &mut cs.properties;

    if let Some(profile) = props.custom_cloud_profile.as_mut() {
        set_custom_cloud_defaults(profile);
    }

    set_orchestrator_defaults(props, mode, policy)?;
    set_master_defaults(props, &location);
    set_agent_defaults(props);
    set_profile_defaults(props);

    let certificates = certificate_action(props, mode);
    debug!(?mode, ?certificates, "Applied API model defaults");
    Ok(DefaultsOutcome { certificates })
}

fn set_orchestrator_defaults(
    props: &mut Properties,
    mode: DefaultsMode,
    policy: &VersionPolicy,
) -> Result<()> {
    let has_windows = props.has_windows();
    let is_azure_stack = props.is_azure_stack();
    let profile = props
        .orchestrator_profile
        .get_or_insert_with(OrchestratorProfile::default);

    if profile.orchestrator_type.is_empty() || profile.orchestrator_type.eq_ignore_ascii_case(KUBERNETES) {
        profile.orchestrator_type = KUBERNETES.to_string();
    }

    let resolved = policy
        .rationalize(
            &profile.orchestrator_release,
            &profile.orchestrator_version,
            mode.is_update(),
            has_windows,
            is_azure_stack,
        )
        .ok_or_else(|| {
            Error::unsupported_version(format!(
                "the following user supplied OrchestratorProfile configuration is not supported: OrchestratorType: {}, OrchestratorRelease: {}, OrchestratorVersion: {}. Please use 'kestrel get-versions' to list supported versions",
                profile.orchestrator_type, profile.orchestrator_release, profile.orchestrator_version
            ))
        })?;
    profile.orchestrator_version = resolved;
    profile.orchestrator_release = KubernetesVersion::parse(&profile.orchestrator_version)
        .map(|v| v.release())
        .unwrap_or_default();

    let k8s = profile
        .kubernetes_config
        .get_or_insert_with(KubernetesConfig::default);
    if k8s.service_cidr.is_empty() {
        k8s.service_cidr = DEFAULT_SERVICE_CIDR.to_string();
    }
    if k8s.cluster_subnet.is_empty() {
        k8s.cluster_subnet = DEFAULT_CLUSTER_SUBNET.to_string();
    }
    if k8s.dns_service_ip.is_empty() {
        k8s.dns_service_ip = DEFAULT_DNS_SERVICE_IP.to_string();
    }
    if k8s.load_balancer_sku.is_empty() {
        k8s.load_balancer_sku = STANDARD_LOAD_BALANCER_SKU.to_string();
    } else if k8s.load_balancer_sku.eq_ignore_ascii_case(STANDARD_LOAD_BALANCER_SKU) {
        k8s.load_balancer_sku = STANDARD_LOAD_BALANCER_SKU.to_string();
    } else if k8s.load_balancer_sku.eq_ignore_ascii_case(BASIC_LOAD_BALANCER_SKU) {
        k8s.load_balancer_sku = BASIC_LOAD_BALANCER_SKU.to_string();
    }
    Ok(())
}

fn set_master_defaults(props: &mut Properties, location: &str) {
    let vm_dns_suffix = props
        .custom_cloud_profile
        .as_ref()
        .and_then(|c| c.environment.as_ref())
        .map(|e| e.resource_manager_vm_dns_suffix.clone())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "cloudapp.azure.com".to_string());

    let Some(master) = props.master_profile.as_mut() else {
        return;
    };
    if master.availability_profile.is_none() {
        master.availability_profile = Some(AvailabilityProfile::AvailabilitySet);
    }
    if master.storage_profile.is_none() {
        master.storage_profile = Some(StorageProfile::ManagedDisks);
    }
    if master.first_consecutive_static_ip.is_empty() {
        master.first_consecutive_static_ip = master.first_master_ip().to_string();
    }
    if master.fqdn.is_empty() && !location.is_empty() && !master.dns_prefix.is_empty() {
        master.fqdn = format!("{}.{}.{}", master.dns_prefix, location, vm_dns_suffix);
    }
}

fn set_agent_defaults(props: &mut Properties) {
    for pool in props.agent_pool_profiles.iter_mut() {
        if pool.os_type.is_none() {
            pool.os_type = Some(OsType::Linux);
        }
        if pool.availability_profile.is_none() {
            pool.availability_profile = Some(AvailabilityProfile::VirtualMachineScaleSets);
        }
        if pool.storage_profile.is_none() {
            pool.storage_profile = Some(StorageProfile::ManagedDisks);
        }
    }
}

fn set_profile_defaults(props: &mut Properties) {
    if let Some(linux) = props.linux_profile.as_mut() {
        if linux.admin_username.is_empty() {
            linux.admin_username = DEFAULT_ADMIN_USERNAME.to_string();
        }
    }
    if let Some(windows) = props.windows_profile.as_mut() {
        if windows.admin_username.is_empty() {
            windows.admin_username = DEFAULT_ADMIN_USERNAME.to_string();
        }
    }
    // a managed identity replaces an unset service principal
    if props.uses_managed_identity()
        && props
            .service_principal_profile
            .as_ref()
            .map(|sp| sp.client_id.is_empty())
            .unwrap_or(false)
    {
        props.service_principal_profile = None;
    }
}

fn certificate_action(props: &Properties, mode: DefaultsMode) -> CertificateAction {
    let master_count = props.master_count();
    match (&props.certificate_profile, mode) {
        (Some(certs), DefaultsMode::Create) if certs.is_complete(master_count) => {
            CertificateAction::Keep
        }
        (Some(certs), DefaultsMode::Create) if certs.has_ca() => CertificateAction::DeriveFromCa,
        (Some(certs), _) if mode.is_update() && certs.has_ca() => CertificateAction::Keep,
        _ => CertificateAction::GenerateAll,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ContainerService {
        ContainerService {
            location: "West US 2".to_string(),
            properties: Properties {
                orchestrator_profile: Some(OrchestratorProfile {
                    orchestrator_type: "kubernetes".to_string(),
                    ..Default::default()
                }),
                master_profile: Some(MasterProfile {
                    count: 1,
                    dns_prefix: "mycluster".to_string(),
                    vm_size: "Standard_D2_v3".to_string(),
                    ..Default::default()
                }),
                agent_pool_profiles: vec![AgentPoolProfile {
                    name: "agentpool1".to_string(),
                    count: 3,
                    vm_size: "Standard_D2_v3".to_string(),
                    ..Default::default()
                }],
                linux_profile: Some(LinuxProfile::default()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn create_defaults_fill_absent_fields() {
        let mut cs = model();
        let outcome = apply_defaults(&mut cs, DefaultsMode::Create, &VersionPolicy::builtin())
            .expect("defaults apply");

        assert_eq!(cs.location, "westus2");
        let orch = cs.properties.orchestrator_profile.as_ref().expect("orchestrator");
        assert_eq!(orch.orchestrator_type, KUBERNETES);
        assert_eq!(orch.orchestrator_version, "1.24.8");
        assert_eq!(orch.orchestrator_release, "1.24");

        let master = cs.properties.master_profile.as_ref().expect("master");
        assert_eq!(master.fqdn, "mycluster.westus2.cloudapp.azure.com");
        assert_eq!(master.first_consecutive_static_ip, "10.240.255.5");
        assert!(master.is_managed_disks());

        let pool = &cs.properties.agent_pool_profiles[0];
        assert!(pool.is_virtual_machine_scale_sets());
        assert_eq!(pool.os_type, Some(OsType::Linux));

        assert_eq!(
            cs.properties.linux_profile.as_ref().map(|l| l.admin_username.as_str()),
            Some("azureuser")
        );
        assert!(cs.properties.is_standard_load_balancer());
        assert_eq!(outcome.certificates, CertificateAction::GenerateAll);
    }

    #[test]
    fn explicit_values_are_kept() {
        let mut cs = model();
        {
            let master = cs.properties.master_profile.as_mut().expect("master");
            master.availability_profile = Some(AvailabilityProfile::VirtualMachineScaleSets);
            master.fqdn = "custom.example.com".to_string();
        }
        cs.properties.agent_pool_profiles[0].availability_profile =
            Some(AvailabilityProfile::AvailabilitySet);

        apply_defaults(&mut cs, DefaultsMode::Create, &VersionPolicy::builtin()).expect("defaults");

        let master = cs.properties.master_profile.as_ref().expect("master");
        assert_eq!(master.fqdn, "custom.example.com");
        assert_eq!(master.first_consecutive_static_ip, "10.240.0.4");
        assert!(cs.properties.agent_pool_profiles[0].is_availability_sets());
    }

    #[test]
    fn unsupported_create_version_fails() {
        let mut cs = model();
        if let Some(orch) = cs.properties.orchestrator_profile.as_mut() {
            orch.orchestrator_version = "1.22.10".to_string();
        }
        let err = apply_defaults(&mut cs, DefaultsMode::Create, &VersionPolicy::builtin())
            .expect_err("non-creatable version");
        assert_eq!(err.kind(), crate::ErrorKind::UnsupportedVersion);

        // the same version is acceptable for an update
        let mut cs = model();
        if let Some(orch) = cs.properties.orchestrator_profile.as_mut() {
            orch.orchestrator_version = "1.22.10".to_string();
        }
        apply_defaults(&mut cs, DefaultsMode::Upgrade, &VersionPolicy::builtin())
            .expect("supported for update");
        assert_eq!(cs.properties.orchestrator_version(), "1.22.10");
    }

    #[test]
    fn certificate_action_depends_on_mode_and_material() {
        let policy = VersionPolicy::builtin();

        let mut with_ca = model();
        with_ca.properties.certificate_profile = Some(CertificateProfile {
            ca_certificate: "cert".to_string(),
            ca_private_key: "key".to_string(),
            ..Default::default()
        });

        let mut cs = with_ca.clone();
        let outcome = apply_defaults(&mut cs, DefaultsMode::Create, &policy).expect("defaults");
        assert_eq!(outcome.certificates, CertificateAction::DeriveFromCa);

        let mut cs = with_ca.clone();
        let outcome = apply_defaults(&mut cs, DefaultsMode::Scale, &policy).expect("defaults");
        assert_eq!(outcome.certificates, CertificateAction::Keep);

        let mut cs = model();
        let outcome = apply_defaults(&mut cs, DefaultsMode::Upgrade, &policy).expect("defaults");
        assert_eq!(outcome.certificates, CertificateAction::GenerateAll);
    }

    #[test]
    fn managed_identity_drops_empty_service_principal() {
        let mut cs = model();
        cs.properties.kubernetes_config_mut().use_managed_identity = Some(true);
        cs.properties.service_principal_profile = Some(ServicePrincipalProfile::default());
        apply_defaults(&mut cs, DefaultsMode::Create, &VersionPolicy::builtin()).expect("defaults");
        assert!(cs.properties.service_principal_profile.is_none());
    }
}
