//! Cluster identity and resource naming
//!
//! Every VM, NIC and scale set name embeds the eight-character cluster id so
//! mutations never touch unrelated resources in the same resource group.
//!
//! - Linux VM: `k8s-{pool}-{clusterID}-{index}`
//! - Scale set: `k8s-{pool}-{clusterID}-vmss`
//! - Master VM: `k8s-master-{clusterID}-{index}`
//! - Windows VM: `{clusterID[:4]}k8s{poolIndex:02}{index}`

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

const CLUSTER_ID_LEN: usize = 8;

static LINUX_VM_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-zA-Z]{3}-(?P<pool>.+)-(?P<id>[0-9a-fA-F]{8})-(?P<index>[0-9]+)$").ok()
});

static VMSS_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-zA-Z]{3}-(?P<pool>.+)-(?P<id>[0-9a-fA-F]{8})-vmss$").ok()
});

static WINDOWS_VM_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([a-fA-F0-9]{4})([0-9a-zA-Z]{3})([0-9]{3,8})$").ok());

static OLD_WINDOWS_VM_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^([a-fA-F0-9]{5})([0-9a-zA-Z]{3})([9])([a-zA-Z0-9]{3,5})$").ok()
});

/// Derive the cluster id from a seed (the DNS prefix)
///
/// Digits only, zero padded, always eight characters. Stable across releases
/// because it is stamped on every resource of a live cluster.
///
/// Region and subscription are not part of the seed. Neither can change for a
/// live cluster, and ids of clusters created earlier were derived from the DNS
/// prefix alone.
pub fn cluster_id(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let mut id = format!("{:08}", value);
    id.truncate(CLUSTER_ID_LEN);
    id
}

/// Parts of a Linux agent VM name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxVmName {
    pub pool: String,
    pub cluster_id: String,
    pub index: usize,
}

/// Parse `k8s-{pool}-{clusterID}-{index}`
pub fn parse_linux_vm_name(name: &str) -> Result<LinuxVmName> {
    let caps = LINUX_VM_NAME
        .as_ref()
        .and_then(|re| re.captures(name))
        .ok_or_else(|| Error::internal(format!("error parsing VM name {}", name)))?;
    let index = caps["index"]
        .parse()
        .map_err(|_| Error::internal(format!("error parsing VM index in {}", name)))?;
    Ok(LinuxVmName {
        pool: caps["pool"].to_string(),
        cluster_id: caps["id"].to_string(),
        index,
    })
}

/// Parts of a scale set name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmssName {
    pub pool: String,
    pub cluster_id: String,
}

/// Parse `k8s-{pool}-{clusterID}-vmss`
pub fn parse_vmss_name(name: &str) -> Result<VmssName> {
    let caps = VMSS_NAME
        .as_ref()
        .and_then(|re| re.captures(name))
        .ok_or_else(|| Error::internal(format!("error parsing VMSS name {}", name)))?;
    Ok(VmssName {
        pool: caps["pool"].to_string(),
        cluster_id: caps["id"].to_string(),
    })
}

/// Parts of a Windows VM or scale set name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsVmName {
    pub prefix: String,
    pub orchestrator: String,
    pub pool_index: usize,
    pub agent_index: usize,
}

/// Parse a Windows name in either the current or the legacy format
pub fn parse_windows_vm_name(name: &str) -> Result<WindowsVmName> {
    let invalid = || Error::internal(format!("error parsing Windows VM name {}", name));

    let (prefix, orchestrator, pool_info) = match OLD_WINDOWS_VM_NAME
        .as_ref()
        .and_then(|re| re.captures(name))
    {
        Some(caps) => (caps[1].to_string(), caps[2].to_string(), caps[4].to_string()),
        None => {
            let caps = WINDOWS_VM_NAME
                .as_ref()
                .and_then(|re| re.captures(name))
                .ok_or_else(invalid)?;
            (caps[1].to_string(), caps[2].to_string(), caps[3].to_string())
        }
    };

    if pool_info.len() < 3 {
        return Err(invalid());
    }
    let (pool_part, agent_part) = pool_info.split_at(2);
    let pool_index = pool_part.parse().map_err(|_| invalid())?;
    let agent_index = agent_part.parse().map_err(|_| invalid())?;

    Ok(WindowsVmName {
        prefix,
        orchestrator,
        pool_index,
        agent_index,
    })
}

/// Agent index of a VM name, dispatching on OS
pub fn vm_name_index(is_windows: bool, name: &str) -> Result<usize> {
    if is_windows {
        parse_windows_vm_name(name).map(|p| p.agent_index)
    } else {
        parse_linux_vm_name(name).map(|p| p.index)
    }
}

/// Lowest unused index below the highest one, or the next index after it
pub fn available_index(indices: &BTreeSet<usize>) -> usize {
    let Some(&max) = indices.iter().next_back() else {
        return 0;
    };
    (0..max).find(|i| !indices.contains(i)).unwrap_or(max + 1)
}

/// Last path segment of an ARM resource id
pub fn resource_name(id: &str) -> Result<String> {
    match id.rsplit('/').next() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(Error::internal("resource name was missing from identifier")),
    }
}

/// Resource group segment of an ARM resource id
pub fn resource_group(id: &str) -> Option<String> {
    let mut parts = id.split('/');
    while let Some(part) = parts.next() {
        if part.eq_ignore_ascii_case("resourceGroups") {
            return parts.next().map(str::to_string);
        }
    }
    None
}

/// Storage account, container and blob path of a VHD blob URI
pub fn split_blob_uri(uri: &str) -> Result<(String, String, String)> {
    let invalid = || Error::internal(format!("invalid blob URI {}", uri));
    let rest = uri.split_once("://").map(|(_, r)| r).ok_or_else(invalid)?;
    let (host, path) = rest.split_once('/').ok_or_else(invalid)?;
    let account = host.split('.').next().ok_or_else(invalid)?;
    let (container, blob) = path.split_once('/').ok_or_else(invalid)?;
    if account.is_empty() || container.is_empty() || blob.is_empty() {
        return Err(invalid());
    }
    Ok((account.to_string(), container.to_string(), blob.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_id_is_stable_and_eight_digits() {
        let a = cluster_id("mytestcluster");
        assert_eq!(a, cluster_id("mytestcluster"));
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_digit()));
        assert_ne!(a, cluster_id("othercluster"));
    }

    #[test]
    fn cluster_id_is_pinned_to_the_dns_prefix_hash() {
        assert_eq!(cluster_id("kestrel-test"), "55626094");
        assert_eq!(cluster_id("mytestcluster"), "38294897");
    }

    #[test]
    fn linux_names_parse_with_dashed_pools() {
        let parts = parse_linux_vm_name("k8s-agent-pool-12345678-7").expect("valid name");
        assert_eq!(parts.pool, "agent-pool");
        assert_eq!(parts.cluster_id, "12345678");
        assert_eq!(parts.index, 7);
        assert!(parse_linux_vm_name("k8s-agentpool1-12345678-vmss").is_err());
        assert!(parse_linux_vm_name("jumpbox").is_err());
    }

    #[test]
    fn vmss_names_parse() {
        let parts = parse_vmss_name("k8s-pool1-87654321-vmss").expect("valid name");
        assert_eq!(parts.pool, "pool1");
        assert_eq!(parts.cluster_id, "87654321");
        assert!(parse_vmss_name("k8s-pool1-87654321-0").is_err());
    }

    #[test]
    fn windows_names_parse_both_formats() {
        let current = parse_windows_vm_name("1234k8s010").expect("valid name");
        assert_eq!(current.prefix, "1234");
        assert_eq!(current.orchestrator, "k8s");
        assert_eq!(current.pool_index, 1);
        assert_eq!(current.agent_index, 0);

        let legacy = parse_windows_vm_name("12345k8s9010").expect("valid legacy name");
        assert_eq!(legacy.prefix, "12345");
        assert_eq!(legacy.pool_index, 1);
        assert_eq!(legacy.agent_index, 0);

        assert!(parse_windows_vm_name("k8s-pool-12345678-0").is_err());
    }

    #[test]
    fn index_dispatches_on_os() {
        assert_eq!(vm_name_index(false, "k8s-p-12345678-3").expect("linux"), 3);
        assert_eq!(vm_name_index(true, "1234k8s0212").expect("windows"), 12);
    }

    #[test]
    fn available_index_fills_gaps_first() {
        let set = |v: &[usize]| v.iter().copied().collect::<BTreeSet<_>>();
        assert_eq!(available_index(&set(&[])), 0);
        assert_eq!(available_index(&set(&[0, 1, 2])), 3);
        assert_eq!(available_index(&set(&[0, 2, 3])), 1);
        assert_eq!(available_index(&set(&[1, 2])), 0);
    }

    #[test]
    fn resource_ids_split() {
        let id = "/subscriptions/s/resourceGroups/rg1/providers/Microsoft.Compute/disks/osdisk";
        assert_eq!(resource_name(id).expect("named"), "osdisk");
        assert_eq!(resource_group(id).as_deref(), Some("rg1"));
        assert!(resource_name("/trailing/").is_err());

        let (account, container, blob) =
            split_blob_uri("https://acct.blob.core.windows.net/vhds/k8s/os.vhd").expect("valid");
        assert_eq!(account, "acct");
        assert_eq!(container, "vhds");
        assert_eq!(blob, "k8s/os.vhd");
    }
}
