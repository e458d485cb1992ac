//! Kubernetes version policy
//!
//! Two sets are maintained per cloud flavor: *supported* versions (the engine
//! can reason about them, e.g. as an upgrade source) and *creatable* versions
//! (allowed for new clusters). The table maps each supported version to its
//! creatable flag.
//!
//! Comparison follows semver precedence: a leading `v` and build metadata are
//! ignored, pre-release identifiers compare numerically when both are numeric
//! and lexically otherwise, and a release sorts after all of its pre-releases.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Default release for Linux clusters
pub const DEFAULT_RELEASE: &str = "1.24";

/// Default release for clusters with Windows pools
pub const DEFAULT_RELEASE_WINDOWS: &str = "1.24";

/// Default release on Azure Stack
pub const DEFAULT_RELEASE_AZURE_STACK: &str = "1.23";

/// Built-in table of supported Kubernetes versions and whether new clusters may use them
const KUBERNETES_VERSIONS: &[(&str, bool)] = &[
    ("1.16.0", false),
    ("1.16.1", false),
    ("1.16.4", false),
    ("1.16.6", false),
    ("1.16.7", false),
    ("1.16.8", false),
    ("1.16.9", false),
    ("1.16.10", false),
    ("1.16.11", false),
    ("1.16.12", false),
    ("1.16.13", false),
    ("1.16.14", false),
    ("1.16.15", false),
    ("1.17.0", false),
    ("1.17.1", false),
    ("1.17.2", false),
    ("1.17.3", false),
    ("1.17.4", false),
    ("1.17.5", false),
    ("1.17.6", false),
    ("1.17.7", false),
    ("1.17.8", false),
    ("1.17.9", false),
    ("1.17.11", false),
    ("1.17.12", false),
    ("1.17.13", false),
    ("1.17.16", false),
    ("1.17.17", false),
    ("1.18.0", false),
    ("1.18.1", false),
    ("1.18.2", false),
    ("1.18.3", false),
    ("1.18.4", false),
    ("1.18.5", false),
    ("1.18.6", false),
    ("1.18.8", false),
    ("1.18.9", false),
    ("1.18.10", false),
    ("1.18.12", false),
    ("1.18.13", false),
    ("1.18.14", false),
    ("1.18.15", false),
    ("1.18.16", false),
    ("1.18.17", false),
    ("1.18.18", false),
    ("1.18.19", false),
    ("1.18.20", false),
    ("1.19.0-rc.4", false),
    ("1.19.0", false),
    ("1.19.1", false),
    ("1.19.2", false),
    ("1.19.3", false),
    ("1.19.4", false),
    ("1.19.5", false),
    ("1.19.6", false),
    ("1.19.7", false),
    ("1.19.8", false),
    ("1.19.9", false),
    ("1.19.10", false),
    ("1.19.11", false),
    ("1.19.12", false),
    ("1.19.13", false),
    ("1.19.14", false),
    ("1.19.15", false),
    ("1.19.16", false),
    ("1.20.0-rc.0", false),
    ("1.20.0", false),
    ("1.20.1", false),
    ("1.20.2", false),
    ("1.20.4", false),
    ("1.20.5", false),
    ("1.20.6", false),
    ("1.20.7", false),
    ("1.20.8", false),
    ("1.20.9", false),
    ("1.20.10", false),
    ("1.20.11", false),
    ("1.20.12", false),
    ("1.20.13", false),
    ("1.20.14", false),
    ("1.20.15", true),
    ("1.21.0-rc.0", false),
    ("1.21.0", false),
    ("1.21.1", false),
    ("1.21.2", false),
    ("1.21.3", false),
    ("1.21.4", false),
    ("1.21.5", false),
    ("1.21.6", false),
    ("1.21.7", false),
    ("1.21.8", false),
    ("1.21.9", false),
    ("1.21.10", false),
    ("1.21.11", false),
    ("1.21.12", false),
    ("1.21.13", false),
    ("1.21.14", true),
    ("1.22.0-beta.2", false),
    ("1.22.0", false),
    ("1.22.1", false),
    ("1.22.2", false),
    ("1.22.3", false),
    ("1.22.4", false),
    ("1.22.5", false),
    ("1.22.6", false),
    ("1.22.7", false),
    ("1.22.8", false),
    ("1.22.9", false),
    ("1.22.10", false),
    ("1.22.11", false),
    ("1.22.12", false),
    ("1.22.13", false),
    ("1.22.14", false),
    ("1.22.15", false),
    ("1.22.16", true),
    ("1.23.0-rc.1", false),
    ("1.23.0", false),
    ("1.23.1", false),
    ("1.23.2", false),
    ("1.23.3", false),
    ("1.23.4", false),
    ("1.23.5", false),
    ("1.23.6", false),
    ("1.23.7", false),
    ("1.23.8", false),
    ("1.23.9", false),
    ("1.23.10", false),
    ("1.23.11", false),
    ("1.23.12", false),
    ("1.23.13", false),
    ("1.23.14", true),
    ("1.24.0-alpha.3", false),
    ("1.24.0", false),
    ("1.24.1", false),
    ("1.24.2", false),
    ("1.24.3", false),
    ("1.24.4", false),
    ("1.24.5", false),
    ("1.24.6", false),
    ("1.24.7", false),
    ("1.24.8", true),
];

/// Versions dropped from the Windows table
const WINDOWS_EXCLUDED: &[&str] = &[
    "1.19.0-rc.4",
    "1.20.0-rc.0",
    "1.21.0-rc.0",
    "1.22.0-beta.2",
    "1.23.0-rc.1",
    "1.24.0-alpha.3",
];

const KUBERNETES_VERSIONS_AZURE_STACK: &[(&str, bool)] = &[
    ("1.16.14", false),
    ("1.16.15", false),
    ("1.17.11", false),
    ("1.17.17", false),
    ("1.18.10", false),
    ("1.18.15", false),
    ("1.18.18", false),
    ("1.19.10", false),
    ("1.19.15", false),
    ("1.20.6", false),
    ("1.20.11", false),
    ("1.21.10", false),
    ("1.22.7", false),
    ("1.22.15", false),
    ("1.22.16", true),
    ("1.23.6", false),
    ("1.23.12", false),
    ("1.23.13", false),
    ("1.23.14", true),
];

/// Pre-release identifier
#[derive(Debug, Clone, PartialEq, Eq)]
enum PreRelease {
    Numeric(u64),
    Alpha(String),
}

impl Ord for PreRelease {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PreRelease::Numeric(a), PreRelease::Numeric(b)) => a.cmp(b),
            (PreRelease::Numeric(_), PreRelease::Alpha(_)) => Ordering::Less,
            (PreRelease::Alpha(_), PreRelease::Numeric(_)) => Ordering::Greater,
            (PreRelease::Alpha(a), PreRelease::Alpha(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for PreRelease {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Parsed `MAJOR.MINOR.PATCH[-PRE]` version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubernetesVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pre: Vec<PreRelease>,
}

impl KubernetesVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: Vec::new(),
        }
    }

    /// Parse a version, ignoring a leading `v` and any build metadata
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || Error::unsupported_version(format!("could not parse version {}", input));

        let trimmed = input.trim().trim_start_matches('v');
        let without_build = trimmed.split('+').next().unwrap_or_default();
        let (core, pre) = match without_build.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (without_build, None),
        };

        let mut parts = core.split('.');
        let mut next_number = || -> Result<u64> {
            parts
                .next()
                .filter(|p| !p.is_empty())
                .and_then(|p| p.parse::<u64>().ok())
                .ok_or_else(invalid)
        };
        let major = next_number()?;
        let minor = next_number()?;
        let patch = next_number()?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        let pre = match pre {
            None => Vec::new(),
            Some(pre) => pre
                .split('.')
                .map(|id| {
                    if id.is_empty() {
                        Err(invalid())
                    } else if let Ok(n) = id.parse::<u64>() {
                        Ok(PreRelease::Numeric(n))
                    } else {
                        Ok(PreRelease::Alpha(id.to_string()))
                    }
                })
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(Self {
            major,
            minor,
            patch,
            pre,
        })
    }

    /// True when this version carries pre-release identifiers
    pub fn is_pre_release(&self) -> bool {
        !self.pre.is_empty()
    }

    /// `MAJOR.MINOR` release string
    pub fn release(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }
}

impl FromStr for KubernetesVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Ord for KubernetesVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.pre.cmp(&other.pre),
            })
    }
}

impl PartialOrd for KubernetesVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for KubernetesVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.pre.is_empty() {
            let ids: Vec<String> = self
                .pre
                .iter()
                .map(|p| match p {
                    PreRelease::Numeric(n) => n.to_string(),
                    PreRelease::Alpha(s) => s.clone(),
                })
                .collect();
            write!(f, "-{}", ids.join("."))?;
        }
        Ok(())
    }
}

fn parse_all(versions: &[String], pre_releases: bool) -> Vec<(KubernetesVersion, &String)> {
    versions
        .iter()
        .filter_map(|v| KubernetesVersion::parse(v).ok().map(|sv| (sv, v)))
        .filter(|(sv, _)| pre_releases || !sv.is_pre_release())
        .collect()
}

/// Versions greater than `version` (or equal when `inclusive`)
pub fn versions_gt(
    versions: &[String],
    version: &str,
    inclusive: bool,
    pre_releases: bool,
) -> Vec<String> {
    let Ok(min) = KubernetesVersion::parse(version) else {
        return Vec::new();
    };
    parse_all(versions, pre_releases)
        .into_iter()
        .filter(|(sv, _)| if inclusive { *sv >= min } else { *sv > min })
        .map(|(_, v)| v.clone())
        .collect()
}

/// Versions less than `version` (or equal when `inclusive`)
pub fn versions_lt(
    versions: &[String],
    version: &str,
    inclusive: bool,
    pre_releases: bool,
) -> Vec<String> {
    let Ok(max) = KubernetesVersion::parse(version) else {
        return Vec::new();
    };
    parse_all(versions, pre_releases)
        .into_iter()
        .filter(|(sv, _)| if inclusive { *sv <= max } else { *sv < max })
        .map(|(_, v)| v.clone())
        .collect()
}

/// Versions between two bounds; a pre-release lower bound implies `pre_releases`
pub fn versions_between(
    versions: &[String],
    min: &str,
    max: &str,
    inclusive: bool,
    pre_releases: bool,
) -> Vec<String> {
    let pre_releases = pre_releases
        || KubernetesVersion::parse(min)
            .map(|v| v.is_pre_release())
            .unwrap_or(false);
    let greater = versions_gt(versions, min, inclusive, pre_releases);
    versions_lt(versions, max, inclusive, pre_releases)
        .into_iter()
        .filter(|v| greater.contains(v))
        .collect()
}

/// Lowest version in the list
pub fn min_version(versions: &[String], pre_release: bool) -> Option<String> {
    parse_all(versions, pre_release)
        .into_iter()
        .min_by(|a, b| a.0.cmp(&b.0))
        .map(|(sv, _)| sv.to_string())
}

/// Highest version in the list
pub fn max_version(versions: &[String], pre_release: bool) -> Option<String> {
    parse_all(versions, pre_release)
        .into_iter()
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(sv, _)| sv.to_string())
}

/// Greatest patch whose `major.minor` equals `major_minor`
pub fn latest_patch_version(
    major_minor: &str,
    candidates: &[String],
    pre_releases: bool,
) -> Option<String> {
    let wanted = major_minor.trim_start_matches('v');
    parse_all(candidates, pre_releases)
        .into_iter()
        .filter(|(sv, _)| sv.release() == wanted)
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, v)| v.clone())
}

/// `actual >= version`; unparsable input compares as false
pub fn is_version_ge(actual: &str, version: &str) -> bool {
    match (
        KubernetesVersion::parse(actual),
        KubernetesVersion::parse(version),
    ) {
        (Ok(a), Ok(b)) => a >= b,
        _ => false,
    }
}

fn sorted(versions: impl Iterator<Item = String>) -> Vec<String> {
    let mut parsed: Vec<(KubernetesVersion, String)> = versions
        .filter_map(|v| KubernetesVersion::parse(&v).ok().map(|sv| (sv, v)))
        .collect();
    parsed.sort_by(|a, b| a.0.cmp(&b.0));
    parsed.into_iter().map(|(_, v)| v).collect()
}

/// Version tables and defaults for every cloud flavor
#[derive(Debug, Clone)]
pub struct VersionPolicy {
    linux: BTreeMap<String, bool>,
    windows: BTreeMap<String, bool>,
    azure_stack: BTreeMap<String, bool>,
    azure_stack_windows: BTreeMap<String, bool>,
    default_release: String,
    default_release_windows: String,
    default_release_azure_stack: String,
}

impl Default for VersionPolicy {
    fn default() -> Self {
        Self::builtin()
    }
}

impl VersionPolicy {
    /// Policy compiled into this build
    pub fn builtin() -> Self {
        let linux: BTreeMap<String, bool> = KUBERNETES_VERSIONS
            .iter()
            .map(|(v, c)| (v.to_string(), *c))
            .collect();
        let windows = linux
            .iter()
            .filter(|(v, _)| !WINDOWS_EXCLUDED.contains(&v.as_str()))
            .map(|(v, c)| (v.clone(), *c))
            .collect();
        let azure_stack: BTreeMap<String, bool> = KUBERNETES_VERSIONS_AZURE_STACK
            .iter()
            .map(|(v, c)| (v.to_string(), *c))
            .collect();

        Self {
            linux,
            windows,
            azure_stack_windows: azure_stack.clone(),
            azure_stack,
            default_release: DEFAULT_RELEASE.to_string(),
            default_release_windows: DEFAULT_RELEASE_WINDOWS.to_string(),
            default_release_azure_stack: DEFAULT_RELEASE_AZURE_STACK.to_string(),
        }
    }

    /// Policy over a single table shared by every flavor
    ///
    /// The default release is the newest release with a creatable version.
    pub fn from_table<S: AsRef<str>>(table: &[(S, bool)]) -> Self {
        let map: BTreeMap<String, bool> = table
            .iter()
            .map(|(v, c)| (v.as_ref().to_string(), *c))
            .collect();
        let creatable: Vec<String> = map
            .iter()
            .filter(|(_, c)| **c)
            .map(|(v, _)| v.clone())
            .collect();
        let default_release = max_version(&creatable, false)
            .and_then(|v| KubernetesVersion::parse(&v).ok())
            .map(|v| v.release())
            .unwrap_or_default();

        Self {
            linux: map.clone(),
            windows: map.clone(),
            azure_stack: map.clone(),
            azure_stack_windows: map,
            default_release_windows: default_release.clone(),
            default_release_azure_stack: default_release.clone(),
            default_release,
        }
    }

    fn table(&self, has_windows: bool, is_azure_stack: bool) -> &BTreeMap<String, bool> {
        match (is_azure_stack, has_windows) {
            (true, true) => &self.azure_stack_windows,
            (true, false) => &self.azure_stack,
            (false, true) => &self.windows,
            (false, false) => &self.linux,
        }
    }

    /// Sorted versions allowed for the operation mode
    ///
    /// Updates may target any supported version; creates only creatable ones.
    pub fn all_supported_versions(
        &self,
        is_update: bool,
        has_windows: bool,
        is_azure_stack: bool,
    ) -> Vec<String> {
        sorted(
            self.table(has_windows, is_azure_stack)
                .iter()
                .filter(|(_, creatable)| is_update || **creatable)
                .map(|(v, _)| v.clone()),
        )
    }

    /// Latest creatable patch of the default release
    pub fn default_version(&self, has_windows: bool, is_azure_stack: bool) -> String {
        let release = if is_azure_stack {
            &self.default_release_azure_stack
        } else if has_windows {
            &self.default_release_windows
        } else {
            &self.default_release
        };
        latest_patch_version(
            release,
            &self.all_supported_versions(false, has_windows, is_azure_stack),
            false,
        )
        .unwrap_or_default()
    }

    /// `version` when it is creatable, the default version otherwise
    pub fn supported_version_or_default(
        &self,
        version: &str,
        has_windows: bool,
        is_azure_stack: bool,
    ) -> String {
        if self
            .table(has_windows, is_azure_stack)
            .get(version)
            .copied()
            .unwrap_or(false)
        {
            version.to_string()
        } else {
            self.default_version(has_windows, is_azure_stack)
        }
    }

    /// Resolve the effective version from an optional release and version
    ///
    /// Neither given: the default. Release only: its latest patch. Version
    /// only: itself when allowed. Both: the version when it belongs to the
    /// release and is allowed.
    pub fn rationalize(
        &self,
        release: &str,
        version: &str,
        is_update: bool,
        has_windows: bool,
        is_azure_stack: bool,
    ) -> Option<String> {
        let release = release.trim_start_matches('v');
        let version = version.trim_start_matches('v');
        let supported = self.all_supported_versions(is_update, has_windows, is_azure_stack);

        match (release.is_empty(), version.is_empty()) {
            (true, true) => {
                Some(self.default_version(has_windows, is_azure_stack)).filter(|v| !v.is_empty())
            }
            (false, true) => latest_patch_version(release, &supported, false),
            (true, false) => supported.into_iter().find(|v| v == version),
            (false, false) => supported.into_iter().find(|v| {
                v == version
                    && KubernetesVersion::parse(v)
                        .map(|sv| sv.release() == release)
                        .unwrap_or(false)
            }),
        }
    }

    /// Current valid patch for the minor version of `version`
    pub fn valid_patch_version(
        &self,
        version: &str,
        is_update: bool,
        has_windows: bool,
        is_azure_stack: bool,
    ) -> Option<String> {
        if version.is_empty() {
            return self.rationalize("", "", is_update, has_windows, is_azure_stack);
        }
        self.rationalize("", version, is_update, has_windows, is_azure_stack)
            .or_else(|| {
                let sv = KubernetesVersion::parse(version).ok()?;
                self.rationalize(&sv.release(), "", is_update, has_windows, is_azure_stack)
            })
    }

    /// Whether the rationalized create-time version is at least `min`
    ///
    /// Errors when the release/version pair cannot be rationalized.
    pub fn is_valid_min_version(&self, release: &str, version: &str, min: &str) -> Result<bool> {
        let resolved = self
            .rationalize(release, version, false, false, false)
            .ok_or_else(|| {
                Error::unsupported_version(format!(
                    "the following user supplied OrchestratorProfile configuration is not supported: OrchestratorRelease: {}, OrchestratorVersion: {}",
                    release, version
                ))
            })?;
        let resolved = KubernetesVersion::parse(&resolved)?;
        let min = KubernetesVersion::parse(min)?;
        Ok(resolved >= min)
    }

    /// Membership in the allowed set for the operation mode
    pub fn is_supported(
        &self,
        version: &str,
        is_update: bool,
        has_windows: bool,
        is_azure_stack: bool,
    ) -> bool {
        self.all_supported_versions(is_update, has_windows, is_azure_stack)
            .iter()
            .any(|v| v == version)
    }

    /// Versions reachable from `current` in one upgrade
    ///
    /// Targets stay within the next minor. When the nearest newer version is
    /// more than one minor ahead, only that version's minor is reachable.
    pub fn available_upgrades(
        &self,
        current: &str,
        has_windows: bool,
        is_azure_stack: bool,
    ) -> Result<Vec<String>> {
        let current_version = KubernetesVersion::parse(current)?;
        let supported = self.all_supported_versions(true, has_windows, is_azure_stack);
        let newer = versions_gt(&supported, current, false, true);
        let Some(min) = min_version(&newer, true) else {
            return Ok(Vec::new());
        };
        let min = KubernetesVersion::parse(&min)?;

        let ceiling = if current_version.major >= min.major
            && current_version.minor + 1 < min.minor
        {
            format!("{}.{}.0-alpha.0", min.major, min.minor + 1)
        } else {
            format!(
                "{}.{}.0-alpha.0",
                current_version.major,
                current_version.minor + 2
            )
        };

        Ok(versions_between(&supported, current, &ceiling, false, true))
    }

    /// Whether `target` is in the upgrade list of `current`
    ///
    /// `--force` is applied by callers, never here.
    pub fn is_upgrade_allowed(
        &self,
        current: &str,
        target: &str,
        has_windows: bool,
        is_azure_stack: bool,
    ) -> bool {
        let target = target.trim_start_matches('v');
        self.available_upgrades(current.trim_start_matches('v'), has_windows, is_azure_stack)
            .map(|upgrades| upgrades.iter().any(|v| v == target))
            .unwrap_or(false)
    }
}
