//! Transformer building blocks
//!
//! Every mode in [`crate::transform`] is a sequence of these pure edits.

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, TransformError};
use crate::model::{Resource, ResourceType, Template};

/// Remove the single resource of `kind` and every dependency on it
///
/// A dependency matches when it carries the type string or the canonical id
/// variable of `kind`. `skip` excludes resources from the singleton count
/// (the jumpbox NSG is not the cluster NSG). Finding two is an error.
pub fn remove_resource_type(
    template: &mut Template,
    kind: &ResourceType,
    skip: impl Fn(&Resource) -> bool,
) -> Result<()> {
    let matches: Vec<usize> = template
        .resources
        .iter()
        .enumerate()
        .filter(|(_, r)| &r.kind == kind && !skip(r))
        .map(|(i, _)| i)
        .collect();
    if let Some(&second) = matches.get(1) {
        return Err(TransformError::malformed(
            format!("resources[{}]", second),
            format!(
                "found at least 2 resources of type {}, only 1 is expected",
                kind
            ),
        ));
    }
    if let Some(&index) = matches.first() {
        let removed = template.resources.remove(index);
        debug!(resource = %removed.name, kind = %kind, "removed singleton resource");
    }

    let type_name = kind.as_str().to_string();
    let id_variable = kind.id_variable().map(|v| format!("variables('{}')", v));
    remove_dependencies(template, |dep| {
        dependency_has_type(dep, &type_name)
            || id_variable.as_deref().map(|v| dep.contains(v)).unwrap_or(false)
    });
    Ok(())
}

/// Delete every resource matching `predicate` and prune references to it
///
/// Returns how many resources were removed.
pub fn remove_resources(template: &mut Template, predicate: impl Fn(&Resource) -> bool) -> usize {
    let (removed, kept): (Vec<Resource>, Vec<Resource>) =
        template.resources.drain(..).partition(|r| predicate(r));
    template.resources = kept;
    if removed.is_empty() {
        return 0;
    }
    for resource in &removed {
        debug!(resource = %resource.name, kind = %resource.kind, "removed resource");
    }
    remove_dependencies(template, |dep| removed.iter().any(|r| r.is_referenced_by(dep)));
    removed.len()
}

/// Remove `dependsOn` entries matching `predicate` from every resource
pub fn remove_dependencies(template: &mut Template, predicate: impl Fn(&str) -> bool) {
    for resource in &mut template.resources {
        resource.depends_on.retain(|dep| !predicate(dep));
    }
}

/// Remove a property under `properties` from every resource matching `filter`
///
/// `path` is a list of keys; only the last one is removed. Returns how many
/// resources were changed.
pub fn strip_property(
    template: &mut Template,
    path: &[&str],
    filter: impl Fn(&Resource) -> bool,
) -> usize {
    let Some((last, parents)) = path.split_last() else {
        return 0;
    };
    let mut changed = 0;
    for resource in template.resources.iter_mut().filter(|r| filter(r)) {
        let removed = resource
            .property_object_mut(parents)
            .and_then(|parent| parent.remove(*last));
        if removed.is_some() {
            changed += 1;
        }
    }
    changed
}

/// Overwrite `{pool}Index` and `{pool}VMNamePrefix` for a pool at `index`
pub fn rewrite_indexed_variables(
    template: &mut Template,
    pool: &str,
    index: usize,
    vm_name_prefix: &str,
) {
    template.set_variable(&format!("{}Index", pool), Value::from(index));
    template.set_variable(&format!("{}VMNamePrefix", pool), vm_name_prefix);
}

/// A `dependsOn` entry naming a resource of exactly `type_name`
///
/// `Microsoft.Compute/virtualMachines` must not match an entry for
/// `Microsoft.Compute/virtualMachines/extensions`.
fn dependency_has_type(dep: &str, type_name: &str) -> bool {
    dep.match_indices(type_name).any(|(start, matched)| {
        let rest = &dep[start + matched.len()..];
        !rest.starts_with('/') || rest.starts_with("/'")
    })
}
