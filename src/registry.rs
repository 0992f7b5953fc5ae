//! Container discovery and the name -> container registry
//!
//! Discovery turns the runtime's inventory into an [`Inventory`]: one
//! [`ManagedContainer`] per opted-in container, plus a record of every
//! container that opted in with unusable labels. The [`Registry`] publishes
//! inventories by swapping an `Arc`, so a lookup sees either the previous
//! complete set or the new one.

use crate::config::{parse_bool, parse_duration, FreezeMethod, GateDefaults, LabelConfig};
use crate::container::{ContainerSpec, ManagedContainer};
use crate::error::ConfigError;
use crate::runtime::ContainerSummary;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settings discovery falls back to when a label is absent
#[derive(Debug, Clone)]
pub struct DiscoveryDefaults {
    pub labels: LabelConfig,
    pub freeze_method: FreezeMethod,
    pub idle_timeout: Duration,
}

impl DiscoveryDefaults {
    pub fn new(labels: &LabelConfig, defaults: &GateDefaults) -> Self {
        Self {
            labels: labels.clone(),
            freeze_method: defaults.freeze_method,
            idle_timeout: defaults.idle_timeout,
        }
    }
}

impl Default for DiscoveryDefaults {
    fn default() -> Self {
        Self::new(&LabelConfig::default(), &GateDefaults::default())
    }
}

/// Outcome of reading one container's labels
#[derive(Debug)]
pub enum Discovered {
    /// Not opted in
    Skipped,
    Managed(ContainerSpec),
    /// Opted in (or tried to) with labels that can't be used
    Rejected { name: String, error: ConfigError },
}

/// A container that could not be managed, and why
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RejectedContainer {
    pub name: String,
    pub reason: String,
}

/// Read the opt-in labels of one container
pub fn inspect_labels(summary: &ContainerSummary, defaults: &DiscoveryDefaults) -> Discovered {
    let labels = &defaults.labels;
    let label = |key: String| {
        summary
            .labels
            .get(&key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(|v| (key, v.to_string()))
    };

    let name = label(labels.name())
        .map(|(_, v)| v)
        .or_else(|| summary.primary_name().map(str::to_string))
        .unwrap_or_else(|| summary.id.clone());

    let Some((enable_key, enable_value)) = label(labels.enable()) else {
        return Discovered::Skipped;
    };
    match parse_bool(&enable_value, &format!("label {}", enable_key)) {
        Ok(true) => {}
        Ok(false) => return Discovered::Skipped,
        Err(error) => return Discovered::Rejected { name, error },
    }

    let freeze_method = match label(labels.freeze_method()) {
        Some((_, value)) => match value.parse::<FreezeMethod>() {
            Ok(method) => method,
            Err(error) => return Discovered::Rejected { name, error },
        },
        None => defaults.freeze_method,
    };

    let idle_timeout = match label(labels.idle_timeout()) {
        Some((key, value)) => match parse_duration(&value, &format!("label {}", key)) {
            Ok(timeout) => timeout,
            Err(error) => return Discovered::Rejected { name, error },
        },
        None => defaults.idle_timeout,
    };

    Discovered::Managed(ContainerSpec {
        name,
        backing_id: summary.id.clone(),
        freeze_method,
        idle_timeout,
    })
}

/// A complete, immutable set of managed containers
#[derive(Debug, Default)]
pub struct Inventory {
    containers: BTreeMap<String, Arc<ManagedContainer>>,
    rejected: BTreeMap<String, String>,
}

impl Inventory {
    /// Build an inventory from the runtime's listing.
    ///
    /// Containers with malformed labels are rejected individually; every
    /// container claiming a name that another one also claims is rejected too.
    pub fn discover(listing: &[ContainerSummary], defaults: &DiscoveryDefaults) -> Self {
        let mut specs: Vec<ContainerSpec> = Vec::new();
        let mut rejected = BTreeMap::new();

        for summary in listing {
            match inspect_labels(summary, defaults) {
                Discovered::Skipped => {
                    debug!(container_id = %summary.id, "Container not opted in");
                }
                Discovered::Managed(spec) => specs.push(spec),
                Discovered::Rejected { name, error } => {
                    warn!(name = %name, container_id = %summary.id, error = %error, "Skipping container with invalid labels");
                    rejected.insert(name, error.to_string());
                }
            }
        }

        // A rejected container still claims its name
        let mut claims: HashMap<&str, usize> = HashMap::new();
        for name in specs.iter().map(|s| s.name.as_str()).chain(rejected.keys().map(String::as_str)) {
            *claims.entry(name).or_default() += 1;
        }
        let duplicated: HashMap<String, usize> = claims
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(name, count)| (name.to_string(), count))
            .collect();

        let mut containers = BTreeMap::new();
        for spec in specs {
            if let Some(&count) = duplicated.get(&spec.name) {
                let error = ConfigError::DuplicateName {
                    name: spec.name.clone(),
                    count,
                };
                warn!(name = %spec.name, container_id = %spec.backing_id, error = %error, "Skipping container with duplicate name");
                rejected.insert(spec.name, error.to_string());
                continue;
            }
            info!(
                name = %spec.name,
                container_id = %spec.backing_id,
                freeze_method = %spec.freeze_method,
                idle_timeout_ms = spec.idle_timeout.as_millis() as u64,
                "Container configuration loaded"
            );
            containers.insert(spec.name.clone(), ManagedContainer::new(spec));
        }

        Self {
            containers,
            rejected,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ManagedContainer>> {
        self.containers.get(name)
    }

    /// One entry per input name that matches; repeated names repeat the entry
    pub fn find_by_names<S: AsRef<str>>(&self, names: &[S]) -> Vec<Arc<ManagedContainer>> {
        names
            .iter()
            .filter_map(|name| self.containers.get(name.as_ref()))
            .cloned()
            .collect()
    }

    /// Why `name` was rejected, if it was
    pub fn rejection(&self, name: &str) -> Option<&str> {
        self.rejected.get(name).map(String::as_str)
    }

    pub fn rejected(&self) -> Vec<RejectedContainer> {
        self.rejected
            .iter()
            .map(|(name, reason)| RejectedContainer {
                name: name.clone(),
                reason: reason.clone(),
            })
            .collect()
    }

    pub fn containers(&self) -> impl Iterator<Item = &Arc<ManagedContainer>> {
        self.containers.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.containers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Cancel every timer in this inventory
    pub fn retire_all(&self) {
        for container in self.containers.values() {
            container.retire();
        }
    }
}

/// The published inventory
#[derive(Default)]
pub struct Registry {
    current: RwLock<Arc<Inventory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The inventory visible right now
    pub fn snapshot(&self) -> Arc<Inventory> {
        Arc::clone(&self.current.read())
    }

    /// Publish `inventory` and hand back the one it replaced
    pub fn replace(&self, inventory: Inventory) -> Arc<Inventory> {
        let next = Arc::new(inventory);
        let mut current = self.current.write();
        std::mem::replace(&mut *current, next)
    }

    pub fn find_by_names<S: AsRef<str>>(&self, names: &[S]) -> Vec<Arc<ManagedContainer>> {
        self.snapshot().find_by_names(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opted_in(id: &str, name: &str) -> ContainerSummary {
        ContainerSummary::new(id, name).with_label("thawgate.enable", "true")
    }

    #[test]
    fn test_skips_containers_without_opt_in() {
        let listing = vec![
            ContainerSummary::new("a", "db"),
            ContainerSummary::new("b", "cache").with_label("thawgate.enable", "false"),
            ContainerSummary::new("c", "blank").with_label("thawgate.enable", ""),
        ];
        let inventory = Inventory::discover(&listing, &DiscoveryDefaults::default());
        assert!(inventory.is_empty());
        assert!(inventory.rejected().is_empty());
    }

    #[test]
    fn test_defaults_apply_without_labels() {
        let listing = vec![opted_in("a", "web")];
        let inventory = Inventory::discover(&listing, &DiscoveryDefaults::default());

        let web = inventory.get("web").unwrap();
        assert_eq!(web.backing_id(), "a");
        assert_eq!(web.freeze_method(), FreezeMethod::Stop);
        assert_eq!(web.idle_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_process_defaults_are_used() {
        let defaults = DiscoveryDefaults {
            labels: LabelConfig::default(),
            freeze_method: FreezeMethod::Pause,
            idle_timeout: Duration::from_secs(300),
        };
        let inventory = Inventory::discover(&[opted_in("a", "web")], &defaults);

        let web = inventory.get("web").unwrap();
        assert_eq!(web.freeze_method(), FreezeMethod::Pause);
        assert_eq!(web.idle_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_labels_override_defaults() {
        let listing = vec![opted_in("a", "web-1")
            .with_label("thawgate.name", "web")
            .with_label("thawgate.freeze-method", "PAUSE")
            .with_label("thawgate.idle-timeout", "100ms")];
        let inventory = Inventory::discover(&listing, &DiscoveryDefaults::default());

        assert!(inventory.get("web-1").is_none());
        let web = inventory.get("web").unwrap();
        assert_eq!(web.freeze_method(), FreezeMethod::Pause);
        assert_eq!(web.idle_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_custom_label_prefix() {
        let defaults = DiscoveryDefaults {
            labels: LabelConfig {
                prefix: "lazy".into(),
            },
            ..DiscoveryDefaults::default()
        };
        let listing = vec![
            ContainerSummary::new("a", "web").with_label("lazy.enable", "1"),
            opted_in("b", "api"),
        ];
        let inventory = Inventory::discover(&listing, &defaults);
        assert_eq!(inventory.names(), vec!["web".to_string()]);
    }

    #[test]
    fn test_malformed_labels_reject_only_that_container() {
        let listing = vec![
            opted_in("a", "web"),
            opted_in("b", "api").with_label("thawgate.idle-timeout", "soon"),
            ContainerSummary::new("c", "worker").with_label("thawgate.enable", "yes"),
            opted_in("d", "jobs").with_label("thawgate.freeze-method", "hibernate"),
        ];
        let inventory = Inventory::discover(&listing, &DiscoveryDefaults::default());

        assert_eq!(inventory.names(), vec!["web".to_string()]);
        assert!(inventory.rejection("api").unwrap().contains("invalid duration"));
        assert!(inventory.rejection("worker").unwrap().contains("invalid boolean"));
        assert!(inventory.rejection("jobs").unwrap().contains("freeze method"));
        assert!(inventory.rejection("web").is_none());
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let listing = vec![
            opted_in("a", "web-a").with_label("thawgate.name", "web"),
            opted_in("b", "web-b").with_label("thawgate.name", "web"),
            opted_in("c", "api"),
        ];
        let inventory = Inventory::discover(&listing, &DiscoveryDefaults::default());

        assert!(inventory.get("web").is_none());
        assert!(inventory.rejection("web").unwrap().contains("2 containers"));
        assert!(inventory.get("api").is_some());
    }

    #[test]
    fn test_name_shared_with_rejected_container_is_rejected() {
        let listing = vec![
            opted_in("a", "web"),
            opted_in("b", "web-b")
                .with_label("thawgate.name", "web")
                .with_label("thawgate.idle-timeout", "eventually"),
        ];
        let inventory = Inventory::discover(&listing, &DiscoveryDefaults::default());

        assert!(inventory.is_empty());
        assert!(inventory.rejection("web").unwrap().contains("2 containers"));
    }

    #[test]
    fn test_name_falls_back_to_id() {
        let summary = ContainerSummary {
            id: "deadbeef".into(),
            names: Vec::new(),
            labels: HashMap::from([("thawgate.enable".to_string(), "t".to_string())]),
        };
        let inventory = Inventory::discover(&[summary], &DiscoveryDefaults::default());
        assert!(inventory.get("deadbeef").is_some());
    }

    #[test]
    fn test_find_by_names_repeats_duplicates() {
        let inventory = Inventory::discover(&[opted_in("a", "x")], &DiscoveryDefaults::default());

        let found = inventory.find_by_names(&["x", "x"]);
        assert_eq!(found.len(), 2);
        assert!(Arc::ptr_eq(&found[0], &found[1]));

        assert!(inventory.find_by_names(&["y"]).is_empty());
        assert_eq!(inventory.find_by_names(&["y", "x"]).len(), 1);
    }

    #[test]
    fn test_registry_replace_swaps_whole_inventory() {
        let registry = Registry::new();
        assert!(registry.snapshot().is_empty());

        let first = Inventory::discover(&[opted_in("a", "web")], &DiscoveryDefaults::default());
        registry.replace(first);
        let before = registry.snapshot();

        let second = Inventory::discover(&[opted_in("b", "api")], &DiscoveryDefaults::default());
        let previous = registry.replace(second);

        assert!(Arc::ptr_eq(&previous, &before));
        // A reader holding the old snapshot still sees the complete old set
        assert!(before.get("web").is_some());
        assert!(registry.find_by_names(&["web"]).is_empty());
        assert_eq!(registry.find_by_names(&["api"]).len(), 1);
    }
}
