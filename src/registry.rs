/// the declarative setting registry: one row per static setting, loaded once at startup
///
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Result, StaticDataError};

/// object-store key used when an object-store row has no explicit path
pub const OBJECT_KEY_TEMPLATE: &str = "{version}/{name}.json";

/// the source kind a setting is fetched from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// a literal list carried in the configuration itself
    #[serde(alias = "inline-list", alias = "InlineList", alias = "Inline")]
    Inline,
    #[serde(alias = "object-store", alias = "ObjectStore")]
    ObjectStore,
    /// property management system
    #[serde(alias = "PMS", alias = "Pms")]
    Pms,
    /// content management system
    #[serde(alias = "CMS", alias = "Cms")]
    Cms,
    /// secondary catalog service
    #[serde(alias = "Catalog")]
    Catalog,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::Inline,
        ProviderKind::ObjectStore,
        ProviderKind::Pms,
        ProviderKind::Cms,
        ProviderKind::Catalog,
    ];

    /// true for the three upstream REST systems
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            ProviderKind::Pms | ProviderKind::Cms | ProviderKind::Catalog
        )
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::Inline => "inline",
            ProviderKind::ObjectStore => "object_store",
            ProviderKind::Pms => "pms",
            ProviderKind::Cms => "cms",
            ProviderKind::Catalog => "catalog",
        };
        f.write_str(name)
    }
}

/// the deserialization target of a setting's payload, fixed at registry load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    #[serde(alias = "IdList")]
    IdList,
    #[serde(alias = "StringList")]
    StringList,
    #[serde(alias = "Records")]
    Records,
    #[serde(alias = "Map")]
    Map,
    #[default]
    #[serde(alias = "Document")]
    Document,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::IdList => "id list",
            ResourceType::StringList => "string list",
            ResourceType::Records => "record list",
            ResourceType::Map => "map",
            ResourceType::Document => "document",
        };
        f.write_str(name)
    }
}

/// provider filter for a resolution pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFilter {
    All,
    Only(ProviderKind),
}

impl ProviderFilter {
    pub fn matches(&self, kind: ProviderKind) -> bool {
        match self {
            ProviderFilter::All => true,
            ProviderFilter::Only(k) => *k == kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SettingDescriptor {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(alias = "Provider")]
    pub provider: ProviderKind,
    /// fetch path template, or the literal text for inline settings
    #[serde(default, alias = "Path")]
    pub path: String,
    /// seconds; also the hot-tier ttl of the setting
    #[serde(default, alias = "ReloadInterval")]
    pub reload_interval: Option<u64>,
    #[serde(default, alias = "DependsOn")]
    pub depends_on: Option<String>,
    #[serde(default, alias = "ResourceType")]
    pub resource_type: ResourceType,
    /// seconds allowed for a queued reload of this setting
    #[serde(default, alias = "Timeout")]
    pub timeout: Option<u64>,
}

impl SettingDescriptor {
    pub fn new(name: &str, provider: ProviderKind, path: &str) -> SettingDescriptor {
        SettingDescriptor {
            name: name.to_string(),
            provider,
            path: path.to_string(),
            reload_interval: None,
            depends_on: None,
            resource_type: ResourceType::default(),
            timeout: None,
        }
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn with_depends_on(mut self, target: &str) -> Self {
        self.depends_on = Some(target.to_string());
        self
    }

    pub fn with_reload_interval(mut self, seconds: u64) -> Self {
        self.reload_interval = Some(seconds);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn reload_interval(&self) -> Option<Duration> {
        self.reload_interval.map(Duration::from_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    /// render the path template into one or more concrete fetch paths.
    ///
    /// `{version}` and `{name}` are always substituted; `{ids}` becomes the comma-joined
    /// dependency keys; `{id}` produces one path per key (none when there are no keys).
    pub fn render_paths(&self, version: &str, keys: &[String]) -> Vec<String> {
        let template = if self.path.is_empty() && self.provider == ProviderKind::ObjectStore {
            OBJECT_KEY_TEMPLATE
        } else {
            self.path.as_str()
        };

        let base = template
            .replace("{version}", version)
            .replace("{name}", &self.name);

        if base.contains("{id}") {
            keys.iter().map(|k| base.replace("{id}", k)).collect()
        } else {
            vec![base.replace("{ids}", &keys.join(","))]
        }
    }

    /// true when the template fans out into one request per dependency key
    pub fn fans_out(&self) -> bool {
        self.path.contains("{id}")
    }
}

/// the immutable table of setting descriptors
#[derive(Debug, Clone, Default)]
pub struct SettingRegistry {
    descriptors: Vec<SettingDescriptor>,
    index: HashMap<String, usize>,
}

impl SettingRegistry {
    /// build and validate the registry; names must be unique, reload intervals non-zero and
    /// dependencies acyclic
    pub fn new(descriptors: Vec<SettingDescriptor>) -> Result<SettingRegistry> {
        let mut index = HashMap::with_capacity(descriptors.len());
        for (idx, d) in descriptors.iter().enumerate() {
            if d.name.trim().is_empty() {
                return Err(StaticDataError::Registry(format!(
                    "row {} has an empty name",
                    idx
                )));
            }
            if d.reload_interval == Some(0) {
                return Err(StaticDataError::Registry(format!(
                    "{} has a zero reload interval",
                    d.name
                )));
            }
            if index.insert(d.name.clone(), idx).is_some() {
                return Err(StaticDataError::Registry(format!(
                    "duplicate setting name: {}",
                    d.name
                )));
            }
        }

        let registry = SettingRegistry { descriptors, index };

        for d in registry.descriptors.iter() {
            if let Some(target) = &d.depends_on {
                if !registry.index.contains_key(target) {
                    return Err(StaticDataError::Registry(format!(
                        "{} depends on unknown setting {}",
                        d.name, target
                    )));
                }
            }
            registry.check_cycle(d)?;
        }

        Ok(registry)
    }

    fn check_cycle(&self, start: &SettingDescriptor) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut current = start;
        seen.insert(current.name.as_str());

        while let Some(target) = &current.depends_on {
            if !seen.insert(target.as_str()) {
                return Err(StaticDataError::Registry(format!(
                    "dependency cycle through {}",
                    start.name
                )));
            }
            match self.get(target) {
                Some(next) => current = next,
                None => break,
            }
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SettingDescriptor> {
        self.index.get(name).map(|idx| &self.descriptors[*idx])
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SettingDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// the rows matched by the provider filter and the optional key list, in registry order
    pub fn scope(&self, filter: ProviderFilter, keys: Option<&[String]>) -> Vec<&SettingDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| filter.matches(d.provider))
            .filter(|d| keys.map_or(true, |ks| ks.iter().any(|k| k == &d.name)))
            .collect()
    }

    /// chain depth of a setting: 0 for rows with no dependency
    pub fn depth(&self, name: &str) -> usize {
        let mut depth = 0;
        let mut current = self.get(name);
        while let Some(target) = current.and_then(|d| d.depends_on.as_deref()) {
            depth += 1;
            current = self.get(target);
        }
        depth
    }

    /// distinct dependency targets referenced by the given rows, including transitive ones,
    /// ordered so that every target comes after the targets it depends on
    pub fn dependency_targets(&self, scope: &[&SettingDescriptor]) -> Vec<String> {
        let mut targets: Vec<String> = vec![];
        let mut pending: Vec<String> = scope
            .iter()
            .filter_map(|d| d.depends_on.clone())
            .collect();

        while let Some(name) = pending.pop() {
            if targets.contains(&name) {
                continue;
            }
            if let Some(next) = self.get(&name).and_then(|d| d.depends_on.clone()) {
                pending.push(next);
            }
            targets.push(name);
        }

        targets.sort_by_key(|name| (self.depth(name), self.position(name)));
        targets
    }
}
