use crate::config::Config;
use crate::connector::{ConnectorKind, ConnectorRegistry, HostEntry};
use crate::error::InfraError;
use crate::host::{Host, HostData, SharedHost};
use crate::Result;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

fn to_map(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(InfraError::InventoryError(format!(
            "Data must be an object, got: {}",
            other
        ))),
    }
}

/// 主机清单：主机按声明顺序保存
pub struct Inventory {
    hosts: Vec<SharedHost>,
    names: Vec<String>,
    index: HashMap<String, usize>,
    groups: HashMap<String, Vec<String>>,
    group_order: Vec<String>,
    data: Arc<Map<String, Value>>,
}

impl std::fmt::Debug for Inventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inventory")
            .field("hosts", &self.names)
            .field("groups", &self.group_order)
            .finish()
    }
}

impl Inventory {
    pub fn builder(config: Arc<Config>) -> InventoryBuilder {
        InventoryBuilder::new(config)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> &[SharedHost] {
        &self.hosts
    }

    pub fn host_names(&self) -> &[String] {
        &self.names
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn get_host(&self, name: &str) -> Result<SharedHost> {
        self.index
            .get(name)
            .map(|&i| self.hosts[i].clone())
            .ok_or_else(|| InfraError::HostNotFound(name.to_string()))
    }

    pub fn get_group(&self, name: &str) -> Result<Vec<SharedHost>> {
        let members = self
            .groups
            .get(name)
            .ok_or_else(|| InfraError::GroupNotFound(name.to_string()))?;
        members.iter().map(|host| self.get_host(host)).collect()
    }

    pub fn group_names(&self) -> &[String] {
        &self.group_order
    }

    /// 按声明顺序遍历仍处于活动状态的主机
    pub fn iter_active<'a>(
        &'a self,
        active: &'a HashSet<String>,
    ) -> impl Iterator<Item = (&'a str, &'a SharedHost)> + 'a {
        self.names
            .iter()
            .zip(self.hosts.iter())
            .filter(move |(name, _)| active.contains(name.as_str()))
            .map(|(name, host)| (name.as_str(), host))
    }
}

struct GroupSpec {
    name: String,
    members: Vec<String>,
    data: Arc<Map<String, Value>>,
}

/// 构建 Inventory；`@name` 或 `@name/arg` 由对应连接器展开
pub struct InventoryBuilder {
    config: Arc<Config>,
    registry: ConnectorRegistry,
    targets: Vec<(String, Map<String, Value>)>,
    groups: Vec<GroupSpec>,
    data: Map<String, Value>,
}

impl InventoryBuilder {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            registry: ConnectorRegistry::with_defaults(),
            targets: Vec::new(),
            groups: Vec::new(),
            data: Map::new(),
        }
    }

    pub fn with_registry(mut self, registry: ConnectorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn host(self, name: impl Into<String>) -> Self {
        self.push_target(name.into(), Map::new())
    }

    pub fn host_with_data(self, name: impl Into<String>, data: Value) -> Result<Self> {
        let data = to_map(data)?;
        Ok(self.push_target(name.into(), data))
    }

    fn push_target(mut self, name: String, data: Map<String, Value>) -> Self {
        self.targets.push((name, data));
        self
    }

    pub fn group(mut self, name: impl Into<String>, members: &[&str], data: Value) -> Result<Self> {
        self.groups.push(GroupSpec {
            name: name.into(),
            members: members.iter().map(|m| m.to_string()).collect(),
            data: Arc::new(to_map(data)?),
        });
        Ok(self)
    }

    pub fn data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// 把一个声明目标展开成 (主机条目, 负责执行的连接器)
    fn expand(&self, target: &str) -> Result<Vec<(HostEntry, Arc<dyn ConnectorKind>)>> {
        let Some(spec) = target.strip_prefix('@') else {
            let kind = self.registry.get(&self.config.default_connector)?;
            return Ok(vec![(HostEntry::new(target), kind)]);
        };

        let (kind_name, selector) = match spec.split_once('/') {
            Some((kind, selector)) => (kind, Some(selector)),
            None => (spec, None),
        };
        let kind = self.registry.get(kind_name)?;
        let executor = if kind.handles_execution() {
            kind.clone()
        } else {
            self.registry.get(&self.config.default_connector)?
        };

        let entries = kind.make_names_data(selector)?;
        debug!("Expanded {} into {} hosts", target, entries.len());
        Ok(entries
            .into_iter()
            .map(|entry| (entry, executor.clone()))
            .collect())
    }

    pub fn build(self) -> Result<Inventory> {
        let declared: HashSet<&str> = self.targets.iter().map(|(name, _)| name.as_str()).collect();
        for group in &self.groups {
            if let Some(missing) = group.members.iter().find(|m| !declared.contains(m.as_str())) {
                return Err(InfraError::HostNotFound(missing.clone()));
            }
        }

        let inventory_data = Arc::new(self.data.clone());
        let mut inventory = Inventory {
            hosts: Vec::new(),
            names: Vec::new(),
            index: HashMap::new(),
            groups: HashMap::new(),
            group_order: self.groups.iter().map(|g| g.name.clone()).collect(),
            data: inventory_data.clone(),
        };

        for (target, target_data) in &self.targets {
            // 声明时所属的组按声明顺序排列
            let alias_groups: Vec<&GroupSpec> = self
                .groups
                .iter()
                .filter(|g| g.members.iter().any(|m| m == target))
                .collect();

            for (entry, kind) in self.expand(target)? {
                if inventory.index.contains_key(&entry.name) {
                    return Err(InfraError::InventoryError(format!(
                        "Duplicate host in inventory: {}",
                        entry.name
                    )));
                }

                let mut groups: Vec<String> = alias_groups.iter().map(|g| g.name.clone()).collect();
                for group in &entry.groups {
                    if !groups.contains(group) {
                        groups.push(group.clone());
                    }
                }

                let mut host_data = entry.data.clone();
                host_data.extend(target_data.iter().map(|(k, v)| (k.clone(), v.clone())));

                let mut layers = vec![Arc::new(host_data)];
                layers.extend(alias_groups.iter().rev().map(|g| g.data.clone()));
                layers.push(inventory_data.clone());
                let data = HostData::new(layers);

                let connector = kind.build(&entry.name, &data.merged(), &self.config)?;
                let host = Host::new(
                    entry.name.clone(),
                    groups.clone(),
                    data,
                    kind.name(),
                    connector,
                    self.config.clone(),
                );

                for group in &groups {
                    inventory
                        .groups
                        .entry(group.clone())
                        .or_default()
                        .push(entry.name.clone());
                    if !inventory.group_order.contains(group) {
                        inventory.group_order.push(group.clone());
                    }
                }
                inventory.index.insert(entry.name.clone(), inventory.hosts.len());
                inventory.names.push(entry.name);
                inventory.hosts.push(Arc::new(Mutex::new(host)));
            }
        }

        // 声明了但没有成员的组仍可查询
        for group in &self.groups {
            inventory.groups.entry(group.name.clone()).or_default();
        }

        Ok(inventory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Connector, ConnectorKind};
    use crate::host::lock_host;
    use serde_json::json;

    struct ListKind;

    impl ConnectorKind for ListKind {
        fn name(&self) -> &str {
            "list"
        }

        fn handles_execution(&self) -> bool {
            false
        }

        fn make_names_data(&self, selector: Option<&str>) -> Result<Vec<HostEntry>> {
            let prefix = selector.unwrap_or("node");
            Ok((1..=2)
                .map(|i| {
                    let mut entry = HostEntry::new(format!("{}{}", prefix, i))
                        .with_data("index", json!(i));
                    entry.groups.push("listed".to_string());
                    entry
                })
                .collect())
        }

        fn build(
            &self,
            _host_name: &str,
            _data: &Map<String, Value>,
            _config: &Config,
        ) -> Result<Box<dyn Connector>> {
            Err(InfraError::NotSupported("list does not execute".to_string()))
        }
    }

    fn builder() -> InventoryBuilder {
        let mut registry = ConnectorRegistry::with_defaults();
        registry.register(Arc::new(ListKind));
        Inventory::builder(Arc::new(Config::default())).with_registry(registry)
    }

    #[test]
    fn test_group_data_precedence() {
        let inventory = builder()
            .host_with_data("web1", json!({"role": "primary"}))
            .unwrap()
            .host("web2")
            .group("early", &["web1", "web2"], json!({"role": "early", "dc": "a"}))
            .unwrap()
            .group("late", &["web2"], json!({"role": "late"}))
            .unwrap()
            .data("dc", json!("global"))
            .data("env", json!("prod"))
            .build()
            .unwrap();

        let web1 = inventory.get_host("web1").unwrap();
        let web1 = lock_host(&web1);
        assert_eq!(web1.data.get_str("role"), Some("primary"));
        assert_eq!(web1.data.get_str("dc"), Some("a"));
        assert_eq!(web1.connector_name, "ssh");

        let web2 = inventory.get_host("web2").unwrap();
        let web2 = lock_host(&web2);
        assert_eq!(web2.data.get_str("role"), Some("late"));
        assert_eq!(web2.data.get_str("env"), Some("prod"));
        assert_eq!(web2.groups, vec!["early", "late"]);
    }

    #[test]
    fn test_connector_expansion_inherits_alias_groups() {
        let inventory = builder()
            .host("@list/db")
            .host("@local")
            .group("databases", &["@list/db"], json!({"engine": "pg"}))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(inventory.host_names(), &["db1", "db2", "@local"]);
        let db2 = inventory.get_host("db2").unwrap();
        let db2 = lock_host(&db2);
        assert_eq!(db2.groups, vec!["databases", "listed"]);
        assert_eq!(db2.data.get("index"), Some(&json!(2)));
        assert_eq!(db2.data.get_str("engine"), Some("pg"));
        // 不负责执行的连接器展开出的主机交给 ssh
        assert_eq!(db2.connector_name, "ssh");

        assert_eq!(inventory.get_group("databases").unwrap().len(), 2);
        assert_eq!(inventory.get_group("@local").unwrap().len(), 1);
    }

    #[test]
    fn test_lookup_errors() {
        let inventory = builder().host("web1").build().unwrap();
        match inventory.get_host("nope") {
            Err(InfraError::HostNotFound(name)) => assert_eq!(name, "nope"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        match inventory.get_group("nope") {
            Err(InfraError::GroupNotFound(name)) => assert_eq!(name, "nope"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        let unknown = builder().host("@docker/web").build();
        assert!(matches!(unknown, Err(InfraError::UnknownConnector(name)) if name == "docker"));

        let missing_member = builder()
            .host("web1")
            .group("g", &["web9"], Value::Null)
            .unwrap()
            .build();
        assert!(matches!(missing_member, Err(InfraError::HostNotFound(name)) if name == "web9"));
    }

    #[test]
    fn test_iter_active_keeps_declaration_order() {
        let inventory = builder().host("c").host("a").host("b").build().unwrap();
        let active: HashSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
        let names: Vec<&str> = inventory.iter_active(&active).map(|(name, _)| name).collect();
        assert_eq!(names, vec!["c", "b"]);
    }
}
