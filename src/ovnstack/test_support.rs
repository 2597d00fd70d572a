#![allow(dead_code)]

//! In-memory collaborators for tests: a control plane that understands the
//! commands this crate issues, a namespace switch that records transitions,
//! and per-test output directories.

use crate::ovnstack::cni::netns::{EnteredNamespace, NamespaceSwitch};
use crate::ovnstack::config::OverlayConfig;
use crate::ovnstack::ovsdb::{render_command, ControlPlaneDriver, DriverError, Tool};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

thread_local! {
    static FAKE_NAMESPACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// The namespace [`FakeNamespaces`] has switched the calling thread into.
pub fn current_fake_namespace() -> Option<String> {
    FAKE_NAMESPACE.with(|current| current.borrow().clone())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub const LOGICAL_ROUTER: &str = "logical_router";
pub const LOGICAL_SWITCH: &str = "logical_switch";
pub const LOGICAL_ROUTER_PORT: &str = "logical_router_port";
pub const LOGICAL_SWITCH_PORT: &str = "logical_switch_port";
pub const LOAD_BALANCER: &str = "load_balancer";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    pub uuid: String,
    pub parent: Option<String>,
    pub columns: BTreeMap<String, String>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns.get(column).map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticRoute {
    pub prefix: String,
    pub nexthop: String,
    pub policy: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NatRule {
    pub kind: String,
    pub external_ip: String,
    pub logical_ip: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    /// `None` is the host namespace.
    pub namespace: Option<String>,
    pub mac: Option<String>,
    pub up: bool,
    pub hairpin: bool,
    pub addresses: Vec<String>,
    pub peer: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostRoute {
    pub namespace: Option<String>,
    pub prefix: String,
    pub via: Option<String>,
    pub dev: Option<String>,
}

/// Everything the fake control plane knows. Cloned wholesale by
/// [`FakeControlPlane::snapshot`] so runs can be compared.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FakeState {
    pub northbound: BTreeMap<String, BTreeMap<String, Row>>,
    pub routes: BTreeMap<String, Vec<StaticRoute>>,
    pub nat: BTreeMap<String, Vec<NatRule>>,
    pub switch_load_balancers: BTreeMap<String, Vec<String>>,
    pub router_load_balancers: BTreeMap<String, Vec<String>>,
    pub system: BTreeMap<String, String>,
    pub bridges: BTreeMap<String, Row>,
    pub interfaces: BTreeMap<String, Row>,
    pub links: Vec<Link>,
    pub host_routes: Vec<HostRoute>,
    next_id: u64,
}

impl FakeState {
    fn table(&self, table: &str) -> Option<&BTreeMap<String, Row>> {
        self.northbound.get(table)
    }

    fn row(&self, table: &str, name: &str) -> Option<&Row> {
        let rows = self.table(table)?;
        rows.get(name)
            .or_else(|| rows.values().find(|row| row.uuid == name))
    }

    fn row_key(&self, table: &str, name: &str) -> Option<String> {
        let rows = self.table(table)?;
        if rows.contains_key(name) {
            return Some(name.to_string());
        }
        rows.iter()
            .find(|(_, row)| row.uuid == name)
            .map(|(key, _)| key.clone())
    }

    pub fn router(&self, name: &str) -> Option<&Row> {
        self.row(LOGICAL_ROUTER, name)
    }

    pub fn switch(&self, name: &str) -> Option<&Row> {
        self.row(LOGICAL_SWITCH, name)
    }

    pub fn router_port(&self, name: &str) -> Option<&Row> {
        self.row(LOGICAL_ROUTER_PORT, name)
    }

    pub fn switch_port(&self, name: &str) -> Option<&Row> {
        self.row(LOGICAL_SWITCH_PORT, name)
    }

    pub fn rows(&self, table: &str) -> Vec<&Row> {
        self.table(table)
            .map(|rows| rows.values().collect())
            .unwrap_or_default()
    }

    pub fn load_balancer_tagged(&self, key: &str, value: &str) -> Option<&Row> {
        self.rows(LOAD_BALANCER)
            .into_iter()
            .find(|row| row.get(key) == Some(value))
    }

    pub fn routes_of(&self, router: &str) -> &[StaticRoute] {
        self.routes.get(router).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn nat_of(&self, router: &str) -> &[NatRule] {
        self.nat.get(router).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn link(&self, namespace: Option<&str>, name: &str) -> Option<&Link> {
        self.links
            .iter()
            .find(|link| link.name == name && link.namespace.as_deref() == namespace)
    }

    fn link_mut(&mut self, namespace: Option<&str>, name: &str) -> Option<&mut Link> {
        self.links
            .iter_mut()
            .find(|link| link.name == name && link.namespace.as_deref() == namespace)
    }

    fn next_uuid(&mut self) -> String {
        self.next_id += 1;
        format!("00000000-0000-0000-0000-{:012x}", self.next_id)
    }

    fn next_mac(&mut self) -> String {
        self.next_id += 1;
        format!("0a:00:00:00:{:02x}:{:02x}", (self.next_id >> 8) & 0xff, self.next_id & 0xff)
    }
}

/// One `--`-separated command with its leading options split off.
struct Invocation {
    options: Vec<String>,
    words: Vec<String>,
}

impl Invocation {
    fn has(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }

    fn option_value(&self, prefix: &str) -> Option<&str> {
        self.options.iter().find_map(|o| o.strip_prefix(prefix))
    }

    fn arg(&self, index: usize) -> Result<&str, String> {
        self.words
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| format!("'{}' expects more arguments", self.words.join(" ")))
    }
}

fn split_commands(args: &[String]) -> Vec<Invocation> {
    args.split(|arg| arg == "--")
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let split = segment
                .iter()
                .position(|word| !word.starts_with("--"))
                .unwrap_or(segment.len());
            Invocation {
                options: segment[..split].to_vec(),
                words: segment[split..].to_vec(),
            }
        })
        .collect()
}

fn unquote(value: &str) -> String {
    value.trim_matches('"').to_string()
}

fn settings(words: &[String]) -> Result<Vec<(String, String)>, String> {
    words
        .iter()
        .map(|word| {
            word.split_once('=')
                .map(|(k, v)| (k.to_string(), unquote(v)))
                .ok_or_else(|| format!("invalid setting '{word}'"))
        })
        .collect()
}

fn quoted(value: &str) -> String {
    format!("\"{value}\"")
}

/// In-memory northbound database, switch database and link table.
pub struct FakeControlPlane {
    state: Mutex<FakeState>,
    invocations: Mutex<Vec<(Tool, Vec<String>)>>,
    failures: Mutex<Vec<(Tool, String)>>,
}

impl Default for FakeControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeControlPlane {
    /// A host with `br-int`, a chassis id and a northbound address set.
    pub fn new() -> Self {
        let mut state = FakeState::default();
        state
            .system
            .insert("ovn-nb".into(), "tcp:127.0.0.1:6641".into());
        state.system.insert("system-id".into(), "chassis-1".into());
        let mut bridge = Row {
            uuid: state.next_uuid(),
            ..Row::default()
        };
        bridge.columns.insert("name".into(), "br-int".into());
        bridge
            .columns
            .insert("mac_in_use".into(), state.next_mac());
        state.bridges.insert("br-int".into(), bridge);
        FakeControlPlane {
            state: Mutex::new(state),
            invocations: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_system_id(&self, key: &str, value: Option<&str>) {
        let mut state = lock(&self.state);
        match value {
            Some(value) => state.system.insert(key.to_string(), value.to_string()),
            None => state.system.remove(key),
        };
    }

    pub fn add_bridge(&self, name: &str, mac: &str) {
        let mut state = lock(&self.state);
        let mut row = Row {
            uuid: state.next_uuid(),
            ..Row::default()
        };
        row.columns.insert("name".into(), name.into());
        row.columns.insert("mac_in_use".into(), mac.into());
        state.bridges.insert(name.to_string(), row);
    }

    /// Adds a kernel link; `namespace` `None` is the host.
    pub fn add_link(&self, namespace: Option<&str>, name: &str, mac: &str) {
        lock(&self.state).links.push(Link {
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            mac: Some(mac.to_string()),
            up: false,
            hairpin: false,
            addresses: Vec::new(),
            peer: None,
        });
    }

    /// Drops a kernel link without touching its peer, as when the runtime
    /// tore the container end down first.
    pub fn remove_link(&self, namespace: Option<&str>, name: &str) {
        lock(&self.state)
            .links
            .retain(|link| !(link.name == name && link.namespace.as_deref() == namespace));
    }

    /// Every later command whose rendered form contains `needle` fails.
    pub fn fail_on(&self, tool: Tool, needle: &str) {
        lock(&self.failures).push((tool, needle.to_string()));
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    pub fn invocations(&self) -> Vec<(Tool, Vec<String>)> {
        lock(&self.invocations).clone()
    }

    /// Invocations rendered as shell command lines.
    pub fn commands(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(|(tool, args)| render_command(*tool, args))
            .collect()
    }

    pub fn clear_invocations(&self) {
        lock(&self.invocations).clear();
    }

    pub fn snapshot(&self) -> FakeState {
        lock(&self.state).clone()
    }

    fn execute(&self, state: &mut FakeState, tool: Tool, args: &[String]) -> Result<Vec<String>, String> {
        match tool {
            Tool::Northbound => {
                let mut out = Vec::new();
                for invocation in split_commands(args) {
                    out.extend(northbound(state, &invocation)?);
                }
                Ok(out)
            }
            Tool::Switch => {
                let mut out = Vec::new();
                for invocation in split_commands(args) {
                    out.extend(switch_db(state, &invocation)?);
                }
                Ok(out)
            }
            Tool::Ip => ip(state, args),
            Tool::Bridge => bridge(state, args),
        }
    }
}

impl ControlPlaneDriver for FakeControlPlane {
    fn run(&self, tool: Tool, args: &[String]) -> Result<Vec<String>, DriverError> {
        lock(&self.invocations).push((tool, args.to_vec()));
        let command = render_command(tool, args);
        let injected = lock(&self.failures)
            .iter()
            .any(|(failing, needle)| *failing == tool && command.contains(needle.as_str()));
        if injected {
            return Err(DriverError::Failed {
                command,
                status: "1".to_string(),
                stderr: "injected failure".to_string(),
            });
        }

        let mut state = lock(&self.state);
        let mut working = state.clone();
        match self.execute(&mut working, tool, args) {
            Ok(lines) => {
                *state = working;
                Ok(lines)
            }
            Err(stderr) => Err(DriverError::Failed {
                command,
                status: "1".to_string(),
                stderr,
            }),
        }
    }
}

fn insert_named(state: &mut FakeState, table: &str, name: &str, parent: Option<&str>) {
    let mut row = Row {
        uuid: state.next_uuid(),
        parent: parent.map(str::to_string),
        ..Row::default()
    };
    row.columns.insert("name".into(), name.into());
    state
        .northbound
        .entry(table.to_string())
        .or_default()
        .insert(name.to_string(), row);
}

fn ensure_absent(state: &FakeState, invocation: &Invocation, table: &str, name: &str) -> Result<bool, String> {
    if state.row(table, name).is_some() {
        if invocation.has("--may-exist") {
            return Ok(false);
        }
        return Err(format!("{name}: a {table} with this name already exists"));
    }
    Ok(true)
}

fn require_row(state: &FakeState, table: &str, name: &str) -> Result<(), String> {
    state
        .row(table, name)
        .map(|_| ())
        .ok_or_else(|| format!("{name}: {table} not found"))
}

fn northbound(state: &mut FakeState, inv: &Invocation) -> Result<Vec<String>, String> {
    let verb = inv.arg(0)?;
    match verb {
        "lr-add" | "ls-add" => {
            let table = if verb == "lr-add" { LOGICAL_ROUTER } else { LOGICAL_SWITCH };
            let name = inv.arg(1)?;
            if ensure_absent(state, inv, table, name)? {
                insert_named(state, table, name, None);
            }
            Ok(Vec::new())
        }
        "lrp-add" => {
            let router = inv.arg(1)?;
            let port = inv.arg(2)?;
            let mac = inv.arg(3)?;
            let networks: Vec<String> = inv.words[4..].iter().map(|n| n.replace('\\', "/")).collect();
            if networks.is_empty() {
                return Err("lrp-add requires at least one network".into());
            }
            require_row(state, LOGICAL_ROUTER, router)?;
            if let Some(existing) = state.router_port(port) {
                if !inv.has("--may-exist") {
                    return Err(format!("{port}: a port with this name already exists"));
                }
                if existing.get("mac") != Some(mac) {
                    return Err(format!("{port}: port already exists with different mac"));
                }
                return Ok(Vec::new());
            }
            insert_named(state, LOGICAL_ROUTER_PORT, port, Some(router));
            if let Some(row) = state
                .northbound
                .get_mut(LOGICAL_ROUTER_PORT)
                .and_then(|rows| rows.get_mut(port))
            {
                row.columns.insert("mac".into(), mac.into());
                row.columns.insert("networks".into(), networks.join(" "));
            }
            Ok(Vec::new())
        }
        "lsp-add" => {
            let switch = inv.arg(1)?;
            let port = inv.arg(2)?;
            require_row(state, LOGICAL_SWITCH, switch)?;
            if ensure_absent(state, inv, LOGICAL_SWITCH_PORT, port)? {
                insert_named(state, LOGICAL_SWITCH_PORT, port, Some(switch));
            }
            Ok(Vec::new())
        }
        "lsp-set-addresses" => {
            let port = inv.arg(1)?.to_string();
            let addresses = inv.words[2..].join(",");
            let row = state
                .northbound
                .get_mut(LOGICAL_SWITCH_PORT)
                .and_then(|rows| rows.get_mut(&port))
                .ok_or_else(|| format!("{port}: logical switch port not found"))?;
            row.columns.insert("addresses".into(), addresses);
            Ok(Vec::new())
        }
        "set" => {
            let table = inv.arg(1)?.to_string();
            let record = inv.arg(2)?;
            let key = state
                .row_key(&table, record)
                .ok_or_else(|| format!("no row \"{record}\" in table {table}"))?;
            let pairs = settings(&inv.words[3..])?;
            if let Some(row) = state
                .northbound
                .get_mut(&table)
                .and_then(|rows| rows.get_mut(&key))
            {
                for (column, value) in pairs {
                    row.columns.insert(column, value);
                }
            }
            Ok(Vec::new())
        }
        "get" => {
            let table = inv.arg(1)?;
            let record = inv.arg(2)?;
            let column = inv.arg(3)?;
            let Some(row) = state.row(table, record) else {
                if inv.has("--if-exists") {
                    return Ok(Vec::new());
                }
                return Err(format!("no row \"{record}\" in table {table}"));
            };
            Ok(render_get(row, column, inv.has("--if-exists"))?)
        }
        "find" => {
            let table = inv.arg(1)?;
            let column = inv.option_value("--columns=").unwrap_or("_uuid");
            let conditions = &inv.words[2..];
            let mut out = Vec::new();
            for row in state.rows(table) {
                if !conditions.iter().all(|cond| matches(row, cond)) {
                    continue;
                }
                let value = if column == "_uuid" {
                    Some(row.uuid.as_str())
                } else {
                    row.get(column)
                };
                if let Some(value) = value {
                    out.push(value.to_string());
                }
            }
            Ok(out)
        }
        "create" => {
            let table = inv.arg(1)?.to_string();
            let uuid = state.next_uuid();
            let mut row = Row {
                uuid: uuid.clone(),
                ..Row::default()
            };
            for (column, value) in settings(&inv.words[2..])? {
                row.columns.insert(column, value);
            }
            state
                .northbound
                .entry(table)
                .or_default()
                .insert(uuid.clone(), row);
            Ok(vec![uuid])
        }
        "lr-route-add" => {
            let router = inv.arg(1)?.to_string();
            let prefix = inv.arg(2)?.to_string();
            let nexthop = inv.arg(3)?.to_string();
            require_row(state, LOGICAL_ROUTER, &router)?;
            let policy = inv.option_value("--policy=").unwrap_or("dst-ip").to_string();
            let routes = state.routes.entry(router).or_default();
            if let Some(existing) = routes
                .iter_mut()
                .find(|route| route.prefix == prefix && route.policy == policy)
            {
                if !inv.has("--may-exist") {
                    return Err(format!("duplicate prefix: {prefix}"));
                }
                existing.nexthop = nexthop;
                return Ok(Vec::new());
            }
            routes.push(StaticRoute {
                prefix,
                nexthop,
                policy,
            });
            Ok(Vec::new())
        }
        "lr-nat-add" => {
            let router = inv.arg(1)?.to_string();
            let kind = inv.arg(2)?.to_string();
            let external_ip = inv.arg(3)?.to_string();
            let logical_ip = inv.arg(4)?.to_string();
            require_row(state, LOGICAL_ROUTER, &router)?;
            let rules = state.nat.entry(router).or_default();
            if let Some(existing) = rules
                .iter_mut()
                .find(|rule| rule.kind == kind && rule.logical_ip == logical_ip)
            {
                if !inv.has("--may-exist") {
                    return Err(format!("a NAT with this type ({kind}) and logical_ip ({logical_ip}) already exists"));
                }
                existing.external_ip = external_ip;
                return Ok(Vec::new());
            }
            rules.push(NatRule {
                kind,
                external_ip,
                logical_ip,
            });
            Ok(Vec::new())
        }
        "ls-lb-add" | "lr-lb-add" => {
            let owner = inv.arg(1)?.to_string();
            let lb = inv.arg(2)?;
            let owner_table = if verb == "ls-lb-add" { LOGICAL_SWITCH } else { LOGICAL_ROUTER };
            require_row(state, owner_table, &owner)?;
            let uuid = state
                .row(LOAD_BALANCER, lb)
                .map(|row| row.uuid.clone())
                .ok_or_else(|| format!("{lb}: load balancer not found"))?;
            let attached = if verb == "ls-lb-add" {
                state.switch_load_balancers.entry(owner).or_default()
            } else {
                state.router_load_balancers.entry(owner).or_default()
            };
            if attached.contains(&uuid) {
                if !inv.has("--may-exist") {
                    return Err(format!("{lb}: load balancer already attached"));
                }
            } else {
                attached.push(uuid);
            }
            Ok(Vec::new())
        }
        other => Err(format!("unsupported ovn-nbctl command '{other}'")),
    }
}

fn render_get(row: &Row, column: &str, if_exists: bool) -> Result<Vec<String>, String> {
    match row.get(column) {
        Some(value) if column == "networks" => {
            let items: Vec<String> = value.split(' ').map(quoted).collect();
            Ok(vec![format!("[{}]", items.join(", "))])
        }
        Some(value) => Ok(vec![quoted(value)]),
        None if if_exists || !column.contains(':') => Ok(Vec::new()),
        None => Err(format!("no key \"{column}\" in row")),
    }
}

fn matches(row: &Row, condition: &str) -> bool {
    if let Some(column) = condition.strip_suffix("!=null") {
        return row.get(column).is_some();
    }
    match condition.split_once('=') {
        Some((column, expected)) => {
            let actual = if column == "_uuid" {
                Some(row.uuid.as_str())
            } else {
                row.get(column)
            };
            actual == Some(unquote(expected).as_str())
        }
        None => false,
    }
}

fn switch_db(state: &mut FakeState, inv: &Invocation) -> Result<Vec<String>, String> {
    let verb = inv.arg(0)?;
    match verb {
        "get" => {
            let table = inv.arg(1)?;
            let record = inv.arg(2)?;
            let column = inv.arg(3)?;
            let row = match table {
                "Open_vSwitch" => {
                    let key = column.strip_prefix("external_ids:").unwrap_or(column);
                    return match state.system.get(key) {
                        Some(value) => Ok(vec![quoted(value)]),
                        None if inv.has("--if-exists") => Ok(Vec::new()),
                        None => Err(format!("no key \"{key}\" in Open_vSwitch record \".\"")),
                    };
                }
                "interface" | "Interface" => state
                    .interfaces
                    .get(record)
                    .or_else(|| state.bridges.get(record)),
                "bridge" | "Bridge" => state.bridges.get(record),
                other => return Err(format!("unknown table \"{other}\"")),
            };
            match row {
                Some(row) => render_get(row, column, inv.has("--if-exists")),
                None if inv.has("--if-exists") => Ok(Vec::new()),
                None => Err(format!("no row \"{record}\" in table {table}")),
            }
        }
        "add-port" => {
            let bridge = inv.arg(1)?.to_string();
            let port = inv.arg(2)?.to_string();
            if !state.bridges.contains_key(&bridge) {
                return Err(format!("no bridge named {bridge}"));
            }
            if state.interfaces.contains_key(&port) {
                if inv.has("--may-exist") {
                    return Ok(Vec::new());
                }
                return Err(format!("cannot create a port named {port} because a port named {port} already exists"));
            }
            let mac = match state.link(None, &port).and_then(|link| link.mac.clone()) {
                Some(mac) => mac,
                None => state.next_mac(),
            };
            let mut row = Row {
                uuid: state.next_uuid(),
                parent: Some(bridge),
                ..Row::default()
            };
            row.columns.insert("name".into(), port.clone());
            row.columns.insert("mac_in_use".into(), mac);
            state.interfaces.insert(port, row);
            Ok(Vec::new())
        }
        "set" => {
            let table = inv.arg(1)?;
            let record = inv.arg(2)?.to_string();
            let pairs = settings(&inv.words[3..])?;
            let internal = pairs.iter().any(|(k, v)| k == "type" && v == "internal");
            let row = match table {
                "interface" | "Interface" => state.interfaces.get_mut(&record),
                "bridge" | "Bridge" => state.bridges.get_mut(&record),
                other => return Err(format!("unknown table \"{other}\"")),
            }
            .ok_or_else(|| format!("no row \"{record}\" in table {table}"))?;
            for (column, value) in pairs {
                row.columns.insert(column, value);
            }
            let mac = row.get("mac_in_use").map(str::to_string);
            if internal && state.link(None, &record).is_none() {
                state.links.push(Link {
                    name: record,
                    namespace: None,
                    mac,
                    up: false,
                    hairpin: false,
                    addresses: Vec::new(),
                    peer: None,
                });
            }
            Ok(Vec::new())
        }
        "del-port" => {
            let port = inv.arg(1)?;
            if state.interfaces.remove(port).is_none() && !inv.has("--if-exists") {
                return Err(format!("no port named {port}"));
            }
            Ok(Vec::new())
        }
        other => Err(format!("unsupported ovs-vsctl command '{other}'")),
    }
}

fn missing_device(name: &str) -> String {
    format!("Device \"{name}\" does not exist.")
}

fn ip(state: &mut FakeState, args: &[String]) -> Result<Vec<String>, String> {
    let namespace = current_fake_namespace();
    let ns = namespace.as_deref();
    let words: Vec<&str> = args.iter().map(String::as_str).collect();
    match words.as_slice() {
        ["link", "add", name, "type", "veth", "peer", "name", peer, rest @ ..] => {
            if state.link(ns, name).is_some() {
                return Err("RTNETLINK answers: File exists".into());
            }
            let peer_ns = match rest {
                ["netns", _pid] => None,
                [] => namespace.clone(),
                _ => return Err(format!("unexpected arguments {rest:?}")),
            };
            if state.link(peer_ns.as_deref(), peer).is_some() {
                return Err("RTNETLINK answers: File exists".into());
            }
            for (link, other, link_ns) in [(*name, *peer, namespace.clone()), (*peer, *name, peer_ns)] {
                state.links.push(Link {
                    name: link.to_string(),
                    namespace: link_ns,
                    mac: None,
                    up: false,
                    hairpin: false,
                    addresses: Vec::new(),
                    peer: Some(other.to_string()),
                });
            }
            Ok(Vec::new())
        }
        ["link", "set", rest @ ..] => {
            let rest = match rest {
                ["dev", tail @ ..] => tail,
                tail => tail,
            };
            let Some((name, mut changes)) = rest.split_first() else {
                return Err("link set requires a device".into());
            };
            if state.link(ns, name).is_none() {
                return Err(format!("Cannot find device \"{name}\""));
            }
            let mut current = name.to_string();
            while let Some((change, tail)) = changes.split_first() {
                match (*change, tail) {
                    ("up", _) => {
                        if let Some(link) = state.link_mut(ns, &current) {
                            link.up = true;
                        }
                        changes = tail;
                    }
                    ("down", _) => {
                        if let Some(link) = state.link_mut(ns, &current) {
                            link.up = false;
                        }
                        changes = tail;
                    }
                    ("address", [mac, more @ ..]) => {
                        if let Some(link) = state.link_mut(ns, &current) {
                            link.mac = Some(mac.to_string());
                        }
                        changes = more;
                    }
                    ("name", [new_name, more @ ..]) => {
                        if state.link(ns, new_name).is_some() {
                            return Err("RTNETLINK answers: File exists".into());
                        }
                        let old = current.clone();
                        for link in state.links.iter_mut() {
                            if link.peer.as_deref() == Some(old.as_str()) {
                                link.peer = Some(new_name.to_string());
                            }
                        }
                        if let Some(link) = state.link_mut(ns, &old) {
                            link.name = new_name.to_string();
                        }
                        current = new_name.to_string();
                        changes = more;
                    }
                    ("mtu", [_, more @ ..]) => changes = more,
                    (other, _) => return Err(format!("unsupported link attribute '{other}'")),
                }
            }
            Ok(Vec::new())
        }
        ["link", "show", name] => match state.link(ns, name) {
            Some(link) => Ok(vec![format!(
                "{}: {}: <{}> mtu 1500",
                state.links.iter().position(|l| l == link).unwrap_or(0) + 1,
                link.name,
                if link.up { "UP" } else { "DOWN" }
            )]),
            None => Err(missing_device(name)),
        },
        ["link", "delete" | "del", name] => {
            let Some(index) = state
                .links
                .iter()
                .position(|link| link.name == *name && link.namespace.as_deref() == ns)
            else {
                return Err(missing_device(name));
            };
            let removed = state.links.remove(index);
            if let Some(peer) = removed.peer {
                state.links.retain(|link| !(link.name == peer && link.peer.as_deref() == Some(*name)));
            }
            Ok(Vec::new())
        }
        ["addr", "flush", "dev", name] => {
            let link = state.link_mut(ns, name).ok_or_else(|| missing_device(name))?;
            link.addresses.clear();
            Ok(Vec::new())
        }
        ["addr", "add", address, "dev", name] => {
            let link = state.link_mut(ns, name).ok_or_else(|| missing_device(name))?;
            if link.addresses.iter().any(|a| a == address) {
                return Err("RTNETLINK answers: File exists".into());
            }
            link.addresses.push(address.to_string());
            Ok(Vec::new())
        }
        ["route", "flush", prefix] => {
            state
                .host_routes
                .retain(|route| !(route.prefix == *prefix && route.namespace.as_deref() == ns));
            Ok(Vec::new())
        }
        ["route", "add", prefix, rest @ ..] => {
            let (via, dev) = match rest {
                ["via", gw] => (Some(gw.to_string()), None),
                ["via", gw, "dev", dev] => (Some(gw.to_string()), Some(dev.to_string())),
                ["dev", dev] => (None, Some(dev.to_string())),
                _ => return Err(format!("unsupported route arguments {rest:?}")),
            };
            if let Some(dev) = dev.as_deref() {
                if state.link(ns, dev).is_none() {
                    return Err(missing_device(dev));
                }
            }
            if state
                .host_routes
                .iter()
                .any(|route| route.prefix == *prefix && route.namespace.as_deref() == ns)
            {
                return Err("RTNETLINK answers: File exists".into());
            }
            state.host_routes.push(HostRoute {
                namespace: namespace.clone(),
                prefix: prefix.to_string(),
                via,
                dev,
            });
            Ok(Vec::new())
        }
        _ => Err(format!("unsupported ip command '{}'", words.join(" "))),
    }
}

fn bridge(state: &mut FakeState, args: &[String]) -> Result<Vec<String>, String> {
    let namespace = current_fake_namespace();
    let words: Vec<&str> = args.iter().map(String::as_str).collect();
    match words.as_slice() {
        ["link", "set", "dev", name, "hairpin", setting] => {
            let link = state
                .link_mut(namespace.as_deref(), name)
                .ok_or_else(|| missing_device(name))?;
            link.hairpin = *setting == "on";
            Ok(Vec::new())
        }
        _ => Err(format!("unsupported bridge command '{}'", words.join(" "))),
    }
}

/// A namespace transition observed by [`FakeNamespaces`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamespaceEvent {
    Enter { path: PathBuf, thread: ThreadId },
    Leave { path: PathBuf, thread: ThreadId },
}

/// Namespace switch over a set of known paths. Entering marks the calling
/// thread so [`FakeControlPlane`] scopes `ip` commands to that namespace.
#[derive(Default)]
pub struct FakeNamespaces {
    present: Mutex<HashSet<PathBuf>>,
    events: Arc<Mutex<Vec<NamespaceEvent>>>,
}

impl FakeNamespaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, path: impl AsRef<Path>) {
        lock(&self.present).insert(path.as_ref().to_path_buf());
    }

    pub fn remove(&self, path: impl AsRef<Path>) {
        lock(&self.present).remove(path.as_ref());
    }

    pub fn events(&self) -> Vec<NamespaceEvent> {
        lock(&self.events).clone()
    }
}

struct FakeEntered {
    path: PathBuf,
    previous: Option<String>,
    events: Arc<Mutex<Vec<NamespaceEvent>>>,
}

impl EnteredNamespace for FakeEntered {
    fn leave(self: Box<Self>) -> io::Result<()> {
        let FakeEntered {
            path,
            previous,
            events,
        } = *self;
        FAKE_NAMESPACE.with(|current| *current.borrow_mut() = previous);
        lock(&events).push(NamespaceEvent::Leave {
            path,
            thread: thread::current().id(),
        });
        Ok(())
    }
}

impl NamespaceSwitch for FakeNamespaces {
    fn enter(&self, path: &Path) -> io::Result<Box<dyn EnteredNamespace>> {
        if !lock(&self.present).contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            ));
        }
        let previous = FAKE_NAMESPACE.with(|current| {
            current
                .borrow_mut()
                .replace(path.display().to_string())
        });
        lock(&self.events).push(NamespaceEvent::Enter {
            path: path.to_path_buf(),
            thread: thread::current().id(),
        });
        Ok(Box::new(FakeEntered {
            path: path.to_path_buf(),
            previous,
            events: Arc::clone(&self.events),
        }))
    }
}

/// Overlay config whose host paths all live under `root`, with a short
/// metadata poll so timeouts resolve quickly.
pub fn overlay_config_in(root: &Path) -> OverlayConfig {
    OverlayConfig {
        cni_conf_dir: root.join("etc/cni/net.d"),
        cni_bin_dir: root.join("opt/cni/bin"),
        netns_dir: root.join("var/run/netns"),
        debian_interfaces: root.join("etc/network/interfaces"),
        redhat_scripts: root.join("etc/sysconfig/network-scripts"),
        metadata_attempts: 3,
        metadata_interval: Duration::from_millis(10),
        api_server: None,
        ..OverlayConfig::default()
    }
}

fn target_dir() -> PathBuf {
    if let Ok(dir) = env::var("CARGO_TARGET_DIR") {
        PathBuf::from(dir)
    } else {
        env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("target")
    }
}

/// Returns a unique directory under `target/test-output/<component>/`.
/// The directory is created eagerly and returned to the caller.
pub fn test_output_dir(component: &str) -> PathBuf {
    static COUNTER: OnceLock<AtomicU64> = OnceLock::new();
    let counter = COUNTER.get_or_init(|| AtomicU64::new(0));
    let mut path = target_dir();
    path.push("test-output");
    path.push(component);
    path.push(format!(
        "pid{}-{}",
        std::process::id(),
        counter.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("create test output directory");
    path
}
