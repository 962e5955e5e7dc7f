use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use l4_redirect_common::{PolicyKey, PolicyValue, IPPROTO_TCP, IPPROTO_UDP};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("host_port must be > 0")]
    HostPort,
    #[error("backend.port must be > 0")]
    BackendPort,
    #[error("protocol {0:?} not supported")]
    Protocol(String),
    #[error("backend.ip must be valid ipv4, got {0:?}")]
    BackendIp(String),
    #[error("route not found: {0}")]
    NotFound(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub ip: String,
    pub port: u16,
}

/// Exposed host port bound to a backend address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub host_port: u16,
    pub protocol: String,
    pub backend: Backend,
}

impl Route {
    pub fn new(protocol: &str, host_port: u16, backend_ip: Ipv4Addr, backend_port: u16) -> Self {
        Self {
            host_port,
            protocol: protocol.to_string(),
            backend: Backend {
                ip: backend_ip.to_string(),
                port: backend_port,
            },
        }
    }

    /// Trims and lower-cases the protocol, canonicalizes the backend address
    /// and rejects anything the dataplane cannot express.
    pub fn normalize(&self) -> Result<Route, RouteError> {
        if self.host_port == 0 {
            return Err(RouteError::HostPort);
        }
        let protocol = normalize_protocol(&self.protocol)?;
        if self.backend.port == 0 {
            return Err(RouteError::BackendPort);
        }
        let ip: Ipv4Addr = self
            .backend
            .ip
            .trim()
            .parse()
            .map_err(|_| RouteError::BackendIp(self.backend.ip.clone()))?;

        Ok(Route {
            host_port: self.host_port,
            protocol,
            backend: Backend {
                ip: ip.to_string(),
                port: self.backend.port,
            },
        })
    }

    pub fn storage_key(&self) -> String {
        storage_key(self.host_port, &self.protocol)
    }

    /// Policy table entry for this route. Validates like [`Route::normalize`].
    pub fn policy(&self) -> Result<(PolicyKey, PolicyValue), RouteError> {
        let route = self.normalize()?;
        let proto = protocol_number(&route.protocol)
            .ok_or_else(|| RouteError::Protocol(route.protocol.clone()))?;
        let ip: Ipv4Addr = route
            .backend
            .ip
            .parse()
            .map_err(|_| RouteError::BackendIp(route.backend.ip.clone()))?;
        Ok((
            PolicyKey::new(proto, route.host_port),
            PolicyValue::new(ip, route.backend.port),
        ))
    }
}

pub fn normalize_protocol(protocol: &str) -> Result<String, RouteError> {
    let protocol = protocol.trim().to_ascii_lowercase();
    match protocol_number(&protocol) {
        Some(_) => Ok(protocol),
        None => Err(RouteError::Protocol(protocol)),
    }
}

pub fn protocol_number(protocol: &str) -> Option<u8> {
    match protocol {
        "tcp" => Some(IPPROTO_TCP),
        "udp" => Some(IPPROTO_UDP),
        _ => None,
    }
}

pub fn protocol_name(proto: u8) -> String {
    match proto {
        IPPROTO_TCP => "tcp".to_string(),
        IPPROTO_UDP => "udp".to_string(),
        other => other.to_string(),
    }
}

pub fn storage_key(host_port: u16, protocol: &str) -> String {
    format!("{host_port}/{protocol}")
}

/// Routes persisted as a JSON array.
///
/// Writes go to a temporary file next to the target which is then renamed
/// over it, so readers never see a half-written file.
pub struct RouteStore {
    path: PathBuf,
    items: BTreeMap<String, Route>,
}

impl RouteStore {
    /// Opens `path`. A missing or empty file is an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut items = BTreeMap::new();

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        if !data.iter().all(u8::is_ascii_whitespace) {
            let routes: Vec<Route> = serde_json::from_slice(&data)
                .with_context(|| format!("failed to decode routes from {}", path.display()))?;
            for route in routes {
                items.insert(route.storage_key(), route);
            }
        }

        Ok(Self { path, items })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> Vec<Route> {
        self.items.values().cloned().collect()
    }

    pub fn get(&self, host_port: u16, protocol: &str) -> Option<&Route> {
        self.items.get(&storage_key(host_port, protocol))
    }

    pub fn upsert(&mut self, route: Route) -> Result<()> {
        let key = route.storage_key();
        let previous = self.items.insert(key.clone(), route);
        if let Err(err) = self.persist() {
            match previous {
                Some(previous) => self.items.insert(key, previous),
                None => self.items.remove(&key),
            };
            return Err(err);
        }
        Ok(())
    }

    pub fn delete(&mut self, host_port: u16, protocol: &str) -> Result<Route> {
        let key = storage_key(host_port, protocol);
        let removed = self
            .items
            .remove(&key)
            .ok_or_else(|| RouteError::NotFound(key.clone()))?;
        if let Err(err) = self.persist() {
            self.items.insert(key, removed);
            return Err(err);
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let entries: Vec<&Route> = self.items.values().collect();
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, &entries).context("failed to encode routes")?;
        tmp.write_all(b"\n").context("failed to encode routes")?;
        tmp.persist(&self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
