use anyhow::{Context, Result};
use log::{info, warn};

use crate::{
    routes::{normalize_protocol, protocol_name, Route, RouteError, RouteStore},
    table::PolicyControl,
};

/// Keeps persisted routes and a policy table in step.
pub struct Controller<P> {
    store: RouteStore,
    policy: P,
}

impl<P: PolicyControl> Controller<P> {
    pub fn new(store: RouteStore, policy: P) -> Self {
        Self { store, policy }
    }

    pub fn list(&self) -> Vec<Route> {
        self.store.list()
    }

    /// Routes as currently programmed in the policy table.
    pub fn programmed(&self) -> Result<Vec<Route>> {
        let mut routes: Vec<Route> = self
            .policy
            .entries()
            .context("failed to list policy entries")?
            .into_iter()
            .map(|(key, value)| {
                Route::new(&protocol_name(key.proto), key.port(), value.addr(), value.port())
            })
            .collect();
        routes.sort_by_key(Route::storage_key);
        Ok(routes)
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Validates `route`, programs the policy table, then persists it. If
    /// persisting fails the table is put back the way it was.
    pub fn upsert(&mut self, route: Route) -> Result<Route> {
        let route = route.normalize()?;
        let (key, value) = route.policy()?;
        let previous = self
            .store
            .get(route.host_port, &route.protocol)
            .map(Route::policy)
            .transpose()?;

        self.policy
            .upsert(key, value)
            .with_context(|| format!("failed to program route {}", route.storage_key()))?;

        if let Err(err) = self.store.upsert(route.clone()) {
            let undo = match previous {
                Some((_, previous)) => self.policy.upsert(key, previous),
                None => self.policy.remove(&key),
            };
            if let Err(undo_err) = undo {
                warn!(
                    "failed to roll back route {}: {undo_err}",
                    route.storage_key()
                );
            }
            return Err(err);
        }

        info!(
            "route applied proto={} host_port={} dest_ip={} dest_port={}",
            route.protocol, route.host_port, route.backend.ip, route.backend.port
        );
        Ok(route)
    }

    /// Removes the route from the policy table, then from the routes file.
    /// If persisting fails the route is programmed again.
    pub fn delete(&mut self, host_port: u16, protocol: &str) -> Result<Route> {
        let protocol = normalize_protocol(protocol)?;
        let existing = self
            .store
            .get(host_port, &protocol)
            .ok_or_else(|| RouteError::NotFound(format!("{host_port}/{protocol}")))?;
        let (key, value) = existing.policy()?;

        self.policy
            .remove(&key)
            .with_context(|| format!("failed to remove route {host_port}/{protocol}"))?;

        let removed = match self.store.delete(host_port, &protocol) {
            Ok(removed) => removed,
            Err(err) => {
                if let Err(undo_err) = self.policy.upsert(key, value) {
                    warn!("failed to reinstate route {host_port}/{protocol}: {undo_err}");
                }
                return Err(err);
            }
        };

        info!("route removed proto={protocol} host_port={host_port}");
        Ok(removed)
    }

    /// Replays every persisted route into the policy table.
    pub fn restore(&mut self) -> Result<usize> {
        let routes = self.store.list();
        for route in &routes {
            let (key, value) = route
                .policy()
                .with_context(|| format!("invalid persisted route {}", route.storage_key()))?;
            self.policy
                .upsert(key, value)
                .with_context(|| format!("failed to restore route {}", route.storage_key()))?;
        }
        Ok(routes.len())
    }
}
