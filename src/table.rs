//! The route table: slug to route, swapped whole on rebuild

use crate::config::{AppDescriptor, ProxySettings};
use crate::route::{build_route, Route};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

type RouteMap = HashMap<String, Arc<Route>>;

/// Read-mostly map of mounted apps.
///
/// Lookups clone an `Arc` under a read lock. A rebuild constructs the new
/// map without holding any lock and takes the write lock only to swap the
/// pointer, so readers never see a partly built table and in-flight
/// requests keep the route they started with.
pub struct RouteTable {
    settings: ProxySettings,
    routes: RwLock<Arc<RouteMap>>,
}

/// Two apps whose names produce the same slug
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlugCollision {
    pub slug: String,
    /// App that owns the slug after the rebuild
    pub kept: String,
    /// App that was shadowed
    pub replaced: String,
}

/// An app that got no route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exclusion {
    pub name: String,
    pub reason: String,
}

/// Outcome of a table rebuild
#[derive(Debug, Default)]
pub struct RebuildResult {
    /// Slugs that were not mounted before
    pub added: Vec<String>,
    /// Slugs that are no longer mounted
    pub removed: Vec<String>,
    pub collisions: Vec<SlugCollision>,
    pub excluded: Vec<Exclusion>,
}

impl RouteTable {
    /// Create an empty table
    pub fn new(settings: ProxySettings) -> Self {
        Self {
            settings,
            routes: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Create a table populated from `apps`
    pub fn from_apps(settings: ProxySettings, apps: &[AppDescriptor]) -> Self {
        let table = Self::new(settings);
        table.rebuild(apps);
        table
    }

    /// Replace every route with routes built from `apps`.
    ///
    /// Disabled or unproxied apps are skipped. Apps whose route cannot be
    /// built are left out and reported. When two apps share a slug the
    /// later one in `apps` wins.
    pub fn rebuild(&self, apps: &[AppDescriptor]) -> RebuildResult {
        let mut result = RebuildResult::default();
        let mut next: RouteMap = HashMap::with_capacity(apps.len());

        for app in apps.iter().filter(|a| a.is_proxied()) {
            let route = match build_route(app, &self.settings) {
                Ok(route) => route,
                Err(e) => {
                    warn!(app = %app.name, url = %app.url, error = %e, "Excluding app from proxy");
                    result.excluded.push(Exclusion {
                        name: app.name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let slug = route.slug().to_string();
            debug!(
                app = %app.name,
                slug = %slug,
                target = %route.target(),
                "Built proxy route"
            );

            if let Some(previous) = next.insert(slug.clone(), Arc::new(route)) {
                warn!(
                    slug = %slug,
                    kept = %app.name,
                    replaced = %previous.name(),
                    "Slug collision, later app wins"
                );
                result.collisions.push(SlugCollision {
                    slug,
                    kept: app.name.clone(),
                    replaced: previous.name().to_string(),
                });
            }
        }

        let next = Arc::new(next);
        let previous = std::mem::replace(&mut *self.routes.write(), Arc::clone(&next));

        let before: BTreeSet<&String> = previous.keys().collect();
        let after: BTreeSet<&String> = next.keys().collect();
        result.added = after.difference(&before).map(|s| s.to_string()).collect();
        result.removed = before.difference(&after).map(|s| s.to_string()).collect();

        info!(
            routes = next.len(),
            added = result.added.len(),
            removed = result.removed.len(),
            collisions = result.collisions.len(),
            excluded = result.excluded.len(),
            "Route table rebuilt"
        );

        result
    }

    /// Look up the route for a slug
    pub fn get(&self, slug: &str) -> Option<Arc<Route>> {
        self.routes.read().get(slug).cloned()
    }

    /// Whether any app is mounted
    pub fn has_routes(&self) -> bool {
        !self.routes.read().is_empty()
    }

    /// Mounted slugs, sorted
    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.routes.read().keys().cloned().collect();
        slugs.sort();
        slugs
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }
}
