//! Discovered topology: primary, measured replicas, and the nearest one.
//!
//! A [`Topology`] is built once by [`Topology::discover`] and never mutated;
//! a caller that needs fresh topology discovers again.

use tracing::{debug, info, warn};

use crate::discovery::{Discovery, Endpoint};
use crate::geo::{Coordinates, DistanceCalculator, GeoLocator, GeoProvider};

/// A replica as measured from the caller's location.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaRecord {
    pub endpoint: Endpoint,
    pub coordinates: Option<Coordinates>,
    pub distance_km: Option<f64>,
}

/// Immutable snapshot of the store topology for one client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    primary: Option<Endpoint>,
    replicas: Vec<ReplicaRecord>,
    nearest: Option<ReplicaRecord>,
}

impl Topology {
    /// Assemble a topology from already measured replicas.
    pub fn new(primary: Option<Endpoint>, replicas: Vec<ReplicaRecord>) -> Self {
        let nearest = nearest(&replicas).cloned();
        Self {
            primary,
            replicas,
            nearest,
        }
    }

    /// Run discovery once.
    ///
    /// Never fails: a discovery error means no primary (or no replicas), an
    /// unknown own location means no nearest replica.
    pub async fn discover<D, P, C>(
        discovery: &D,
        locator: &GeoLocator<P>,
        distance: &C,
        primary_name: &str,
    ) -> Self
    where
        D: Discovery,
        P: GeoProvider,
        C: DistanceCalculator,
    {
        let primary = match discovery.discover_primary(primary_name).await {
            Ok(Some(endpoint)) => {
                info!(primary = %endpoint, name = primary_name, "Primary found; writes enabled");
                endpoint
            }
            Ok(None) => {
                warn!(name = primary_name, "No primary known; cache disabled");
                return Self::default();
            }
            Err(e) => {
                warn!(name = primary_name, error = %e, "Primary discovery failed; cache disabled");
                return Self::default();
            }
        };

        let Some(origin) = locator.locate(None).await else {
            warn!("Own location unknown; reads from cache disabled");
            return Self::new(Some(primary), Vec::new());
        };

        let endpoints = match discovery.discover_replicas(primary_name).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(name = primary_name, error = %e, "Replica discovery failed");
                Vec::new()
            }
        };

        let replicas = measure_replicas(&endpoints, origin, locator, distance).await;
        let topology = Self::new(Some(primary), replicas);

        match topology.nearest() {
            Some(r) => info!(
                replica = %r.endpoint,
                distance_km = ?r.distance_km,
                "Nearest replica selected"
            ),
            None => warn!("No replicas available; reads from cache disabled"),
        }

        topology
    }

    /// Writable endpoint, if any.
    pub fn primary(&self) -> Option<&Endpoint> {
        self.primary.as_ref()
    }

    /// Every measured replica, in discovery order.
    pub fn replicas(&self) -> &[ReplicaRecord] {
        &self.replicas
    }

    /// Replica reads go to, if any.
    pub fn nearest(&self) -> Option<&ReplicaRecord> {
        self.nearest.as_ref()
    }
}

/// Locate each replica and compute its distance from `origin`.
///
/// A replica that cannot be located, or whose distance cannot be computed,
/// gets an unknown distance.
pub async fn measure_replicas<P, C>(
    endpoints: &[Endpoint],
    origin: Coordinates,
    locator: &GeoLocator<P>,
    distance: &C,
) -> Vec<ReplicaRecord>
where
    P: GeoProvider,
    C: DistanceCalculator,
{
    let mut records = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let coordinates = locator.locate(Some(endpoint.host.as_str())).await;
        let distance_km = coordinates.and_then(|c| match distance.distance_km(origin, c) {
            Ok(km) => Some(km),
            Err(e) => {
                warn!(replica = %endpoint, error = %e, "Distance unknown");
                None
            }
        });
        debug!(replica = %endpoint, ?distance_km, "Replica measured");

        records.push(ReplicaRecord {
            endpoint: endpoint.clone(),
            coordinates,
            distance_km,
        });
    }
    records
}

/// Pick the nearest replica by a left-to-right scan.
///
/// The first record starts as the incumbent. A later record replaces it only
/// when both distances are known and the later one is strictly smaller, so:
/// ties keep the earlier record, and an incumbent with unknown distance is
/// never replaced.
// TODO: an unknown-distance first record currently wins over known ones;
// raise with the cluster owners whether unknown should rank last instead.
pub fn nearest(records: &[ReplicaRecord]) -> Option<&ReplicaRecord> {
    let (first, rest) = records.split_first()?;
    let mut best = first;
    for candidate in rest {
        if let (Some(best_km), Some(candidate_km)) = (best.distance_km, candidate.distance_km) {
            if candidate_km < best_km {
                best = candidate;
            }
        }
    }
    Some(best)
}

/// Measure `endpoints` from `my_coordinates` and pick the nearest.
///
/// Returns `None` without measuring when the caller's location is unknown.
pub async fn select_nearest<P, C>(
    endpoints: &[Endpoint],
    my_coordinates: Option<Coordinates>,
    locator: &GeoLocator<P>,
    distance: &C,
) -> Option<ReplicaRecord>
where
    P: GeoProvider,
    C: DistanceCalculator,
{
    let origin = my_coordinates?;
    let records = measure_replicas(endpoints, origin, locator, distance).await;
    nearest(&records).cloned()
}
