//! Geolocation and geodesic distance.
//!
//! A [`GeoProvider`] resolves an address to coordinates and reports failures
//! as [`GeoError`]. [`GeoLocator`] wraps a provider and folds every failure
//! into "unknown" (`None`), which is the only thing topology selection needs.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

/// Default ipinfo API base URL.
pub const IPINFO_BASE_URL: &str = "https://ipinfo.io";

const IPINFO_TIMEOUT: Duration = Duration::from_secs(5);

/// A point on the earth, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Reject NaN and out-of-range values.
    pub fn validate(self) -> Result<Self, GeoError> {
        let lat_ok = self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude);
        let lon_ok = self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude);
        if lat_ok && lon_ok {
            Ok(self)
        } else {
            Err(GeoError::InvalidCoordinates(self))
        }
    }
}

/// Errors from geolocation and distance calculation.
#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("Geolocation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Provider returned no location for {0}")]
    MissingLocation(String),
    #[error("Provider returned an unparseable location {0:?}")]
    InvalidLocation(String),
    #[error("Coordinates out of range: {0:?}")]
    InvalidCoordinates(Coordinates),
    #[error("Geodesic calculation did not converge")]
    NoConvergence,
}

// ============================================================================
// Providers
// ============================================================================

/// Resolves an address to coordinates.
pub trait GeoProvider: Send + Sync + 'static {
    /// Resolve `host`, or the caller's own public address when `None`.
    fn resolve(
        &self,
        host: Option<&str>,
    ) -> impl Future<Output = Result<Coordinates, GeoError>> + Send;
}

/// [`GeoProvider`] backed by the ipinfo JSON API.
#[derive(Debug, Clone)]
pub struct IpInfoProvider {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpInfoDetails {
    #[serde(default)]
    loc: Option<String>,
}

impl IpInfoProvider {
    pub fn new(token: Option<String>) -> Self {
        Self::with_base_url(IPINFO_BASE_URL, token)
    }

    pub fn with_base_url(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            token,
        }
    }

    fn url_for(&self, host: Option<&str>) -> String {
        match host {
            Some(host) => format!("{}/{}/json", self.base_url, host),
            None => format!("{}/json", self.base_url),
        }
    }
}

impl GeoProvider for IpInfoProvider {
    async fn resolve(&self, host: Option<&str>) -> Result<Coordinates, GeoError> {
        let mut request = self.client.get(self.url_for(host)).timeout(IPINFO_TIMEOUT);
        if let Some(ref token) = self.token {
            request = request.query(&[("token", token)]);
        }

        let details: IpInfoDetails = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let target = host.unwrap_or("self").to_string();
        let loc = details.loc.ok_or(GeoError::MissingLocation(target))?;
        parse_loc(&loc)
    }
}

/// Parse an ipinfo `loc` field (`"lat,lon"`).
fn parse_loc(loc: &str) -> Result<Coordinates, GeoError> {
    let invalid = || GeoError::InvalidLocation(loc.to_string());
    let (lat, lon) = loc.split_once(',').ok_or_else(invalid)?;
    let latitude = lat.trim().parse::<f64>().map_err(|_| invalid())?;
    let longitude = lon.trim().parse::<f64>().map_err(|_| invalid())?;
    Coordinates::new(latitude, longitude).validate()
}

/// Wraps a [`GeoProvider`]; every failure becomes an unknown location.
///
/// Single attempt per call, no retries.
#[derive(Debug, Clone)]
pub struct GeoLocator<P> {
    provider: P,
}

impl<P: GeoProvider> GeoLocator<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Coordinates of `host` (or of this process when `None`), if known.
    pub async fn locate(&self, host: Option<&str>) -> Option<Coordinates> {
        match self.provider.resolve(host).await {
            Ok(coords) => {
                debug!(host = host.unwrap_or("self"), ?coords, "Located");
                Some(coords)
            }
            Err(e) => {
                warn!(host = host.unwrap_or("self"), error = %e, "Location unknown");
                None
            }
        }
    }
}

// ============================================================================
// Distance
// ============================================================================

/// Computes the distance between two points in kilometers.
pub trait DistanceCalculator: Send + Sync + 'static {
    fn distance_km(&self, from: Coordinates, to: Coordinates) -> Result<f64, GeoError>;
}

/// WGS-84 semi-major axis (m).
const WGS84_A: f64 = 6_378_137.0;
/// WGS-84 flattening.
const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// Mean earth radius (km), IUGG.
const MEAN_EARTH_RADIUS_KM: f64 = 6_371.008_8;

const VINCENTY_MAX_ITERATIONS: usize = 200;
const VINCENTY_TOLERANCE: f64 = 1e-12;

/// Vincenty's inverse formula on the WGS-84 ellipsoid.
///
/// Fails with [`GeoError::NoConvergence`] for nearly antipodal points.
#[derive(Debug, Clone, Copy, Default)]
pub struct Vincenty;

impl DistanceCalculator for Vincenty {
    fn distance_km(&self, from: Coordinates, to: Coordinates) -> Result<f64, GeoError> {
        let from = from.validate()?;
        let to = to.validate()?;

        let a = WGS84_A;
        let f = WGS84_F;
        let b = (1.0 - f) * a;

        let l = (to.longitude - from.longitude).to_radians();
        let u1 = ((1.0 - f) * from.latitude.to_radians().tan()).atan();
        let u2 = ((1.0 - f) * to.latitude.to_radians().tan()).atan();
        let (sin_u1, cos_u1) = u1.sin_cos();
        let (sin_u2, cos_u2) = u2.sin_cos();

        let mut lambda = l;
        let mut converged = None;
        for _ in 0..VINCENTY_MAX_ITERATIONS {
            let (sin_lambda, cos_lambda) = lambda.sin_cos();
            let sin_sigma = ((cos_u2 * sin_lambda).powi(2)
                + (cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda).powi(2))
            .sqrt();
            if sin_sigma == 0.0 {
                // coincident points
                return Ok(0.0);
            }
            let cos_sigma = sin_u1 * sin_u2 + cos_u1 * cos_u2 * cos_lambda;
            let sigma = sin_sigma.atan2(cos_sigma);
            let sin_alpha = cos_u1 * cos_u2 * sin_lambda / sin_sigma;
            let cos_sq_alpha = 1.0 - sin_alpha * sin_alpha;
            let cos_2sigma_m = if cos_sq_alpha != 0.0 {
                cos_sigma - 2.0 * sin_u1 * sin_u2 / cos_sq_alpha
            } else {
                0.0 // equatorial line
            };
            let c = f / 16.0 * cos_sq_alpha * (4.0 + f * (4.0 - 3.0 * cos_sq_alpha));
            let previous = lambda;
            lambda = l
                + (1.0 - c)
                    * f
                    * sin_alpha
                    * (sigma
                        + c * sin_sigma
                            * (cos_2sigma_m + c * cos_sigma * (-1.0 + 2.0 * cos_2sigma_m.powi(2))));

            if (lambda - previous).abs() < VINCENTY_TOLERANCE {
                converged = Some((sin_sigma, cos_sigma, sigma, cos_sq_alpha, cos_2sigma_m));
                break;
            }
        }

        let (sin_sigma, cos_sigma, sigma, cos_sq_alpha, cos_2sigma_m) =
            converged.ok_or(GeoError::NoConvergence)?;

        let u_sq = cos_sq_alpha * (a * a - b * b) / (b * b);
        let big_a =
            1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
        let big_b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));
        let delta_sigma = big_b
            * sin_sigma
            * (cos_2sigma_m
                + big_b / 4.0
                    * (cos_sigma * (-1.0 + 2.0 * cos_2sigma_m.powi(2))
                        - big_b / 6.0
                            * cos_2sigma_m
                            * (-3.0 + 4.0 * sin_sigma.powi(2))
                            * (-3.0 + 4.0 * cos_2sigma_m.powi(2))));

        Ok(b * big_a * (sigma - delta_sigma) / 1000.0)
    }
}

/// Great-circle distance on a sphere of mean earth radius.
#[derive(Debug, Clone, Copy, Default)]
pub struct Haversine;

impl DistanceCalculator for Haversine {
    fn distance_km(&self, from: Coordinates, to: Coordinates) -> Result<f64, GeoError> {
        let from = from.validate()?;
        let to = to.validate()?;

        let phi1 = from.latitude.to_radians();
        let phi2 = to.latitude.to_radians();
        let d_phi = (to.latitude - from.latitude).to_radians();
        let d_lambda = (to.longitude - from.longitude).to_radians();

        let h = (d_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
        Ok(2.0 * MEAN_EARTH_RADIUS_KM * h.sqrt().min(1.0).asin())
    }
}
