use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use maxminddb::geoip2;
use tracing::{info, trace};

/// Location of an address according to the geolocation database.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoLocation {
    /// ISO 3166-1 alpha-2 code, when the database has one.
    pub country: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

/// Point lookup of an address. `None` is the uniform "unknown" result.
///
/// Implementations hold no mutable state and may be called concurrently
/// without synchronization.
pub trait GeoLocator: Send + Sync + 'static {
    fn resolve(&self, address: &str) -> Option<GeoLocation>;
}

/// [`GeoLocator`] backed by a MaxMind City database loaded into memory.
pub struct MaxMindLocator {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindLocator {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = maxminddb::Reader::open_readfile(path)
            .with_context(|| format!("opening geolocation database {}", path.display()))?;

        info!(
            path = %path.display(),
            database_type = %reader.metadata.database_type,
            build_epoch = reader.metadata.build_epoch,
            "geolocation database loaded",
        );

        Ok(Self { reader })
    }
}

impl GeoLocator for MaxMindLocator {
    fn resolve(&self, address: &str) -> Option<GeoLocation> {
        let ip: IpAddr = match address.parse() {
            Ok(ip) => ip,
            Err(_) => {
                trace!(address, "not an IP address");
                return None;
            }
        };

        let city: geoip2::City<'_> = match self.reader.lookup(ip) {
            Ok(city) => city,
            Err(e) => {
                trace!(address, error = %e, "geolocation lookup miss");
                return None;
            }
        };

        let location = city.location?;
        let country = city
            .country
            .and_then(|c| c.iso_code)
            .map(str::to_string);

        Some(GeoLocation {
            country,
            latitude: location.latitude?,
            longitude: location.longitude?,
        })
    }
}
