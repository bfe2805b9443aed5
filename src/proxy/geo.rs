//! Country lookup for validated proxies using a MaxMind database

use crate::Result;
use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// Looks up the ISO country code of proxy hosts in an MMDB file
#[derive(Clone)]
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// ISO 3166-1 alpha-2 code for `host`, or `None` for hostnames and misses
    pub fn country_code(&self, host: &str) -> Option<String> {
        let ip: IpAddr = host.parse().ok()?;
        self.lookup_ip(ip).ok().flatten()
    }

    fn lookup_ip(&self, ip: IpAddr) -> Result<Option<String>> {
        let lookup_result = self.reader.lookup(ip)?;
        let country: Option<geoip2::Country> = lookup_result.decode()?;
        Ok(country.and_then(|c| c.country.iso_code.map(String::from)))
    }
}

impl std::fmt::Debug for GeoLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoLocator").finish_non_exhaustive()
    }
}
