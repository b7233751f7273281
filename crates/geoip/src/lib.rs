use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use blockgate_common::{GeoIpConfig, GeoIpDefaultAction, GeoIpMode};
use tracing::{debug, info, warn};

/// Result of a geo policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoIpAction {
    /// Request may proceed to the next check.
    Allow,
    /// Country matched the blocklist or is missing from the allowlist.
    Block { country: String },
    /// Policy would block, but the filter runs in detect mode.
    Detect { country: String },
    /// Country could not be determined and the default action is allow.
    Unknown,
}

/// Country resolution collaborator.
///
/// `Ok(None)` means the address is simply not in the data set (private
/// ranges, unallocated space). `Err` means the resolver itself failed and the
/// caller applies its failure policy.
pub trait GeoResolver: Send + Sync {
    fn lookup_country(&self, addr: IpAddr) -> anyhow::Result<Option<String>>;
}

/// Minimal struct for deserializing the country ISO code from MaxMind DB.
#[derive(serde::Deserialize)]
struct CountryRecord {
    country: Option<CountryInfo>,
}

#[derive(serde::Deserialize)]
struct CountryInfo {
    iso_code: Option<String>,
}

/// Resolver backed by a MaxMind `.mmdb` database.
///
/// Uses `ArcSwap` for lock-free hot-reload of the database file.
pub struct MaxMindResolver {
    reader: ArcSwap<Option<maxminddb::Reader<Vec<u8>>>>,
}

impl MaxMindResolver {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let reader = maxminddb::Reader::open_readfile(path).map_err(|e| {
            warn!(path = %path.display(), error = %e, "failed to open GeoIP database");
            anyhow::anyhow!("failed to open GeoIP database {}: {}", path.display(), e)
        })?;
        info!(path = %path.display(), "loaded GeoIP database");
        Ok(Self {
            reader: ArcSwap::from_pointee(Some(reader)),
        })
    }

    /// Resolver with no database; every lookup fails.
    pub fn unloaded() -> Self {
        Self {
            reader: ArcSwap::from_pointee(None),
        }
    }

    /// Open the database named in `config`, or an unloaded resolver when no
    /// path is configured.
    pub fn from_config(config: &GeoIpConfig) -> anyhow::Result<Self> {
        match config.database_path {
            Some(ref path) => Self::open(path),
            None => {
                warn!("geo check enabled without a database; lookups will fail");
                Ok(Self::unloaded())
            }
        }
    }

    /// Hot-reload the MaxMind database from a new path. On failure the
    /// previous database stays in place.
    pub fn reload(&self, path: &Path) -> anyhow::Result<()> {
        let reader = maxminddb::Reader::open_readfile(path).map_err(|e| {
            anyhow::anyhow!("failed to reload GeoIP database {}: {}", path.display(), e)
        })?;
        self.reader.store(Arc::new(Some(reader)));
        info!(path = %path.display(), "reloaded GeoIP database");
        Ok(())
    }
}

impl GeoResolver for MaxMindResolver {
    fn lookup_country(&self, addr: IpAddr) -> anyhow::Result<Option<String>> {
        let guard = self.reader.load();
        let reader = guard
            .as_ref()
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("GeoIP database not loaded"))?;

        match reader.lookup::<CountryRecord>(addr) {
            Ok(record) => Ok(record.country.and_then(|c| c.iso_code)),
            Err(maxminddb::MaxMindDBError::AddressNotFoundError(_)) => {
                debug!(addr = %addr, "address not in GeoIP database");
                Ok(None)
            }
            Err(e) => Err(anyhow::anyhow!("GeoIP lookup for {} failed: {}", addr, e)),
        }
    }
}

/// In-memory resolver keyed by exact address.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    countries: HashMap<IpAddr, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, addr: IpAddr, country: &str) -> Self {
        self.countries.insert(addr, country.to_uppercase());
        self
    }
}

impl GeoResolver for StaticResolver {
    fn lookup_country(&self, addr: IpAddr) -> anyhow::Result<Option<String>> {
        Ok(self.countries.get(&addr).cloned())
    }
}

/// Applies the configured country policy on top of a [`GeoResolver`].
pub struct GeoIpFilter {
    resolver: Arc<dyn GeoResolver>,
    config: GeoIpConfig,
}

impl GeoIpFilter {
    pub fn new(resolver: Arc<dyn GeoResolver>, config: GeoIpConfig) -> Self {
        Self { resolver, config }
    }

    /// Check an address against the country allowlist/blocklist.
    ///
    /// Resolver failures are returned as errors; an address with no country
    /// falls back to `default_action`.
    pub fn check(&self, addr: IpAddr) -> anyhow::Result<GeoIpAction> {
        let country = match self.resolver.lookup_country(addr)? {
            Some(c) => c,
            None => {
                return Ok(match self.config.default_action {
                    GeoIpDefaultAction::Allow => GeoIpAction::Unknown,
                    GeoIpDefaultAction::Block => {
                        self.violation("unknown".to_string()).unwrap_or(GeoIpAction::Unknown)
                    }
                });
            }
        };

        // Allowlist takes precedence: if configured, only listed countries pass.
        if !self.config.allowed_countries.is_empty() {
            if listed(&self.config.allowed_countries, &country) {
                return Ok(GeoIpAction::Allow);
            }
            return Ok(self.violation(country).unwrap_or(GeoIpAction::Allow));
        }

        if listed(&self.config.blocked_countries, &country) {
            return Ok(self.violation(country).unwrap_or(GeoIpAction::Allow));
        }

        Ok(GeoIpAction::Allow)
    }

    /// Policy violation for `country`, shaped by the mode. Detect mode never
    /// reports unknown countries.
    fn violation(&self, country: String) -> Option<GeoIpAction> {
        match self.config.mode {
            GeoIpMode::Block => Some(GeoIpAction::Block { country }),
            GeoIpMode::Detect if country != "unknown" => Some(GeoIpAction::Detect { country }),
            GeoIpMode::Detect => None,
        }
    }
}

fn listed(countries: &[String], country: &str) -> bool {
    countries.iter().any(|c| c.eq_ignore_ascii_case(country))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config(
        blocked: Vec<&str>,
        allowed: Vec<&str>,
        mode: GeoIpMode,
        default_action: GeoIpDefaultAction,
    ) -> GeoIpConfig {
        GeoIpConfig {
            enabled: true,
            database_path: None,
            blocked_countries: blocked.into_iter().map(String::from).collect(),
            allowed_countries: allowed.into_iter().map(String::from).collect(),
            mode,
            default_action,
            ..GeoIpConfig::default()
        }
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn resolver() -> Arc<dyn GeoResolver> {
        Arc::new(
            StaticResolver::new()
                .with(addr("203.0.113.10"), "cn")
                .with(addr("198.51.100.20"), "US")
                .with(addr("2001:db8::5"), "RU"),
        )
    }

    struct Broken;

    impl GeoResolver for Broken {
        fn lookup_country(&self, _addr: IpAddr) -> anyhow::Result<Option<String>> {
            Err(anyhow::anyhow!("resolver offline"))
        }
    }

    #[test]
    fn test_blocklist() {
        let filter = GeoIpFilter::new(
            resolver(),
            make_config(vec!["CN", "ru"], vec![], GeoIpMode::Block, GeoIpDefaultAction::Allow),
        );
        assert_eq!(
            filter.check(addr("203.0.113.10")).unwrap(),
            GeoIpAction::Block { country: "CN".into() }
        );
        assert_eq!(
            filter.check(addr("2001:db8::5")).unwrap(),
            GeoIpAction::Block { country: "RU".into() }
        );
        assert_eq!(filter.check(addr("198.51.100.20")).unwrap(), GeoIpAction::Allow);
    }

    #[test]
    fn test_allowlist_takes_precedence() {
        let filter = GeoIpFilter::new(
            resolver(),
            make_config(vec!["US"], vec!["US", "GB"], GeoIpMode::Block, GeoIpDefaultAction::Allow),
        );
        assert_eq!(filter.check(addr("198.51.100.20")).unwrap(), GeoIpAction::Allow);
        assert_eq!(
            filter.check(addr("203.0.113.10")).unwrap(),
            GeoIpAction::Block { country: "CN".into() }
        );
    }

    #[test]
    fn test_detect_mode() {
        let filter = GeoIpFilter::new(
            resolver(),
            make_config(vec!["CN"], vec![], GeoIpMode::Detect, GeoIpDefaultAction::Block),
        );
        assert_eq!(
            filter.check(addr("203.0.113.10")).unwrap(),
            GeoIpAction::Detect { country: "CN".into() }
        );
        // Unknown country in detect mode is never reported.
        assert_eq!(filter.check(addr("10.0.0.1")).unwrap(), GeoIpAction::Unknown);
    }

    #[test]
    fn test_unknown_country_uses_default_action() {
        let allow = GeoIpFilter::new(
            resolver(),
            make_config(vec!["CN"], vec![], GeoIpMode::Block, GeoIpDefaultAction::Allow),
        );
        assert_eq!(allow.check(addr("192.168.1.1")).unwrap(), GeoIpAction::Unknown);

        let block = GeoIpFilter::new(
            resolver(),
            make_config(vec!["CN"], vec![], GeoIpMode::Block, GeoIpDefaultAction::Block),
        );
        assert_eq!(
            block.check(addr("192.168.1.1")).unwrap(),
            GeoIpAction::Block { country: "unknown".into() }
        );
    }

    #[test]
    fn test_resolver_failure_is_an_error() {
        let filter = GeoIpFilter::new(
            Arc::new(Broken),
            make_config(vec!["CN"], vec![], GeoIpMode::Block, GeoIpDefaultAction::Allow),
        );
        assert!(filter.check(addr("203.0.113.10")).is_err());
    }

    #[test]
    fn test_unloaded_database_fails_lookups() {
        let resolver = MaxMindResolver::unloaded();
        assert!(resolver.lookup_country(addr("1.2.3.4")).is_err());
    }

    #[test]
    fn test_open_invalid_path() {
        assert!(MaxMindResolver::open(Path::new("/nonexistent/GeoLite2-Country.mmdb")).is_err());
        let config = GeoIpConfig {
            database_path: Some("/nonexistent/GeoLite2-Country.mmdb".into()),
            ..make_config(vec![], vec![], GeoIpMode::Block, GeoIpDefaultAction::Allow)
        };
        assert!(MaxMindResolver::from_config(&config).is_err());
    }

    #[test]
    fn test_from_config_without_path_is_unloaded() {
        let config = make_config(vec!["CN"], vec![], GeoIpMode::Block, GeoIpDefaultAction::Allow);
        let resolver = MaxMindResolver::from_config(&config).unwrap();
        assert!(resolver.lookup_country(addr("1.2.3.4")).is_err());

        let filter = GeoIpFilter::new(Arc::new(resolver), config);
        assert!(filter.check(addr("1.2.3.4")).is_err());
    }

    #[test]
    fn test_reload_invalid_path() {
        let resolver = MaxMindResolver::unloaded();
        assert!(resolver.reload(Path::new("/nonexistent/db.mmdb")).is_err());
    }
}
