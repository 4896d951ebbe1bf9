//! Mail exchanger lookup, following RFC 5321 section 5.1.
//!
//! [`mail_exchangers`] turns a recipient domain into an ordered list of hosts
//! to try: MX records sorted by preference with equal preferences shuffled,
//! or the domain itself as an implicit MX when it has none. Address literals
//! skip DNS entirely.

use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    ResolveError, TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use postern_common::{Domain, internal, tracing};
use rand::{Rng, seq::SliceRandom};

use crate::{config::DnsConfig, error::DnsError};

const MIN_CACHE_TTL: u32 = 60;
const MAX_CACHE_TTL: u32 = 3600;

/// One host to try for a domain.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MxRecord {
    pub priority: u16,
    pub exchange: String,
}

impl MxRecord {
    #[must_use]
    pub fn new(priority: u16, exchange: impl Into<String>) -> Self {
        Self {
            priority,
            exchange: exchange.into(),
        }
    }

    /// The domain itself, standing in for a missing MX.
    #[must_use]
    pub fn implicit(host: impl Into<String>) -> Self {
        Self::new(0, host)
    }

    /// RFC 7505: a single `0 .` record means the domain takes no mail.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.exchange.is_empty() || self.exchange == "."
    }
}

#[async_trait]
pub trait Resolve: Send + Sync {
    /// MX records for `domain`, in whatever order the server gave them.
    async fn mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError>;

    /// A and AAAA records for `host`.
    async fn addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}

/// The hosts to try for `domain`, best first.
///
/// A missing domain or missing MX records fall back to the domain as an
/// implicit MX. Any other lookup failure is returned to the caller.
#[tracing::instrument(level = "trace", skip_all, fields(%domain))]
pub async fn mail_exchangers(
    resolver: &dyn Resolve,
    domain: &Domain,
) -> Result<Vec<MxRecord>, DnsError> {
    if let Some(ip) = domain.ip_literal() {
        return Ok(vec![MxRecord::implicit(ip.to_string())]);
    }

    let mut records = match resolver.mx(domain).await {
        Ok(records) if !records.is_empty() => records,
        Ok(_) | Err(DnsError::NotFound(_)) => {
            internal!(level = DEBUG, "No MX for {domain}, using implicit MX");
            vec![MxRecord::implicit(domain.as_str())]
        }
        Err(err) => return Err(err),
    };

    order(&mut records, &mut rand::rng());
    Ok(records)
}

/// Sort by preference, shuffling hosts that share one.
pub fn order<R: Rng + ?Sized>(records: &mut [MxRecord], rng: &mut R) {
    records.sort_by_key(|record| record.priority);
    for tier in records.chunk_by_mut(|a, b| a.priority == b.priority) {
        tier.shuffle(rng);
    }
}

struct Cached {
    records: Vec<MxRecord>,
    expires_at: Instant,
}

/// System resolver with a small MX cache.
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: DashMap<String, Cached>,
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl DnsResolver {
    pub fn new(config: &DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|err| DnsError::Resolver(err.to_string()))?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
        })
    }
}

fn classify(name: &str, err: &ResolveError) -> DnsError {
    if err.is_nx_domain() || err.is_no_records_found() {
        DnsError::NotFound(name.to_string())
    } else {
        DnsError::Lookup {
            name: name.to_string(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl Resolve for DnsResolver {
    async fn mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError> {
        if let Some(cached) = self.cache.get(domain)
            && cached.expires_at > Instant::now()
        {
            return Ok(cached.records.clone());
        }

        let lookup = self
            .resolver
            .mx_lookup(domain)
            .await
            .map_err(|err| classify(domain, &err))?;

        let ttl = lookup
            .as_lookup()
            .records()
            .iter()
            .map(hickory_resolver::proto::rr::Record::ttl)
            .min()
            .unwrap_or(MIN_CACHE_TTL)
            .clamp(MIN_CACHE_TTL, MAX_CACHE_TTL);

        let records: Vec<_> = lookup
            .iter()
            .map(|mx| {
                let exchange = mx.exchange().to_utf8();
                MxRecord::new(mx.preference(), exchange.trim_end_matches('.'))
            })
            .collect();

        self.cache.insert(
            domain.to_string(),
            Cached {
                records: records.clone(),
                expires_at: Instant::now() + Duration::from_secs(u64::from(ttl)),
            },
        );

        Ok(records)
    }

    async fn addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse() {
            return Ok(vec![ip]);
        }

        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|err| classify(host, &err))?;

        Ok(lookup.iter().collect())
    }
}

/// Fixed answers, for tests and for routing domains to known hosts.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    mx: AHashMap<String, Vec<MxRecord>>,
    hosts: AHashMap<String, Vec<IpAddr>>,
    failing: AHashSet<String>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_mx(mut self, domain: &str, priority: u16, exchange: &str) -> Self {
        self.mx
            .entry(domain.to_ascii_lowercase())
            .or_default()
            .push(MxRecord::new(priority, exchange));
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: &str, address: IpAddr) -> Self {
        self.hosts
            .entry(host.to_ascii_lowercase())
            .or_default()
            .push(address);
        self
    }

    /// Make every lookup of `name` fail with a server error.
    #[must_use]
    pub fn with_failure(mut self, name: &str) -> Self {
        self.failing.insert(name.to_ascii_lowercase());
        self
    }

    fn check(&self, name: &str) -> Result<(), DnsError> {
        if self.failing.contains(name) {
            return Err(DnsError::Lookup {
                name: name.to_string(),
                reason: "SERVFAIL".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError> {
        self.check(domain)?;
        self.mx
            .get(domain)
            .cloned()
            .ok_or_else(|| DnsError::NotFound(domain.to_string()))
    }

    async fn addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse() {
            return Ok(vec![ip]);
        }
        self.check(host)?;
        self.hosts
            .get(host)
            .cloned()
            .ok_or_else(|| DnsError::NotFound(host.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;

    use super::*;

    fn exchanges(records: &[MxRecord]) -> Vec<&str> {
        records.iter().map(|r| r.exchange.as_str()).collect()
    }

    #[tokio::test]
    async fn lower_preference_first_and_ties_shuffled() {
        let resolver = StaticResolver::new()
            .with_mx("example.com", 20, "a.example.com")
            .with_mx("example.com", 10, "b.example.com")
            .with_mx("example.com", 10, "c.example.com");
        let domain = Domain::new("example.com");

        let mut seen = HashSet::new();
        for _ in 0..64 {
            let records = mail_exchangers(&resolver, &domain).await.unwrap();
            let order = exchanges(&records)
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>();

            assert_eq!(order[2], "a.example.com");
            seen.insert(order);
        }

        assert_eq!(seen.len(), 2, "both orders of the tied hosts should appear");
    }

    #[tokio::test]
    async fn missing_mx_falls_back_to_the_domain() {
        let resolver = StaticResolver::new();
        let records = mail_exchangers(&resolver, &Domain::new("nomx.test"))
            .await
            .unwrap();

        assert_eq!(records, vec![MxRecord::implicit("nomx.test")]);
    }

    #[tokio::test]
    async fn server_failure_is_returned() {
        let resolver = StaticResolver::new().with_failure("broken.test");
        let err = mail_exchangers(&resolver, &Domain::new("broken.test"))
            .await
            .unwrap_err();

        assert!(matches!(err, DnsError::Lookup { .. }));
    }

    #[tokio::test]
    async fn address_literal_skips_dns() {
        let resolver = StaticResolver::new().with_failure("[192.0.2.7]");
        let records = mail_exchangers(&resolver, &Domain::new("[192.0.2.7]"))
            .await
            .unwrap();

        assert_eq!(exchanges(&records), vec!["192.0.2.7"]);
        assert_eq!(
            resolver.addresses("192.0.2.7").await.unwrap(),
            vec!["192.0.2.7".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn null_mx() {
        assert!(MxRecord::new(0, ".").is_null());
        assert!(MxRecord::new(0, "").is_null());
        assert!(!MxRecord::implicit("example.com").is_null());
    }
}
