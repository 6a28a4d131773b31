//! Reverse DNS for connecting clients.

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::{TokioResolver, name_server::TokioConnectionProvider};

use crate::error::DnsError;

/// PTR lookup behind a trait so sessions can be tested without a network.
#[async_trait]
pub trait ReverseDns: Send + Sync {
    /// Resolve the PTR name for an address. `Ok(None)` means the lookup
    /// succeeded but no record exists.
    async fn reverse(&self, addr: IpAddr) -> Result<Option<String>, DnsError>;
}

/// System-configured resolver.
pub struct HickoryReverseDns {
    resolver: TokioResolver,
}

impl HickoryReverseDns {
    pub fn new() -> Result<Self, DnsError> {
        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|e| DnsError::Init(e.to_string()))?
            .build();

        Ok(Self { resolver })
    }
}

#[async_trait]
impl ReverseDns for HickoryReverseDns {
    async fn reverse(&self, addr: IpAddr) -> Result<Option<String>, DnsError> {
        let lookup = self.resolver.reverse_lookup(addr).await?;

        Ok(lookup
            .iter()
            .next()
            .map(|ptr| ptr.0.to_utf8().trim_end_matches('.').to_string()))
    }
}
