// Copyright (C) 2026 Craftops
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use craftops_common::{AwsEcs, EnvReader, Orchestrator};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

const CLOUDFLARE_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

struct Config {
    cluster: String,
    service: String,
    api_token: String,
    zone_id: String,
    record_name: String,
    poll_interval: Duration,
    run_once: bool,
}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        let mut env = EnvReader::from_env();
        let cluster = env.require("ECS_CLUSTER");
        let service = env.require("ECS_SERVICE");
        let api_token = env.require("CLOUDFLARE_API_TOKEN");
        let zone_id = env.require("CLOUDFLARE_ZONE_ID");
        let record_name = env.require("DNS_RECORD_NAME");
        let poll_interval = Duration::from_secs(env.parsed_or("POLL_INTERVAL", 60_u64));
        let run_once = env.parsed_or("RUN_ONCE", false);
        env.finish()?;
        Ok(Self {
            cluster,
            service,
            api_token,
            zone_id,
            record_name,
            poll_interval,
            run_once,
        })
    }
}

/// A DNS record as the provider reports it. The sync only ever overwrites
/// `content`; id, name, type, and ttl are read back as-is.
#[derive(Debug, Clone, Deserialize)]
struct DnsRecord {
    id: String,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    content: String,
    ttl: u32,
}

#[async_trait]
trait DnsProvider: Send + Sync {
    /// Read the record for the configured name, `None` when absent.
    async fn fetch_record(&self, record_type: &str) -> anyhow::Result<Option<DnsRecord>>;
    /// Idempotent content overwrite; `false` on any provider-side failure.
    async fn update_record(&self, record: &DnsRecord, content: &str) -> bool;
}

struct CloudflareDns {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    zone_id: String,
    record_name: String,
}

#[derive(Debug, Deserialize)]
struct RecordListResponse {
    success: bool,
    #[serde(default)]
    result: Vec<DnsRecord>,
}

#[derive(Debug, Deserialize)]
struct RecordUpdateResponse {
    success: bool,
}

impl CloudflareDns {
    fn new(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build Cloudflare HTTP client")?;
        Ok(Self {
            client,
            base_url: CLOUDFLARE_BASE_URL.to_string(),
            api_token: config.api_token.clone(),
            zone_id: config.zone_id.clone(),
            record_name: config.record_name.clone(),
        })
    }
}

#[async_trait]
impl DnsProvider for CloudflareDns {
    async fn fetch_record(&self, record_type: &str) -> anyhow::Result<Option<DnsRecord>> {
        let url = format!("{}/zones/{}/dns_records", self.base_url, self.zone_id);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_token)
            .query(&[("name", self.record_name.as_str()), ("type", record_type)])
            .send()
            .await
            .context("DNS record lookup request failed")?
            .error_for_status()
            .context("DNS record lookup rejected")?;

        let body: RecordListResponse = response
            .json()
            .await
            .context("invalid DNS record lookup payload")?;
        if !body.success {
            anyhow::bail!(
                "DNS record lookup for {} returned success = false",
                self.record_name
            );
        }
        Ok(body.result.into_iter().next())
    }

    async fn update_record(&self, record: &DnsRecord, content: &str) -> bool {
        let url = format!(
            "{}/zones/{}/dns_records/{}",
            self.base_url, self.zone_id, record.id
        );
        let payload = serde_json::json!({
            "type": record.record_type,
            "name": record.name,
            "content": content,
            "ttl": record.ttl,
            "proxied": false,
        });

        let response = match self
            .client
            .put(url)
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                error!(record = %record.name, error = %error, "DNS record update request failed");
                return false;
            }
        };

        match response.error_for_status() {
            Ok(response) => match response.json::<RecordUpdateResponse>().await {
                Ok(body) => body.success,
                Err(error) => {
                    error!(error = %error, "invalid DNS record update payload");
                    false
                }
            },
            Err(error) => {
                error!(error = %error, "DNS record update rejected");
                false
            }
        }
    }
}

/// One publish cycle: discover the tasks' public addresses, then bring the
/// A record (and, when an IPv6 address exists, the AAAA record) in line.
/// Without an IPv4 address the cycle is a logged skip and touches no DNS.
async fn sync_once(orchestrator: &dyn Orchestrator, dns: &dyn DnsProvider) -> anyhow::Result<()> {
    let addresses = orchestrator
        .public_addresses()
        .await
        .context("failed to discover public addresses")?;

    let Some(ipv4) = addresses.ipv4.first() else {
        info!("no public IPv4 address found for service, skipping DNS sync");
        return Ok(());
    };

    let mut all_ok = sync_record(dns, "A", ipv4).await;

    match addresses.ipv6.first() {
        Some(ipv6) => all_ok &= sync_record(dns, "AAAA", ipv6).await,
        None => debug!("no public IPv6 address, skipping AAAA sync this cycle"),
    }

    if !all_ok {
        anyhow::bail!("one or more DNS record updates failed");
    }
    Ok(())
}

/// Returns false only when an update was attempted and failed. A missing
/// record (never created here) or an already-matching record is fine.
async fn sync_record(dns: &dyn DnsProvider, record_type: &str, address: &str) -> bool {
    let record = match dns.fetch_record(record_type).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!(record_type, "DNS record not found, skipping");
            return true;
        }
        Err(error) => {
            error!(record_type, error = %error, "failed to read DNS record");
            return false;
        }
    };

    if record.content == address {
        info!(record_type, content = %record.content, "DNS record already up to date");
        return true;
    }

    info!(record_type, from = %record.content, to = %address, "updating DNS record");
    if dns.update_record(&record, address).await {
        info!(record_type, "DNS record updated");
        true
    } else {
        error!(record_type, "failed to update DNS record");
        false
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dns_sync_service=debug".to_string()),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        record = %config.record_name,
        cluster = %config.cluster,
        service = %config.service,
        "starting DNS sync"
    );

    let orchestrator = AwsEcs::from_env(config.cluster.clone(), config.service.clone()).await;
    let dns = CloudflareDns::new(&config)?;

    if config.run_once {
        return sync_once(&orchestrator, &dns).await;
    }

    loop {
        if let Err(error) = sync_once(&orchestrator, &dns).await {
            error!(error = %error, "DNS sync cycle failed");
        }
        debug!(
            seconds = config.poll_interval.as_secs(),
            "sleeping until next DNS sync"
        );
        tokio::time::sleep(config.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use craftops_common::{PublicAddresses, ServiceCounts};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeOrchestrator {
        addresses: PublicAddresses,
    }

    #[async_trait]
    impl Orchestrator for FakeOrchestrator {
        async fn counts(&self) -> anyhow::Result<ServiceCounts> {
            Ok(ServiceCounts {
                desired: 1,
                running: 1,
            })
        }

        async fn scale_to(&self, _desired: i32) -> anyhow::Result<()> {
            Ok(())
        }

        async fn public_addresses(&self) -> anyhow::Result<PublicAddresses> {
            Ok(self.addresses.clone())
        }
    }

    #[derive(Default)]
    struct FakeDns {
        records: HashMap<String, DnsRecord>,
        fail_updates: bool,
        fetches: Mutex<Vec<String>>,
        updates: Mutex<Vec<(String, String)>>,
    }

    impl FakeDns {
        fn with_record(mut self, record_type: &str, content: &str) -> Self {
            self.records.insert(
                record_type.to_string(),
                DnsRecord {
                    id: format!("rec-{record_type}"),
                    name: "mc.example.com".to_string(),
                    record_type: record_type.to_string(),
                    content: content.to_string(),
                    ttl: 120,
                },
            );
            self
        }
    }

    #[async_trait]
    impl DnsProvider for FakeDns {
        async fn fetch_record(&self, record_type: &str) -> anyhow::Result<Option<DnsRecord>> {
            self.fetches.lock().unwrap().push(record_type.to_string());
            Ok(self.records.get(record_type).cloned())
        }

        async fn update_record(&self, record: &DnsRecord, content: &str) -> bool {
            self.updates
                .lock()
                .unwrap()
                .push((record.record_type.clone(), content.to_string()));
            !self.fail_updates
        }
    }

    fn ipv4_only(address: &str) -> FakeOrchestrator {
        FakeOrchestrator {
            addresses: PublicAddresses {
                ipv4: vec![address.to_string()],
                ipv6: vec![],
            },
        }
    }

    #[tokio::test]
    async fn matching_content_issues_no_update() {
        let orchestrator = ipv4_only("5.6.7.8");
        let dns = FakeDns::default().with_record("A", "5.6.7.8");

        sync_once(&orchestrator, &dns).await.unwrap();

        assert!(dns.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn changed_address_issues_exactly_one_update() {
        let orchestrator = ipv4_only("5.6.7.9");
        let dns = FakeDns::default().with_record("A", "5.6.7.8");

        sync_once(&orchestrator, &dns).await.unwrap();

        assert_eq!(
            *dns.updates.lock().unwrap(),
            vec![("A".to_string(), "5.6.7.9".to_string())]
        );
    }

    #[tokio::test]
    async fn missing_ipv4_skips_the_cycle_without_dns_calls() {
        let orchestrator = FakeOrchestrator {
            addresses: PublicAddresses {
                ipv4: vec![],
                ipv6: vec!["2001:db8::1".to_string()],
            },
        };
        let dns = FakeDns::default().with_record("A", "5.6.7.8");

        sync_once(&orchestrator, &dns).await.unwrap();

        assert!(dns.fetches.lock().unwrap().is_empty());
        assert!(dns.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ipv6_address_syncs_the_aaaa_record_independently() {
        let orchestrator = FakeOrchestrator {
            addresses: PublicAddresses {
                ipv4: vec!["5.6.7.8".to_string()],
                ipv6: vec!["2001:db8::2".to_string()],
            },
        };
        let dns = FakeDns::default()
            .with_record("A", "5.6.7.8")
            .with_record("AAAA", "2001:db8::1");

        sync_once(&orchestrator, &dns).await.unwrap();

        assert_eq!(
            *dns.updates.lock().unwrap(),
            vec![("AAAA".to_string(), "2001:db8::2".to_string())]
        );
    }

    #[tokio::test]
    async fn missing_ipv6_skips_only_the_aaaa_sync() {
        let orchestrator = ipv4_only("5.6.7.8");
        let dns = FakeDns::default()
            .with_record("A", "5.6.7.8")
            .with_record("AAAA", "2001:db8::1");

        sync_once(&orchestrator, &dns).await.unwrap();

        assert_eq!(*dns.fetches.lock().unwrap(), vec!["A".to_string()]);
        assert!(dns.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_record_is_a_skip_not_an_error() {
        let orchestrator = ipv4_only("5.6.7.8");
        let dns = FakeDns::default();

        sync_once(&orchestrator, &dns).await.unwrap();

        assert!(dns.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_update_fails_the_cycle_but_still_syncs_aaaa() {
        let orchestrator = FakeOrchestrator {
            addresses: PublicAddresses {
                ipv4: vec!["5.6.7.9".to_string()],
                ipv6: vec!["2001:db8::2".to_string()],
            },
        };
        let mut dns = FakeDns::default()
            .with_record("A", "5.6.7.8")
            .with_record("AAAA", "2001:db8::1");
        dns.fail_updates = true;

        let result = sync_once(&orchestrator, &dns).await;

        assert!(result.is_err());
        let attempted: Vec<String> = dns
            .updates
            .lock()
            .unwrap()
            .iter()
            .map(|(record_type, _)| record_type.clone())
            .collect();
        assert_eq!(attempted, vec!["A".to_string(), "AAAA".to_string()]);
    }
}
