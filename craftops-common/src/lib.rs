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

use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use regex::Regex;
use serde::Serialize;
use tracing::warn;

/// Desired/running task counts reported by the orchestrator. Desired is
/// always 0 or 1 for this system; it is an on/off switch, not an autoscaler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceCounts {
    pub desired: i32,
    pub running: i32,
}

/// Public addresses attached to the running tasks, in task order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublicAddresses {
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
}

/// Point-in-time snapshot of the managed service. Produced fresh on every
/// query and never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub desired: i32,
    pub running: i32,
    pub public_ips: Vec<String>,
    pub public_ips_v6: Vec<String>,
}

/// The orchestration-API surface the services depend on. Kept narrow so
/// tests can substitute recording fakes.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn counts(&self) -> anyhow::Result<ServiceCounts>;
    async fn scale_to(&self, desired: i32) -> anyhow::Result<()>;
    async fn public_addresses(&self) -> anyhow::Result<PublicAddresses>;
}

/// Full status snapshot: counts plus public addresses when tasks are
/// running. Address resolution is best-effort; a failure there degrades to
/// empty address lists instead of failing the status query.
pub async fn service_status(orchestrator: &dyn Orchestrator) -> anyhow::Result<ServiceStatus> {
    let counts = orchestrator.counts().await?;

    let addresses = if counts.running > 0 {
        match orchestrator.public_addresses().await {
            Ok(addresses) => addresses,
            Err(error) => {
                warn!(error = %error, "failed to resolve public addresses for status");
                PublicAddresses::default()
            }
        }
    } else {
        PublicAddresses::default()
    };

    Ok(ServiceStatus {
        desired: counts.desired,
        running: counts.running,
        public_ips: addresses.ipv4,
        public_ips_v6: addresses.ipv6,
    })
}

/// ECS/EC2-backed [`Orchestrator`] for a single service in a single cluster.
pub struct AwsEcs {
    ecs: aws_sdk_ecs::Client,
    ec2: aws_sdk_ec2::Client,
    cluster: String,
    service: String,
}

impl AwsEcs {
    pub async fn from_env(cluster: impl Into<String>, service: impl Into<String>) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self {
            ecs: aws_sdk_ecs::Client::new(&config),
            ec2: aws_sdk_ec2::Client::new(&config),
            cluster: cluster.into(),
            service: service.into(),
        }
    }

    async fn network_interface_ids(&self) -> anyhow::Result<Vec<String>> {
        let tasks = self
            .ecs
            .list_tasks()
            .cluster(&self.cluster)
            .service_name(&self.service)
            .send()
            .await
            .with_context(|| format!("failed to list tasks for service {}", self.service))?;

        let task_arns = tasks.task_arns().to_vec();
        if task_arns.is_empty() {
            return Ok(Vec::new());
        }

        let details = self
            .ecs
            .describe_tasks()
            .cluster(&self.cluster)
            .set_tasks(Some(task_arns))
            .send()
            .await
            .with_context(|| format!("failed to describe tasks for service {}", self.service))?;

        let mut interface_ids = Vec::new();
        for task in details.tasks() {
            for attachment in task.attachments() {
                if attachment.r#type() != Some("ElasticNetworkInterface") {
                    continue;
                }
                for detail in attachment.details() {
                    if detail.name() == Some("networkInterfaceId")
                        && let Some(value) = detail.value()
                    {
                        interface_ids.push(value.to_string());
                    }
                }
            }
        }
        Ok(interface_ids)
    }
}

#[async_trait]
impl Orchestrator for AwsEcs {
    async fn counts(&self) -> anyhow::Result<ServiceCounts> {
        let response = self
            .ecs
            .describe_services()
            .cluster(&self.cluster)
            .services(&self.service)
            .send()
            .await
            .with_context(|| format!("failed to describe service {}", self.service))?;

        let Some(service) = response.services().first() else {
            anyhow::bail!(
                "service {} not found in cluster {}",
                self.service,
                self.cluster
            );
        };

        Ok(ServiceCounts {
            desired: service.desired_count(),
            running: service.running_count(),
        })
    }

    async fn scale_to(&self, desired: i32) -> anyhow::Result<()> {
        self.ecs
            .update_service()
            .cluster(&self.cluster)
            .service(&self.service)
            .desired_count(desired)
            .send()
            .await
            .with_context(|| {
                format!(
                    "failed to update service {} to desired count {desired}",
                    self.service
                )
            })?;
        Ok(())
    }

    async fn public_addresses(&self) -> anyhow::Result<PublicAddresses> {
        let mut addresses = PublicAddresses::default();

        for interface_id in self.network_interface_ids().await? {
            // One unreadable interface must not fail the whole lookup.
            let response = match self
                .ec2
                .describe_network_interfaces()
                .network_interface_ids(&interface_id)
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    warn!(
                        interface_id = %interface_id,
                        error = %error,
                        "failed to describe network interface, skipping"
                    );
                    continue;
                }
            };

            for interface in response.network_interfaces() {
                if let Some(public_ip) = interface.association().and_then(|a| a.public_ip()) {
                    addresses.ipv4.push(public_ip.to_string());
                }
                for ipv6 in interface.ipv6_addresses() {
                    if let Some(address) = ipv6.ipv6_address() {
                        addresses.ipv6.push(address.to_string());
                    }
                }
            }
        }

        Ok(addresses)
    }
}

/// Parse the player count out of a Minecraft `list` response such as
/// `There are 2 of a max of 20 players online: Alice, Bob`.
///
/// Returns `None` when the response does not match that format. Callers
/// treat a `None` as a failed probe, not as an empty server.
pub fn parse_player_count(response: &str) -> Option<u32> {
    let re = Regex::new(r"There are (\d+) of a max of \d+ players online").unwrap();
    let captures = re.captures(response)?;
    captures[1].parse().ok()
}

/// Environment-configuration reader that validates eagerly and reports every
/// missing or unparseable variable at once instead of failing on the first.
///
/// The lookup is injectable so tests never touch the process environment.
pub struct EnvReader {
    lookup: Box<dyn Fn(&str) -> Option<String>>,
    missing: Vec<String>,
    invalid: Vec<String>,
}

impl EnvReader {
    pub fn from_env() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
            missing: Vec::new(),
            invalid: Vec::new(),
        }
    }

    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|value| !value.is_empty())
    }

    /// Read a required variable. Absence is recorded and reported by
    /// [`EnvReader::finish`]; the returned placeholder is never used because
    /// `finish` fails before the config is handed out.
    pub fn require(&mut self, name: &str) -> String {
        match self.get(name) {
            Some(value) => value,
            None => {
                self.missing.push(name.to_string());
                String::new()
            }
        }
    }

    pub fn optional(&self, name: &str) -> Option<String> {
        self.get(name)
    }

    pub fn optional_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    /// Read an optional variable parsed as `T`, falling back to `default`
    /// when unset. A present-but-unparseable value is a startup error.
    pub fn parsed_or<T: std::str::FromStr>(&mut self, name: &str, default: T) -> T {
        match self.get(name) {
            Some(raw) => match raw.parse() {
                Ok(value) => value,
                Err(_) => {
                    self.invalid.push(format!("{name}={raw}"));
                    default
                }
            },
            None => default,
        }
    }

    pub fn finish(self) -> anyhow::Result<()> {
        if self.missing.is_empty() && self.invalid.is_empty() {
            return Ok(());
        }

        let mut problems = Vec::new();
        if !self.missing.is_empty() {
            problems.push(format!(
                "missing required environment variables: {}",
                self.missing.join(", ")
            ));
        }
        if !self.invalid.is_empty() {
            problems.push(format!(
                "unparseable environment variables: {}",
                self.invalid.join(", ")
            ));
        }
        anyhow::bail!("{}", problems.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[test]
    fn parse_player_count_reads_empty_server() {
        let count = parse_player_count("There are 0 of a max of 20 players online:");
        assert_eq!(count, Some(0));
    }

    #[test]
    fn parse_player_count_reads_populated_server() {
        let count = parse_player_count("There are 2 of a max of 20 players online: Alice, Bob");
        assert_eq!(count, Some(2));
    }

    #[test]
    fn parse_player_count_reads_multi_digit_counts() {
        let count = parse_player_count("There are 14 of a max of 100 players online: ...");
        assert_eq!(count, Some(14));
    }

    #[test]
    fn parse_player_count_rejects_unexpected_format() {
        assert_eq!(parse_player_count("Unknown command: list"), None);
        assert_eq!(parse_player_count(""), None);
    }

    fn reader_over(vars: &[(&str, &str)]) -> EnvReader {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        EnvReader::with_lookup(move |name| map.get(name).cloned())
    }

    #[test]
    fn env_reader_reports_all_missing_variables_at_once() {
        let mut env = reader_over(&[("ECS_CLUSTER", "mc-cluster")]);
        let cluster = env.require("ECS_CLUSTER");
        let _ = env.require("ECS_SERVICE");
        let _ = env.require("RCON_HOST");

        assert_eq!(cluster, "mc-cluster");
        let error = env.finish().unwrap_err().to_string();
        assert!(error.contains("ECS_SERVICE"));
        assert!(error.contains("RCON_HOST"));
        assert!(!error.contains("ECS_CLUSTER"));
    }

    #[test]
    fn env_reader_treats_empty_values_as_missing() {
        let mut env = reader_over(&[("ECS_CLUSTER", "")]);
        let _ = env.require("ECS_CLUSTER");
        assert!(env.finish().is_err());
    }

    #[test]
    fn env_reader_applies_defaults_and_parses_overrides() {
        let mut env = reader_over(&[("CHECK_INTERVAL", "30")]);
        assert_eq!(env.parsed_or("CHECK_INTERVAL", 60_u64), 30);
        assert_eq!(env.parsed_or("IDLE_THRESHOLD", 600_u64), 600);
        assert_eq!(env.optional_or("RCON_PORT", "25575"), "25575");
        assert!(env.optional("DISCORD_WEBHOOK").is_none());
        assert!(env.finish().is_ok());
    }

    #[test]
    fn env_reader_rejects_unparseable_values() {
        let mut env = reader_over(&[("CHECK_INTERVAL", "soon")]);
        assert_eq!(env.parsed_or("CHECK_INTERVAL", 60_u64), 60);
        let error = env.finish().unwrap_err().to_string();
        assert!(error.contains("CHECK_INTERVAL=soon"));
    }

    struct FakeOrchestrator {
        counts: ServiceCounts,
        addresses: anyhow::Result<PublicAddresses>,
        address_queries: Mutex<u32>,
    }

    impl FakeOrchestrator {
        fn new(counts: ServiceCounts, addresses: anyhow::Result<PublicAddresses>) -> Self {
            Self {
                counts,
                addresses,
                address_queries: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Orchestrator for FakeOrchestrator {
        async fn counts(&self) -> anyhow::Result<ServiceCounts> {
            Ok(self.counts)
        }

        async fn scale_to(&self, _desired: i32) -> anyhow::Result<()> {
            Ok(())
        }

        async fn public_addresses(&self) -> anyhow::Result<PublicAddresses> {
            *self.address_queries.lock().unwrap() += 1;
            match &self.addresses {
                Ok(addresses) => Ok(addresses.clone()),
                Err(error) => Err(anyhow::anyhow!("{error}")),
            }
        }
    }

    #[tokio::test]
    async fn service_status_skips_address_lookup_when_nothing_runs() {
        let orchestrator = FakeOrchestrator::new(
            ServiceCounts {
                desired: 0,
                running: 0,
            },
            Ok(PublicAddresses {
                ipv4: vec!["5.6.7.8".to_string()],
                ipv6: vec![],
            }),
        );

        let status = service_status(&orchestrator).await.unwrap();

        assert!(status.public_ips.is_empty());
        assert!(status.public_ips_v6.is_empty());
        assert_eq!(*orchestrator.address_queries.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn service_status_includes_addresses_for_running_tasks() {
        let orchestrator = FakeOrchestrator::new(
            ServiceCounts {
                desired: 1,
                running: 1,
            },
            Ok(PublicAddresses {
                ipv4: vec!["5.6.7.8".to_string()],
                ipv6: vec!["2001:db8::1".to_string()],
            }),
        );

        let status = service_status(&orchestrator).await.unwrap();

        assert_eq!(status.desired, 1);
        assert_eq!(status.running, 1);
        assert_eq!(status.public_ips, vec!["5.6.7.8".to_string()]);
        assert_eq!(status.public_ips_v6, vec!["2001:db8::1".to_string()]);
    }

    #[tokio::test]
    async fn service_status_survives_address_resolution_failure() {
        let orchestrator = FakeOrchestrator::new(
            ServiceCounts {
                desired: 1,
                running: 1,
            },
            Err(anyhow::anyhow!("eni lookup denied")),
        );

        let status = service_status(&orchestrator).await.unwrap();

        assert_eq!(status.running, 1);
        assert!(status.public_ips.is_empty());
    }
}
