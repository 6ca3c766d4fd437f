//! Bounded polling until an instance answers on its SSH port.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};

use super::{Instance, InstanceStatus, ProviderError, SSH_PORT};

/// Polling cadence and probe settings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReachabilityPolicy {
    /// Delay between provider status refreshes.
    pub poll_interval: Duration,
    /// Connect timeout of each TCP probe.
    pub probe_timeout: Duration,
    /// Port probed once the provider reports the instance running.
    pub port: u16,
}

impl Default for ReachabilityPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            port: SSH_PORT,
        }
    }
}

/// Refreshes the instance through `refresh` until it is running, has a
/// public address, and accepts TCP connections on the policy's port.
///
/// Transient upstream errors are retried. Every suspension, including each
/// refresh, is bounded by the time left before `limit` expires.
///
/// # Errors
///
/// Returns [`ProviderError::ProvisionTimeout`] when `limit` expires,
/// [`ProviderError::InstanceFailed`] when the provider reports the instance
/// terminated, and any non-upstream error from `refresh`.
pub async fn wait_until_reachable<F, Fut>(
    instance_id: &str,
    limit: Duration,
    policy: ReachabilityPolicy,
    mut refresh: F,
) -> Result<Instance, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Instance, ProviderError>>,
{
    let started = Instant::now();
    let deadline = started + limit;
    let expired = || ProviderError::ProvisionTimeout {
        instance_id: instance_id.to_owned(),
        waited: limit,
    };

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(expired());
        }

        let refreshed = timeout(remaining, refresh()).await.map_err(|_| expired())?;
        match refreshed {
            Ok(instance) if instance.status == InstanceStatus::Terminated => {
                return Err(ProviderError::InstanceFailed {
                    instance_id: instance.id,
                    state: String::from("terminated"),
                });
            }
            Ok(instance) => {
                if instance.status != InstanceStatus::Provisioning
                    && let Some(ip) = instance.public_ip
                {
                    let left = deadline.saturating_duration_since(Instant::now());
                    let addr = SocketAddr::new(ip, policy.port);
                    if probe(addr, policy.probe_timeout.min(left)).await {
                        return Ok(Instance {
                            status: InstanceStatus::Ready,
                            ..instance
                        });
                    }
                    tracing::debug!(instance = %instance.id, %ip, "ssh port not answering yet");
                }
            }
            Err(ProviderError::Upstream { message, .. }) => {
                tracing::warn!(
                    instance = %instance_id,
                    %message,
                    "status refresh failed; retrying"
                );
            }
            Err(other) => return Err(other),
        }

        let left = deadline.saturating_duration_since(Instant::now());
        sleep(policy.poll_interval.min(left)).await;
    }
}

async fn probe(addr: SocketAddr, limit: Duration) -> bool {
    matches!(timeout(limit, TcpStream::connect(addr)).await, Ok(Ok(_)))
}
