//! Drives one deployment from size selection to a reachable app.
//!
//! Each session runs in its own task and moves strictly forward through
//! [`DeploymentState`]. Every stage logs at least one line before the state
//! changes, and cancellation is honoured between stages. Nothing is rolled
//! back: a failure after provisioning names the instance left running.

pub mod error;
pub mod plan;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::Instrument;

use crate::config::HangarConfig;
use crate::files;
use crate::provider::{
    DnsRecord, Instance, InstanceSpec, Provider, ProviderError, ProviderRegistry, SSH_PORT, Size,
};
use crate::request::DeploymentRequest;
use crate::runner::{CommandRunner, NullSink};
use crate::selector::pick_for_region;
use crate::session::{
    DeploymentSession, DeploymentState, FAILURE_LOG_TAIL, FailureReport, SessionLogSink,
    TerminalLaunch,
};
use crate::ssh::{SshChannel, SshError, SshSettings, SshTarget};

pub use error::DeployError;
use plan::{
    CERTIFICATE_CHECK, PlanContext, PlannedCommand, certificate_issued, install_plan, tls_commands,
};

/// Bound on individual provider API calls made by the orchestrator.
const API_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs deployments against the registered providers.
#[derive(Clone)]
pub struct Orchestrator {
    registry: ProviderRegistry,
    runner: Arc<dyn CommandRunner>,
    ssh: SshSettings,
    ssh_user: String,
    provision_timeout: Duration,
    tls_timeout: Duration,
    connect_backoff: Duration,
    connect_backoff_max: Duration,
    tls_poll_interval: Duration,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("providers", &self.registry.names())
            .field("ssh", &self.ssh)
            .field("ssh_user", &self.ssh_user)
            .field("provision_timeout", &self.provision_timeout)
            .field("tls_timeout", &self.tls_timeout)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator with default retry pacing.
    #[must_use]
    pub fn new(
        registry: ProviderRegistry,
        runner: Arc<dyn CommandRunner>,
        ssh: SshSettings,
        ssh_user: impl Into<String>,
        provision_timeout: Duration,
        tls_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            runner,
            ssh,
            ssh_user: ssh_user.into(),
            provision_timeout,
            tls_timeout,
            connect_backoff: Duration::from_secs(2),
            connect_backoff_max: Duration::from_secs(16),
            tls_poll_interval: Duration::from_secs(5),
        }
    }

    /// Creates an orchestrator from loaded configuration.
    #[must_use]
    pub fn from_config(
        config: &HangarConfig,
        registry: ProviderRegistry,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self::new(
            registry,
            runner,
            config.ssh_settings(),
            config.ssh_user.clone(),
            config.provision_timeout(),
            config.tls_timeout(),
        )
    }

    /// Overrides the SSH connect backoff; the delay doubles up to `max`.
    #[must_use]
    pub const fn with_connect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.connect_backoff = initial;
        self.connect_backoff_max = max;
        self
    }

    /// Overrides how often certificate issuance is checked.
    #[must_use]
    pub const fn with_tls_poll_interval(mut self, interval: Duration) -> Self {
        self.tls_poll_interval = interval;
        self
    }

    /// Runs `request` on its own task.
    pub fn spawn(
        &self,
        session: Arc<DeploymentSession>,
        request: DeploymentRequest,
    ) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let span = tracing::info_span!(
            "deployment",
            session = %request.session_id,
            app = %request.app.name,
            provider = %request.provider,
        );
        tokio::spawn(
            async move {
                orchestrator.run(&session, &request).await;
            }
            .instrument(span),
        )
    }

    /// Runs `request` to a terminal state, recording progress on `session`.
    pub async fn run(&self, session: &DeploymentSession, request: &DeploymentRequest) {
        match self.deploy(session, request).await {
            Ok(url) => {
                session.status(format!("deployment complete: {url}"));
                session.set_state(DeploymentState::Completed);
                tracing::info!(%url, "deployment complete");
            }
            Err(err) => fail(session, &err),
        }
    }

    async fn deploy(
        &self,
        session: &DeploymentSession,
        request: &DeploymentRequest,
    ) -> Result<String, DeployError> {
        let provider = self
            .registry
            .get(&request.provider)
            .ok_or_else(|| DeployError::UnknownProvider(request.provider.clone()))?;

        let size = select_size(session, provider.as_ref(), request).await?;
        let created = self.provision(session, provider.as_ref(), request, &size).await?;
        let window_end = Instant::now() + self.provision_timeout;
        let ready = self.await_reachable(session, provider.as_ref(), request, &created).await?;
        let host = ready.public_ip.ok_or_else(|| {
            DeployError::Provision(ProviderError::Provision {
                provider: request.provider.clone(),
                message: format!("instance {} has no public address", ready.id),
            })
        })?;

        let channel = self.connect(session, request, host, window_end).await?;
        session.set_terminal(TerminalLaunch {
            program: channel.ssh_bin().to_owned(),
            args: channel.pty_args(),
        });

        let outcome = self
            .configure(session, provider.as_ref(), request, &channel, host)
            .await;
        if matches!(outcome, Err(DeployError::Cancelled { .. }))
            && let Err(err) = channel.close().await
        {
            tracing::debug!(error = %err, "closing control master failed");
        }
        outcome
    }

    async fn provision(
        &self,
        session: &DeploymentSession,
        provider: &dyn Provider,
        request: &DeploymentRequest,
        size: &Size,
    ) -> Result<Instance, DeployError> {
        enter(
            session,
            DeploymentState::Provisioning,
            &format!(
                "creating instance {} ({}) in {}",
                request.hostname, size.slug, request.region
            ),
        )?;

        let spec = InstanceSpec {
            name: request.hostname.clone(),
            region: request.region.clone(),
            size: size.slug.clone(),
            ssh_public_key: request.key_pair.public_key.clone(),
            tags: vec![
                String::from("hangar"),
                format!("hangar-app-{}", request.app.name),
            ],
        };
        let instance = timeout(
            self.provision_timeout,
            provider.create_instance(&request.credentials, &spec),
        )
        .await
        .map_err(|_| {
            DeployError::Provision(ProviderError::Provision {
                provider: request.provider.clone(),
                message: format!(
                    "create call did not return within {} seconds",
                    self.provision_timeout.as_secs()
                ),
            })
        })?
        .map_err(DeployError::from_create)?;

        session.status(format!("created instance {instance}"));
        session.set_instance(instance.clone());
        Ok(instance)
    }

    async fn await_reachable(
        &self,
        session: &DeploymentSession,
        provider: &dyn Provider,
        request: &DeploymentRequest,
        created: &Instance,
    ) -> Result<Instance, DeployError> {
        let limit = self.provision_timeout;
        enter(
            session,
            DeploymentState::AwaitingSsh,
            &format!(
                "waiting up to {} seconds for instance {} to accept SSH",
                limit.as_secs(),
                created.id
            ),
        )?;

        let waited = timeout(
            limit + API_TIMEOUT,
            provider.wait_reachable(&request.credentials, created, limit),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ProviderError::ProvisionTimeout {
                instance_id: created.id.clone(),
                waited: limit,
            })
        });

        match waited {
            Ok(ready) => {
                session.status(format!("instance {ready} is reachable"));
                session.set_instance(ready.clone());
                Ok(ready)
            }
            Err(err) => {
                if matches!(err, ProviderError::ProvisionTimeout { .. }) {
                    session.status(format!(
                        "timed out after {} seconds waiting for instance {} to become reachable",
                        limit.as_secs(),
                        created.id
                    ));
                }
                Err(DeployError::from_wait(err))
            }
        }
    }

    /// Opens the control master, retrying with doubling backoff until the
    /// reachability window closes.
    async fn connect(
        &self,
        session: &DeploymentSession,
        request: &DeploymentRequest,
        host: IpAddr,
        window_end: Instant,
    ) -> Result<SshChannel, DeployError> {
        let started = Instant::now();
        let give_up = |attempts: u32, source: SshError| DeployError::SshUnreachable {
            host: host.to_string(),
            attempts,
            waited: started.elapsed(),
            source,
        };

        files::ensure_dir(&self.ssh.control_dir).map_err(|message| {
            give_up(
                0,
                SshError::Connect {
                    host: host.to_string(),
                    message,
                },
            )
        })?;

        let target = SshTarget {
            host,
            port: SSH_PORT,
            user: self.ssh_user.clone(),
            identity_file: request.key_pair.private_key_path.clone(),
        };
        let mut delay = self.connect_backoff;
        let mut attempts = 0_u32;

        loop {
            attempts = attempts.saturating_add(1);
            let err = match SshChannel::connect(
                Arc::clone(&self.runner),
                self.ssh.clone(),
                target.clone(),
            )
            .await
            {
                Ok(channel) => {
                    session.status(format!("ssh connected to {} as {}", host, self.ssh_user));
                    return Ok(channel);
                }
                Err(err) => err,
            };

            if matches!(err, SshError::Runner(_)) || Instant::now() + delay >= window_end {
                return Err(give_up(attempts, err));
            }
            session.status(format!(
                "ssh attempt {attempts} failed: {err}; retrying in {} seconds",
                delay.as_secs()
            ));
            sleep(delay).await;
            if session.is_cancelled() {
                return Err(DeployError::Cancelled {
                    stage: DeploymentState::Installing.label(),
                });
            }
            delay = delay.saturating_mul(2).min(self.connect_backoff_max);
        }
    }

    async fn configure(
        &self,
        session: &DeploymentSession,
        provider: &dyn Provider,
        request: &DeploymentRequest,
        channel: &SshChannel,
        host: IpAddr,
    ) -> Result<String, DeployError> {
        let context = PlanContext {
            app: &request.app,
            hostname: &request.hostname,
            domain: request.domain.as_deref(),
            public_ip: host,
            answers: &request.answers,
        };
        install(session, channel, &context).await?;
        configure_dns(session, provider, request, host).await?;
        self.issue_tls(session, request, channel, host).await?;
        Ok(context.public_url())
    }

    async fn issue_tls(
        &self,
        session: &DeploymentSession,
        request: &DeploymentRequest,
        channel: &SshChannel,
        host: IpAddr,
    ) -> Result<(), DeployError> {
        enter(session, DeploymentState::IssuingTls, "issuing TLS certificate")?;
        let Some(domain) = request.domain.as_deref() else {
            session.status("no domain requested; skipping TLS");
            return Ok(());
        };

        for command in tls_commands(domain, request.app.http_port) {
            run_logged(session, channel, &command)
                .await
                .map_err(|err| DeployError::Tls(err.to_string()))?;
        }

        let poll = async {
            loop {
                let output = channel
                    .run_capture(CERTIFICATE_CHECK, &NullSink)
                    .await
                    .map_err(|err| DeployError::Tls(err.to_string()))?;
                if certificate_issued(&output) {
                    return Ok::<(), DeployError>(());
                }
                sleep(self.tls_poll_interval).await;
            }
        };
        timeout(self.tls_timeout, poll).await.map_err(|_| {
            DeployError::Tls(format!(
                "no certificate for {domain} after {} seconds; check that {domain} resolves to {host}",
                self.tls_timeout.as_secs()
            ))
        })??;
        session.status(format!("certificate issued for {domain}"));
        Ok(())
    }
}

async fn select_size(
    session: &DeploymentSession,
    provider: &dyn Provider,
    request: &DeploymentRequest,
) -> Result<Size, DeployError> {
    enter(
        session,
        DeploymentState::SelectingSize,
        &format!(
            "selecting a {} size in {} with at least {}",
            request.provider, request.region, request.specs
        ),
    )?;

    let sizes = timeout(
        API_TIMEOUT,
        provider.list_sizes(&request.credentials, Some(&request.region)),
    )
    .await
    .map_err(|_| {
        DeployError::Upstream(ProviderError::Upstream {
            provider: request.provider.clone(),
            message: format!("listing sizes timed out after {} seconds", API_TIMEOUT.as_secs()),
        })
    })?
    .map_err(DeployError::from_listing)?;

    let size = pick_for_region(&sizes, &request.specs, &request.region)
        .cloned()
        .ok_or_else(|| DeployError::NoMatchingSize {
            provider: request.provider.clone(),
            region: request.region.clone(),
            specs: request.specs,
        })?;

    let price = size
        .known_monthly_price()
        .map_or_else(String::new, |monthly| format!(" at ${monthly:.2}/month"));
    session.status(format!(
        "selected {}: {} vCPU, {} MB memory, {} GB disk{price}",
        size.slug, size.vcpus, size.memory_mb, size.disk_gb
    ));
    session.set_size(size.clone());
    Ok(size)
}

async fn install(
    session: &DeploymentSession,
    channel: &SshChannel,
    context: &PlanContext<'_>,
) -> Result<(), DeployError> {
    enter(
        session,
        DeploymentState::Installing,
        &format!("installing {} on {}", context.app.name, context.public_ip),
    )?;
    let commands = install_plan(context)?;
    for (index, command) in commands.iter().enumerate() {
        run_logged(session, channel, command)
            .await
            .map_err(|err| DeployError::from_command(index, &command.display, err))?;
    }
    session.status(format!("{} install steps finished", commands.len()));
    Ok(())
}

async fn configure_dns(
    session: &DeploymentSession,
    provider: &dyn Provider,
    request: &DeploymentRequest,
    host: IpAddr,
) -> Result<(), DeployError> {
    enter(session, DeploymentState::ConfiguringDns, "configuring DNS")?;
    let Some(domain) = request.domain.as_deref() else {
        session.status("no domain requested; skipping DNS");
        return Ok(());
    };
    if !provider.supports_dns() {
        session.status(format!(
            "{} does not manage DNS; skipping. Point an A record for {domain} at {host}",
            provider.name()
        ));
        return Ok(());
    }

    let record = DnsRecord::for_domain(domain, host);
    timeout(
        API_TIMEOUT,
        provider.create_dns_record(&request.credentials, &record),
    )
    .await
    .map_err(|_| {
        DeployError::Dns(ProviderError::Upstream {
            provider: request.provider.clone(),
            message: format!("DNS call timed out after {} seconds", API_TIMEOUT.as_secs()),
        })
    })?
    .map_err(DeployError::Dns)?;
    session.status(format!(
        "created A record {} in {} pointing at {host}",
        record.name, record.zone
    ));
    Ok(())
}

/// Logs and enters `state` unless cancellation was requested.
fn enter(
    session: &DeploymentSession,
    state: DeploymentState,
    message: &str,
) -> Result<(), DeployError> {
    let stage = state.label();
    if session.is_cancelled() {
        return Err(DeployError::Cancelled { stage });
    }
    session.status(message);
    session.set_state(state);
    tracing::info!(stage, "{message}");
    Ok(())
}

async fn run_logged(
    session: &DeploymentSession,
    channel: &SshChannel,
    command: &PlannedCommand,
) -> Result<(), SshError> {
    session.status(format!("$ {}", command.display));
    let sink = SessionLogSink::new(session);
    let result = channel.run(&command.text, &sink).await;
    sink.flush();
    result.map(drop)
}

fn fail(session: &DeploymentSession, err: &DeployError) {
    let leftover = session.instance();
    session.status(format!("error: {err}"));
    if let Some(instance) = &leftover {
        session.status(format!("instance {instance} left running; delete it manually"));
    }
    tracing::warn!(kind = ?err.kind(), error = %err, "deployment failed");
    let report = FailureReport {
        kind: err.kind(),
        message: err.to_string(),
        leftover_instance: leftover,
        log_tail: session.log_tail(FAILURE_LOG_TAIL),
    };
    session.set_state(DeploymentState::Failed(report));
}
