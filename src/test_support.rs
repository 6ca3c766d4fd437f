//! Test doubles shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[cfg(test)]
use camino::Utf8PathBuf;
#[cfg(test)]
use tempfile::TempDir;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::provider::{
    CredentialSource, Credentials, DnsRecord, Instance, InstanceSpec, InstanceStatus, Provider,
    ProviderError, ProviderFuture, Region, Secret, SecretString, Size,
};
use crate::runner::{
    CommandOutput, CommandRunner, OutputSink, OutputStream, RunnerError, RunnerFuture,
};

/// Address handed out by [`FakeProvider`] instances.
pub const FAKE_INSTANCE_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10));

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

#[derive(Debug, Default)]
struct Script {
    rules: Vec<(String, CommandOutput)>,
    queue: VecDeque<CommandOutput>,
    fallback: Option<CommandOutput>,
    invocations: Vec<CommandInvocation>,
}

/// Scripted command runner.
///
/// Responses are chosen in order of precedence: the first rule whose
/// substring occurs in the command line, then the FIFO queue, then the
/// fallback. Scripted stdout and stderr are forwarded to the sink so callers
/// observe them as streamed output.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    script: Arc<Mutex<Script>>,
}

fn output(
    code: Option<i32>,
    stdout: impl Into<String>,
    stderr: impl Into<String>,
) -> CommandOutput {
    CommandOutput {
        code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

impl ScriptedRunner {
    /// Creates a runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that succeeds silently once its script runs out.
    #[must_use]
    pub fn succeeding() -> Self {
        let runner = Self::new();
        runner.lock().fallback = Some(output(Some(0), "", ""));
        runner
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.lock().invocations.clone()
    }

    /// Returns the recorded command lines that contain `needle`.
    #[must_use]
    pub fn commands_containing(&self, needle: &str) -> Vec<String> {
        self.invocations()
            .iter()
            .map(CommandInvocation::command_string)
            .filter(|line| line.contains(needle))
            .collect()
    }

    /// Queues a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Queues a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Queues an explicit response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.lock().queue.push_back(output(code, stdout, stderr));
    }

    /// Answers every command containing `needle` with the given response.
    pub fn respond_when(
        &self,
        needle: &str,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.lock()
            .rules
            .push((needle.to_owned(), output(code, stdout, stderr)));
    }

    fn next_response(&self, invocation: CommandInvocation) -> Result<CommandOutput, RunnerError> {
        let line = invocation.command_string();
        let program = invocation.program.clone();
        let mut script = self.lock();
        script.invocations.push(invocation);

        if let Some((_, response)) = script
            .rules
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
        {
            return Ok(response.clone());
        }
        if let Some(response) = script.queue.pop_front() {
            return Ok(response);
        }
        script.fallback.clone().ok_or_else(|| RunnerError::Spawn {
            program,
            message: String::from("no scripted response available"),
        })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        sink: &'a dyn OutputSink,
    ) -> RunnerFuture<'a> {
        Box::pin(async move {
            let response = self.next_response(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
            })?;
            if !response.stdout.is_empty() {
                sink.chunk(OutputStream::Stdout, response.stdout.as_bytes());
            }
            if !response.stderr.is_empty() {
                sink.chunk(OutputStream::Stderr, response.stderr.as_bytes());
            }
            Ok(response)
        })
    }
}

/// In-memory provider with configurable outcomes.
#[derive(Debug)]
pub struct FakeProvider {
    name: String,
    sizes: Result<Vec<Size>, ProviderError>,
    create: Result<Instance, ProviderError>,
    wait: Result<Instance, ProviderError>,
    dns: Option<Result<(), ProviderError>>,
    create_calls: AtomicUsize,
    dns_records: Mutex<Vec<DnsRecord>>,
    created_specs: Mutex<Vec<InstanceSpec>>,
}

/// Builds a size entry for tests.
#[must_use]
pub fn test_size(slug: &str, vcpus: u32, memory_mb: u64, price_monthly: Option<f64>) -> Size {
    Size {
        slug: slug.to_owned(),
        memory_mb,
        vcpus,
        disk_gb: 50,
        transfer_tb: Some(1.0),
        price_monthly,
        price_hourly: None,
        regions: Vec::new(),
    }
}

/// Builds an instance in `status` at [`FAKE_INSTANCE_IP`].
#[must_use]
pub fn test_instance(status: InstanceStatus) -> Instance {
    Instance {
        id: String::from("fake-1"),
        public_ip: Some(FAKE_INSTANCE_IP),
        status,
        region: String::from("test-1"),
    }
}

impl FakeProvider {
    /// Creates a provider whose every call succeeds without DNS support.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            sizes: Ok(vec![
                test_size("small", 1, 1024, Some(6.0)),
                test_size("medium", 2, 4096, Some(24.0)),
                test_size("large", 4, 8192, Some(48.0)),
            ]),
            create: Ok(test_instance(InstanceStatus::Provisioning)),
            wait: Ok(test_instance(InstanceStatus::Ready)),
            dns: None,
            create_calls: AtomicUsize::new(0),
            dns_records: Mutex::new(Vec::new()),
            created_specs: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the size list.
    #[must_use]
    pub fn with_sizes(mut self, sizes: Vec<Size>) -> Self {
        self.sizes = Ok(sizes);
        self
    }

    /// Makes `list_sizes` fail.
    #[must_use]
    pub fn with_sizes_error(mut self, err: ProviderError) -> Self {
        self.sizes = Err(err);
        self
    }

    /// Makes `create_instance` fail.
    #[must_use]
    pub fn with_create_error(mut self, err: ProviderError) -> Self {
        self.create = Err(err);
        self
    }

    /// Makes `wait_reachable` fail.
    #[must_use]
    pub fn with_wait_error(mut self, err: ProviderError) -> Self {
        self.wait = Err(err);
        self
    }

    /// Enables DNS with the given outcome.
    #[must_use]
    pub fn with_dns(mut self, outcome: Result<(), ProviderError>) -> Self {
        self.dns = Some(outcome);
        self
    }

    /// Number of `create_instance` calls so far.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Specs passed to `create_instance`.
    #[must_use]
    pub fn created_specs(&self) -> Vec<InstanceSpec> {
        self.created_specs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// DNS records created so far.
    #[must_use]
    pub fn dns_records(&self) -> Vec<DnsRecord> {
        self.dns_records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Token credentials for tests.
#[must_use]
pub fn test_credentials() -> Credentials {
    Credentials {
        secret: Secret::Token(SecretString::new("test-token")),
        source: CredentialSource::Explicit,
    }
}

impl Provider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve_auth(&self) -> ProviderFuture<'_, Credentials> {
        Box::pin(async { Ok(test_credentials()) })
    }

    fn list_regions<'a>(
        &'a self,
        _credentials: &'a Credentials,
    ) -> ProviderFuture<'a, Vec<Region>> {
        Box::pin(async {
            Ok(vec![Region {
                name: String::from("Test 1"),
                slug: String::from("test-1"),
                available: true,
            }])
        })
    }

    fn list_sizes<'a>(
        &'a self,
        _credentials: &'a Credentials,
        _region: Option<&'a str>,
    ) -> ProviderFuture<'a, Vec<Size>> {
        Box::pin(async move { self.sizes.clone() })
    }

    fn create_instance<'a>(
        &'a self,
        _credentials: &'a Credentials,
        spec: &'a InstanceSpec,
    ) -> ProviderFuture<'a, Instance> {
        Box::pin(async move {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            self.created_specs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(spec.clone());
            self.create.clone()
        })
    }

    fn wait_reachable<'a>(
        &'a self,
        _credentials: &'a Credentials,
        _instance: &'a Instance,
        _timeout: Duration,
    ) -> ProviderFuture<'a, Instance> {
        Box::pin(async move { self.wait.clone() })
    }

    fn supports_dns(&self) -> bool {
        self.dns.is_some()
    }

    fn create_dns_record<'a>(
        &'a self,
        _credentials: &'a Credentials,
        record: &'a DnsRecord,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.dns_records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(record.clone());
            self.dns.clone().unwrap_or_else(|| {
                Err(ProviderError::Unsupported {
                    provider: self.name.clone(),
                    capability: String::from("DNS records"),
                })
            })
        })
    }
}

/// Creates a temporary directory and returns it with its UTF-8 path.
#[cfg(test)]
pub fn utf8_tempdir() -> (TempDir, Utf8PathBuf) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 tempdir: {}", path.display()));
    (tmp, path)
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets (`Some`) or removes (`None`) environment variables while holding
    /// a global mutex.
    pub async fn apply(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::apply"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Sets environment variables while holding the global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        let mapped: Vec<(&str, Option<&str>)> =
            pairs.iter().map(|(key, value)| (*key, Some(*value))).collect();
        Self::apply(&mapped).await
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
