//! Renders an app's install templates into remote shell commands.
//!
//! Templates reference values as `{{name}}`. Every substituted value is
//! shell-escaped, so answers cannot break out of the command line. Password
//! answers are replaced by a mask in the display text that reaches logs and
//! error messages.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::net::IpAddr;

use shell_escape::unix::escape;
use thiserror::Error;

use crate::catalog::{App, QuestionKind};

const MASK: &str = "********";
const CADDY_CONTAINER: &str = "hangar-caddy";

/// Prints how many times Caddy logged a successful issuance.
pub const CERTIFICATE_CHECK: &str =
    "docker logs hangar-caddy 2>&1 | grep -c 'certificate obtained successfully' || true";

/// Template rendering failures.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PlanError {
    /// A template names a value that does not exist.
    #[error("install step {} references unknown placeholder '{name}'", .index + 1)]
    UnknownPlaceholder {
        /// Zero-based template index.
        index: usize,
        /// Placeholder name as written.
        name: String,
    },
    /// A `{{` has no closing `}}`.
    #[error("install step {} has an unterminated placeholder", .index + 1)]
    Unterminated {
        /// Zero-based template index.
        index: usize,
    },
}

/// A remote command plus the text safe to show to users.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlannedCommand {
    /// Command executed on the instance.
    pub text: String,
    /// `text` with secret answers masked.
    pub display: String,
}

impl PlannedCommand {
    fn plain(command: impl Into<String>) -> Self {
        let text = command.into();
        Self {
            display: text.clone(),
            text,
        }
    }
}

/// Inputs for rendering a plan.
#[derive(Clone, Copy, Debug)]
pub struct PlanContext<'a> {
    /// App being installed.
    pub app: &'a App,
    /// Sanitised hostname.
    pub hostname: &'a str,
    /// Sanitised domain, when DNS and TLS are requested.
    pub domain: Option<&'a str>,
    /// Public address of the instance.
    pub public_ip: IpAddr,
    /// Resolved answers keyed by question id.
    pub answers: &'a BTreeMap<String, String>,
}

impl PlanContext<'_> {
    /// URL users reach the app at once the deployment completes.
    #[must_use]
    pub fn public_url(&self) -> String {
        self.domain.map_or_else(
            || match self.public_ip {
                IpAddr::V4(ip) => format!("http://{ip}:{}", self.app.http_port),
                IpAddr::V6(ip) => format!("http://[{ip}]:{}", self.app.http_port),
            },
            |domain| format!("https://{domain}"),
        )
    }

    fn host(&self) -> String {
        self.domain
            .map_or_else(|| self.public_ip.to_string(), str::to_owned)
    }

    /// The app listens on loopback only when Caddy fronts it.
    const fn bind(&self) -> &'static str {
        if self.domain.is_some() {
            "127.0.0.1"
        } else {
            "0.0.0.0"
        }
    }
}

struct Value {
    text: String,
    secret: bool,
}

fn values(ctx: &PlanContext<'_>) -> BTreeMap<String, Value> {
    let mut values = BTreeMap::new();
    let mut put = |name: &str, text: String| {
        values.insert(name.to_owned(), Value { text, secret: false });
    };
    put("hostname", ctx.hostname.to_owned());
    put("domain", ctx.domain.unwrap_or_default().to_owned());
    put("host", ctx.host());
    put("public_url", ctx.public_url());
    put("public_ip", ctx.public_ip.to_string());
    put("http_port", ctx.app.http_port.to_string());
    put("bind", ctx.bind().to_owned());

    for (id, answer) in ctx.answers {
        let secret = ctx
            .app
            .questions
            .iter()
            .any(|question| question.id == *id && question.kind == QuestionKind::Password);
        values.insert(
            format!("answer.{id}"),
            Value {
                text: answer.clone(),
                secret,
            },
        );
    }
    values
}

fn render(
    index: usize,
    template: &str,
    values: &BTreeMap<String, Value>,
) -> Result<PlannedCommand, PlanError> {
    let mut text = String::with_capacity(template.len());
    let mut display = String::with_capacity(template.len());
    let mut rest = template;

    while let Some((before, after)) = rest.split_once("{{") {
        text.push_str(before);
        display.push_str(before);
        let (raw_name, tail) = after
            .split_once("}}")
            .ok_or(PlanError::Unterminated { index })?;
        let name = raw_name.trim();
        let value = values
            .get(name)
            .ok_or_else(|| PlanError::UnknownPlaceholder {
                index,
                name: name.to_owned(),
            })?;
        let escaped = escape(Cow::Borrowed(value.text.as_str()));
        text.push_str(&escaped);
        display.push_str(if value.secret { MASK } else { &*escaped });
        rest = tail;
    }
    text.push_str(rest);
    display.push_str(rest);
    Ok(PlannedCommand { text, display })
}

/// Host preparation followed by the app's rendered install steps.
///
/// # Errors
///
/// Returns a [`PlanError`] when a template is malformed; nothing has run on
/// the instance at that point.
pub fn install_plan(ctx: &PlanContext<'_>) -> Result<Vec<PlannedCommand>, PlanError> {
    let mut commands = vec![
        PlannedCommand::plain("cloud-init status --wait >/dev/null 2>&1 || true"),
        PlannedCommand::plain(
            "command -v docker >/dev/null 2>&1 || (curl -fsSL https://get.docker.com | sh)",
        ),
        PlannedCommand::plain(
            "if command -v ufw >/dev/null 2>&1; then \
             ufw allow 22/tcp && ufw allow 80/tcp && ufw allow 443/tcp && ufw --force enable; fi",
        ),
    ];
    let values = values(ctx);
    for (index, template) in ctx.app.install.iter().enumerate() {
        commands.push(render(index, template, &values)?);
    }
    Ok(commands)
}

/// Commands starting a Caddy reverse proxy that obtains a certificate for
/// `domain` and forwards to the app on loopback.
#[must_use]
pub fn tls_commands(domain: &str, http_port: u16) -> Vec<PlannedCommand> {
    let escaped_domain = escape(Cow::Borrowed(domain));
    vec![
        PlannedCommand::plain(format!(
            "docker rm -f {CADDY_CONTAINER} >/dev/null 2>&1 || true"
        )),
        PlannedCommand::plain(format!(
            "docker run -d --name {CADDY_CONTAINER} --restart unless-stopped --network host \
             -v hangar-caddy-data:/data caddy:2 \
             caddy reverse-proxy --from {escaped_domain} --to 127.0.0.1:{http_port}"
        )),
    ]
}

/// Interprets the output of [`CERTIFICATE_CHECK`].
#[must_use]
pub fn certificate_issued(output: &str) -> bool {
    output
        .trim()
        .parse::<u32>()
        .is_ok_and(|count| count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use rstest::rstest;

    use crate::catalog::Catalog;

    fn app(name: &str) -> App {
        Catalog::builtin()
            .unwrap_or_else(|err| panic!("catalog: {err}"))
            .app(name)
            .cloned()
            .unwrap_or_else(|| panic!("{name} missing from catalog"))
    }

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10));

    #[test]
    fn passwords_are_escaped_in_text_and_masked_in_display() {
        let vaultwarden = app("vaultwarden");
        let answers = vaultwarden
            .resolve_answers(&BTreeMap::from([(
                String::from("admin_token"),
                String::from("s3cret pass"),
            )]))
            .unwrap_or_else(|err| panic!("answers: {err}"));
        let ctx = PlanContext {
            app: &vaultwarden,
            hostname: "vault",
            domain: Some("vault.example.com"),
            public_ip: IP,
            answers: &answers,
        };

        let plan = install_plan(&ctx).unwrap_or_else(|err| panic!("plan: {err}"));
        let run = plan
            .iter()
            .find(|command| command.text.starts_with("docker run"))
            .unwrap_or_else(|| panic!("no docker run step"));

        assert!(run.text.contains("ADMIN_TOKEN='s3cret pass'"), "{}", run.text);
        assert!(run.display.contains("ADMIN_TOKEN=********"), "{}", run.display);
        assert!(!run.display.contains("s3cret"));
        assert!(run.text.contains("DOMAIN='https://vault.example.com'"), "{}", run.text);
        assert!(run.text.contains("-p 127.0.0.1:"));
    }

    #[rstest]
    #[case::with_domain(Some("kuma.example.com"), "https://kuma.example.com")]
    #[case::without_domain(None, "http://203.0.113.10:3001")]
    fn public_url_prefers_domain(#[case] domain: Option<&str>, #[case] expected: &str) {
        let kuma = app("uptime-kuma");
        let answers = BTreeMap::new();
        let ctx = PlanContext {
            app: &kuma,
            hostname: "kuma",
            domain,
            public_ip: IP,
            answers: &answers,
        };
        assert_eq!(ctx.public_url(), expected);
    }

    #[test]
    fn apps_without_domain_listen_publicly() {
        let kuma = app("uptime-kuma");
        let answers = BTreeMap::new();
        let ctx = PlanContext {
            app: &kuma,
            hostname: "kuma",
            domain: None,
            public_ip: IP,
            answers: &answers,
        };
        let plan = install_plan(&ctx).unwrap_or_else(|err| panic!("plan: {err}"));
        assert!(plan.iter().any(|command| command.text.contains("-p 0.0.0.0:3001:3001")));
        assert!(plan
            .first()
            .is_some_and(|command| command.text.starts_with("cloud-init status --wait")));
    }

    #[rstest]
    #[case::unknown(
        "echo {{nope}}",
        PlanError::UnknownPlaceholder { index: 0, name: String::from("nope") }
    )]
    #[case::unterminated("echo {{host", PlanError::Unterminated { index: 0 })]
    fn malformed_templates_are_rejected(#[case] template: &str, #[case] expected: PlanError) {
        let mut broken = app("uptime-kuma");
        broken.install = vec![template.to_owned()];
        let answers = BTreeMap::new();
        let ctx = PlanContext {
            app: &broken,
            hostname: "kuma",
            domain: None,
            public_ip: IP,
            answers: &answers,
        };
        assert_eq!(install_plan(&ctx), Err(expected));
    }

    #[test]
    fn caddy_proxies_to_loopback_port() {
        let commands = tls_commands("git.example.com", 3000);
        let run = commands
            .last()
            .unwrap_or_else(|| panic!("no commands"));
        assert!(run
            .text
            .ends_with("caddy reverse-proxy --from git.example.com --to 127.0.0.1:3000"));
    }

    #[rstest]
    #[case("0\n", false)]
    #[case("2\n", true)]
    #[case("", false)]
    #[case("grep: command not found", false)]
    fn certificate_check_output(#[case] output: &str, #[case] issued: bool) {
        assert_eq!(certificate_issued(output), issued);
    }
}
