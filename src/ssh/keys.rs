//! Per-deployment SSH key generation.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};

use crate::files;
use crate::runner::CommandRunner;

use super::SshError;

const KEY_FILE_NAME: &str = "id_ed25519";

/// A freshly generated key pair. Only the public half is kept in memory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPair {
    /// Path to the private key file.
    pub private_key_path: Utf8PathBuf,
    /// OpenSSH-formatted public key.
    pub public_key: String,
}

/// Generates an ed25519 key pair inside `dir` with `ssh-keygen`.
///
/// # Errors
///
/// Returns [`SshError::KeyGeneration`] when the directory cannot be created,
/// `ssh-keygen` fails, or the public key cannot be read back, and
/// [`SshError::Runner`] when `ssh-keygen` cannot be started.
pub async fn generate_keypair(
    runner: &dyn CommandRunner,
    ssh_keygen_bin: &str,
    dir: &Utf8Path,
    comment: &str,
) -> Result<KeyPair, SshError> {
    files::ensure_dir(dir).map_err(SshError::KeyGeneration)?;
    let private_key_path = dir.join(KEY_FILE_NAME);
    let args = [
        OsString::from("-q"),
        OsString::from("-t"),
        OsString::from("ed25519"),
        OsString::from("-N"),
        OsString::new(),
        OsString::from("-C"),
        OsString::from(comment),
        OsString::from("-f"),
        OsString::from(private_key_path.as_str()),
    ];

    let output = runner.capture(ssh_keygen_bin, &args).await?;
    if !output.is_success() {
        return Err(SshError::KeyGeneration(format!(
            "{ssh_keygen_bin} exited with status {}: {}",
            output.status_text(),
            output.stderr.trim()
        )));
    }

    let public_key_path = dir.join(format!("{KEY_FILE_NAME}.pub"));
    let public_key = files::read_to_string(&public_key_path)
        .map_err(|err| SshError::KeyGeneration(format!("{public_key_path}: {err}")))?
        .trim()
        .to_owned();
    if public_key.is_empty() {
        return Err(SshError::KeyGeneration(format!("{public_key_path} is empty")));
    }

    Ok(KeyPair {
        private_key_path,
        public_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedRunner, utf8_tempdir};

    #[tokio::test]
    async fn reads_back_public_key_written_by_keygen() {
        let (_tmp, root) = utf8_tempdir();
        let dir = root.join("keys/session");
        files::write(&dir.join("id_ed25519.pub"), "ssh-ed25519 AAAA hangar\n")
            .unwrap_or_else(|err| panic!("seed key: {err}"));
        let runner = ScriptedRunner::new();
        runner.push_success();

        let pair = generate_keypair(&runner, "ssh-keygen", &dir, "hangar")
            .await
            .unwrap_or_else(|err| panic!("keygen: {err}"));

        assert_eq!(pair.public_key, "ssh-ed25519 AAAA hangar");
        assert_eq!(pair.private_key_path, dir.join("id_ed25519"));
        let invocation = runner.invocations().pop().unwrap_or_else(|| panic!("invoked"));
        assert!(
            invocation.command_string().contains("-t ed25519"),
            "{}",
            invocation.command_string()
        );
    }

    #[tokio::test]
    async fn keygen_failure_is_reported() {
        let (_tmp, root) = utf8_tempdir();
        let runner = ScriptedRunner::new();
        runner.push_output(Some(1), "", "Saving key failed");

        let err = generate_keypair(&runner, "ssh-keygen", &root, "hangar")
            .await
            .expect_err("keygen should fail");

        assert!(matches!(
            err,
            SshError::KeyGeneration(ref msg) if msg.contains("Saving key failed")
        ));
    }
}
