//! TLS credential bundle and filesystem writer
//!
//! The bundle is handed to Envoy (or any other proxy) as plain PEM files in
//! a single directory: `private.key`, `certificate.crt`, `ca.crt`, and the
//! concatenated `chain.crt`.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

/// Failure to persist a credential artifact.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("could not create credential directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not write {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// PEM-encoded certificate, private key and issuing CA, as returned by the
/// PKI engine.
#[derive(Debug, Clone)]
pub struct CredentialBundle {
    pub certificate: String,
    pub private_key: String,
    pub issuing_ca: String,
}

impl CredentialBundle {
    /// Write the bundle into `dir`, creating it (mode 0700) if missing.
    ///
    /// Produces `private.key`, `certificate.crt`, `ca.crt` and `chain.crt`
    /// (certificate + newline + issuing CA).
    pub fn write_to_dir(&self, dir: &Path) -> Result<(), WriteError> {
        fs::create_dir_all(dir).map_err(|source| WriteError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(|source| {
                WriteError::CreateDir {
                    path: dir.to_path_buf(),
                    source,
                }
            })?;
        }

        let chain = format!("{}\n{}", self.certificate, self.issuing_ca);

        write_artifact(dir, "private.key", &self.private_key)?;
        write_artifact(dir, "certificate.crt", &self.certificate)?;
        write_artifact(dir, "ca.crt", &self.issuing_ca)?;
        write_artifact(dir, "chain.crt", &chain)?;

        info!(dir = %dir.display(), "wrote credential bundle");
        Ok(())
    }
}

fn write_artifact(dir: &Path, name: &str, contents: &str) -> Result<(), WriteError> {
    let path = dir.join(name);
    fs::write(&path, contents).map_err(|source| WriteError::WriteFile { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bundle() -> CredentialBundle {
        CredentialBundle {
            certificate: "-----CERT-----".to_string(),
            private_key: "-----KEY-----".to_string(),
            issuing_ca: "-----CA-----".to_string(),
        }
    }

    #[test]
    fn writes_all_four_artifacts() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("certs");

        bundle().write_to_dir(&out).unwrap();

        assert_eq!(
            fs::read_to_string(out.join("private.key")).unwrap(),
            "-----KEY-----"
        );
        assert_eq!(
            fs::read_to_string(out.join("certificate.crt")).unwrap(),
            "-----CERT-----"
        );
        assert_eq!(
            fs::read_to_string(out.join("ca.crt")).unwrap(),
            "-----CA-----"
        );
    }

    #[test]
    fn chain_is_certificate_then_ca() {
        let dir = tempdir().unwrap();
        bundle().write_to_dir(dir.path()).unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("chain.crt")).unwrap(),
            "-----CERT-----\n-----CA-----"
        );
    }

    #[cfg(unix)]
    #[test]
    fn directory_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let out = dir.path().join("certs");
        bundle().write_to_dir(&out).unwrap();

        let mode = fs::metadata(&out).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
