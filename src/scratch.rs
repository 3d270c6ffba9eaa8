//! Process-private scratch directory for secrets and generated keys.
//!
//! Every file created here is readable only by the current user and the whole
//! directory disappears when the last [`ScratchDir`] handle drops.

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tempfile::{Builder, NamedTempFile, TempDir};
use thiserror::Error;

/// Errors raised while managing scratch files.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ScratchError {
    /// Filesystem access failed.
    #[error("scratch file i/o failed for {path}: {message}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// The operating system returned a temporary path that is not UTF-8.
    #[error("temporary path is not valid UTF-8: {path}")]
    NonUtf8Path {
        /// Lossy rendering of the offending path.
        path: String,
    },
}

/// Owns a private temporary directory.
#[derive(Debug)]
pub struct ScratchDir {
    _dir: TempDir,
    path: Utf8PathBuf,
    handle: Dir,
}

impl ScratchDir {
    /// Creates a fresh directory under the system temporary directory.
    ///
    /// # Errors
    ///
    /// Returns [`ScratchError`] when the directory cannot be created.
    pub fn new() -> Result<Self, ScratchError> {
        let dir = Builder::new()
            .prefix("hangar-")
            .tempdir()
            .map_err(|err| ScratchError::Io {
                path: Utf8PathBuf::from(std::env::temp_dir().to_string_lossy().into_owned()),
                message: err.to_string(),
            })?;
        let path = utf8(dir.path())?;
        let handle =
            Dir::open_ambient_dir(&path, ambient_authority()).map_err(|err| ScratchError::Io {
                path: path.clone(),
                message: err.to_string(),
            })?;
        Ok(Self {
            _dir: dir,
            path,
            handle,
        })
    }

    /// Root of the scratch directory.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Writes `contents` to a uniquely named file that is removed when the
    /// returned guard drops.
    ///
    /// # Errors
    ///
    /// Returns [`ScratchError`] when the file cannot be created or written.
    pub fn secret_file(&self, prefix: &str, contents: &[u8]) -> Result<ScratchFile, ScratchError> {
        let file = self.private_temp(prefix, contents)?;
        let path = utf8(file.path())?;
        Ok(ScratchFile { file, path })
    }

    /// Writes `contents` to `name`, replacing any previous file, and returns
    /// the full path. The file lives as long as the directory.
    ///
    /// # Errors
    ///
    /// Returns [`ScratchError`] when the file cannot be written.
    pub fn write_private(&self, name: &str, contents: &[u8]) -> Result<Utf8PathBuf, ScratchError> {
        let destination = self.path.join(name);
        let file = self.private_temp(name, contents)?;
        file.persist(&destination)
            .map_err(|err| ScratchError::Io {
                path: destination.clone(),
                message: err.error.to_string(),
            })?;
        Ok(destination)
    }

    /// Reads `name` and removes it.
    ///
    /// # Errors
    ///
    /// Returns [`ScratchError::Io`] when the file is missing or unreadable.
    pub fn take(&self, name: &str) -> Result<String, ScratchError> {
        let path = self.path.join(name);
        let contents = self
            .handle
            .read_to_string(name)
            .map_err(|err| ScratchError::Io {
                path: path.clone(),
                message: err.to_string(),
            })?;
        self.handle
            .remove_file(name)
            .map_err(|err| ScratchError::Io {
                path,
                message: err.to_string(),
            })?;
        Ok(contents)
    }

    fn private_temp(&self, prefix: &str, contents: &[u8]) -> Result<NamedTempFile, ScratchError> {
        let io_error = |err: std::io::Error| ScratchError::Io {
            path: self.path.join(prefix),
            message: err.to_string(),
        };
        // NamedTempFile opens with mode 0600 on unix.
        let mut file = Builder::new()
            .prefix(prefix)
            .tempfile_in(&self.path)
            .map_err(io_error)?;
        file.write_all(contents).map_err(io_error)?;
        file.flush().map_err(io_error)?;
        Ok(file)
    }
}

/// A secret written to the scratch directory; deleted on drop.
#[derive(Debug)]
pub struct ScratchFile {
    file: NamedTempFile,
    path: Utf8PathBuf,
}

impl ScratchFile {
    /// Location of the file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Deletes the file now, surfacing any error.
    ///
    /// # Errors
    ///
    /// Returns [`ScratchError::Io`] when removal fails.
    pub fn close(self) -> Result<(), ScratchError> {
        let path = self.path;
        self.file.close().map_err(|err| ScratchError::Io {
            path,
            message: err.to_string(),
        })
    }
}

fn utf8(path: &std::path::Path) -> Result<Utf8PathBuf, ScratchError> {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).map_err(|raw| ScratchError::NonUtf8Path {
        path: raw.to_string_lossy().into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn secret_files_are_private_and_removed_on_drop() {
        let scratch = ScratchDir::new().expect("scratch dir");
        let file = scratch
            .secret_file("key-db-", b"hunter2")
            .expect("secret file");
        let path = file.path().to_path_buf();

        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read(&path).expect("read"), b"hunter2");

        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn close_removes_file() {
        let scratch = ScratchDir::new().expect("scratch dir");
        let file = scratch.secret_file("key-", b"x").expect("secret file");
        let path = file.path().to_path_buf();

        file.close().expect("close");
        assert!(!path.exists());
    }

    #[test]
    fn write_private_persists_under_name() {
        let scratch = ScratchDir::new().expect("scratch dir");
        let path = scratch
            .write_private("id_ec2-web", b"PRIVATE")
            .expect("write key");

        assert_eq!(path, scratch.path().join("id_ec2-web"));
        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        scratch
            .write_private("id_ec2-web", b"ROTATED")
            .expect("overwrite key");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "ROTATED");
    }

    #[test]
    fn take_reads_and_removes() {
        let scratch = ScratchDir::new().expect("scratch dir");
        scratch.write_private("id_vpn", b"secret").expect("write");

        assert_eq!(scratch.take("id_vpn").expect("take"), "secret");
        assert!(scratch.take("id_vpn").is_err());
    }

    #[test]
    fn directory_is_removed_with_handle() {
        let scratch = ScratchDir::new().expect("scratch dir");
        let root = scratch.path().to_path_buf();
        drop(scratch);
        assert!(!root.exists());
    }
}
