use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use directories::ProjectDirs;
use std::path::PathBuf;

use crate::remote::RemoteBlobStore;
use vitals_core::blob::{BlobStore, FileBlobStore, SqliteBlobStore};

/// Shortest API key accepted from the key file.
const MIN_API_KEY_LEN: usize = 16;

/// Where the health table lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Plain CSV file in the data directory
    File,
    /// SQLite database in the data directory, with commit history
    Sqlite,
    /// Remote HTTP blob service (`VITALS_REMOTE_URL`)
    Remote,
}

/// Backend selection as given on the command line / environment.
pub struct BackendOptions {
    pub kind: BackendKind,
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
}

pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "vitals").context("Could not determine home directory")?;
        Self::at(proj_dirs.data_dir().to_path_buf())
    }

    pub fn at(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = data_dir.join("vitals.db");

        Ok(Config { data_dir, db_path })
    }

    /// Open the configured blob backend.
    ///
    /// The remote backend drives its HTTP client through `rt`; it must only
    /// be used from outside async tasks.
    pub fn open_backend(
        &self,
        opts: &BackendOptions,
        rt: &tokio::runtime::Handle,
    ) -> Result<Box<dyn BlobStore>> {
        match opts.kind {
            BackendKind::File => Ok(Box::new(FileBlobStore::new(&self.data_dir))),
            BackendKind::Sqlite => {
                let store = SqliteBlobStore::open(&self.db_path)
                    .with_context(|| format!("Failed to open {}", self.db_path.display()))?;
                Ok(Box::new(store))
            }
            BackendKind::Remote => {
                let Some(ref url) = opts.remote_url else {
                    bail!("The remote backend needs a URL. Set VITALS_REMOTE_URL or pass --remote-url");
                };
                let store = RemoteBlobStore::new(url, opts.remote_token.clone(), rt.clone())
                    .context("Failed to build HTTP client")?;
                Ok(Box::new(store))
            }
        }
    }

    /// Load the API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)` where `newly_created` is true when a
    /// fresh key was just generated (first run).
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if key.len() >= MIN_API_KEY_LEN {
                return Ok((key, false));
            }
            if !key.is_empty() {
                bail!(
                    "API key in {} is shorter than {MIN_API_KEY_LEN} characters. Delete the file to generate a new one",
                    path.display()
                );
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        eprintln!("Generated new API key: {key}");
        eprintln!("Include in requests: Authorization: Bearer {key}");
        Ok((key, true))
    }
}
