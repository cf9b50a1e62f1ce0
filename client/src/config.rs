use {
    anyhow::{Context as _, Result, bail},
    byte_unit::Byte,
    cloakfs_protocol::settings::{CacheSettings, EncryptionSettings},
    derivative::Derivative,
    serde::{Deserialize, Serialize},
    std::path::{Path, PathBuf},
    tracing::info,
};

pub const LOCAL_DRIVER: &str = "local";

#[derive(Derivative, Clone, Serialize, Deserialize)]
#[derivative(Debug)]
pub struct Config {
    /// Directory holding the storage keys of the `local` driver.
    pub storage_root: PathBuf,
    #[serde(default = "default_driver_name")]
    pub driver_name: String,
    /// Distinguishes caches of different storages that use the same driver.
    /// Defaults to `storage_root`.
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub encryption: Option<EncryptionSettings>,
    /// Ask for the encryption key on startup instead of storing it in the config.
    #[serde(default)]
    pub prompt_encryption_key: bool,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_warn_about_files_larger_than")]
    pub warn_about_files_larger_than: Byte,
}

fn default_driver_name() -> String {
    LOCAL_DRIVER.into()
}

fn default_log_filter() -> String {
    "info".into()
}

fn default_warn_about_files_larger_than() -> Byte {
    Byte::from_u64(50_000_000)
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs_err::read_to_string(path)?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.driver_name != LOCAL_DRIVER {
            bail!("unsupported storage driver: {:?}", self.driver_name);
        }
        if self.prompt_encryption_key {
            if self.encryption.as_ref().is_some_and(|e| !e.key.is_empty()) {
                bail!(
                    "invalid config: if `prompt_encryption_key` is true, \
                    `encryption.key` cannot be specified in the config"
                );
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn identity(&self) -> String {
        self.identity
            .clone()
            .unwrap_or_else(|| self.storage_root.display().to_string())
    }

    /// Encryption settings with the key filled in, prompting for it if configured.
    pub fn resolve_encryption(&self) -> Result<Option<EncryptionSettings>> {
        if !self.prompt_encryption_key {
            return Ok(self.encryption.clone());
        }
        let key = rpassword::prompt_password("Input encryption key: ")?;
        if key.is_empty() {
            bail!("no value provided");
        }
        info!("using encryption key from the prompt");
        let mut settings = self
            .encryption
            .clone()
            .unwrap_or_else(|| EncryptionSettings::new(""));
        settings.key = key;
        Ok(Some(settings))
    }
}
