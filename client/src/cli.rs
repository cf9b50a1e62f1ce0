use {
    anyhow::{Result, format_err},
    clap::{Parser, Subcommand},
    cloakfs_protocol::LogicalPath,
    std::path::PathBuf,
};

#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the config file. Defaults to `cloakfs.json5` in the user config directory.
    #[clap(long)]
    pub config: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// List a directory.
    Ls {
        #[clap(default_value = "/")]
        path: LogicalPath,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Show metadata of a file or directory.
    Stat { path: LogicalPath },
    /// Download a file. Writes to stdout if `local_path` is omitted.
    Get {
        path: LogicalPath,
        local_path: Option<PathBuf>,
    },
    /// Upload a local file.
    Put {
        local_path: PathBuf,
        path: LogicalPath,
    },
    /// Remove a file or directory.
    Rm {
        path: LogicalPath,
        #[arg(short, long)]
        recursive: bool,
        /// Don't fail if the path doesn't exist.
        #[arg(short, long)]
        quiet: bool,
    },
    /// Copy a plain local directory into the storage.
    Import {
        local_dir: PathBuf,
        #[clap(default_value = "/")]
        path: LogicalPath,
    },
    /// Drop cached entries of this storage.
    Flush,
    /// Show hit/miss counters of the cache.
    Stats,
}

pub fn default_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().ok_or_else(|| format_err!("cannot find config dir"))?;
    Ok(config_dir.join("cloakfs.json5"))
}
