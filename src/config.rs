use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

const MIB: u64 = 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub limits: SessionLimits,
    pub ledger: LedgerConfig,
    pub remote: RemoteConfig,
}

/// Upload budgets and the stale-sync recovery window.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_zip_bytes: u64,
    pub max_file_bytes: u64,
    pub max_files: usize,
    pub stale_sync: Duration,
    pub allow_shell_scripts: bool,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub default_total_shares: i64,
    pub platform_fee: f64,
}

/// Settings for the hosted-Git provider.
#[derive(Clone)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub token: Option<String>,
    pub org: Option<String>,
    pub default_private: bool,
    pub api_url: String,
    pub git_url: String,
    pub default_branch: String,
    pub repo_prefix: String,
    pub platform_name: String,
    pub clone_timeout: Duration,
    pub push_timeout: Duration,
    pub command_timeout: Duration,
    pub lazy_file_bytes: u64,
}

// The token never reaches the logs, including the startup config dump.
impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("enabled", &self.enabled)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("org", &self.org)
            .field("default_private", &self.default_private)
            .field("api_url", &self.api_url)
            .field("git_url", &self.git_url)
            .field("default_branch", &self.default_branch)
            .field("repo_prefix", &self.repo_prefix)
            .field("platform_name", &self.platform_name)
            .field("clone_timeout", &self.clone_timeout)
            .field("push_timeout", &self.push_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("lazy_file_bytes", &self.lazy_file_bytes)
            .finish()
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_zip_bytes: 500 * MIB,
            max_file_bytes: 100 * MIB,
            max_files: 5000,
            stale_sync: Duration::from_secs(600),
            allow_shell_scripts: false,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_total_shares: 10_000,
            platform_fee: 1.0,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: None,
            org: None,
            default_private: true,
            api_url: "https://api.github.com".into(),
            git_url: "https://github.com".into(),
            default_branch: "main".into(),
            repo_prefix: "kickthis-project".into(),
            platform_name: "KickthisUSs".into(),
            clone_timeout: Duration::from_secs(300),
            push_timeout: Duration::from_secs(300),
            command_timeout: Duration::from_secs(60),
            lazy_file_bytes: 10 * MIB,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            database_url: "sqlite://./data/kickthis.db".into(),
            workspace_root: PathBuf::from("./instance/project_uploads"),
            limits: SessionLimits::default(),
            ledger: LedgerConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "KickthisUSs equity ledger and workspace sync service")]
pub struct Args {
    /// Host to bind to (overrides HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Parent directory for upload sessions (overrides WORKSPACE_ROOT)
    #[arg(long)]
    pub workspace_root: Option<PathBuf>,

    /// Database URL (overrides DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Convert every percentage-ledger project to the shares ledger and exit
    #[arg(long)]
    pub migrate_shares: bool,
}

/// What the binary should do after configuration is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    MigrateShares,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        let args = Args::parse();
        let defaults = Self::default();

        // --- Environment fallback ---
        let env_host = env::var("HOST").unwrap_or(defaults.host);
        let env_port = env_or("PORT", defaults.port)?;
        let env_root = env::var("WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_root);
        let env_db = env::var("DATABASE_URL").unwrap_or(defaults.database_url);

        let limits = SessionLimits {
            max_zip_bytes: env_or("MAX_ZIP_BYTES", defaults.limits.max_zip_bytes)?,
            max_file_bytes: env_or("MAX_FILE_BYTES", defaults.limits.max_file_bytes)?,
            max_files: env_or("MAX_FILES", defaults.limits.max_files)?,
            stale_sync: Duration::from_secs(env_or(
                "STALE_SYNC_SECONDS",
                defaults.limits.stale_sync.as_secs(),
            )?),
            allow_shell_scripts: env_or("ALLOW_SHELL_SCRIPTS", false)?,
        };

        let ledger = LedgerConfig {
            default_total_shares: env_or(
                "DEFAULT_TOTAL_SHARES",
                defaults.ledger.default_total_shares,
            )?,
            platform_fee: env_or("PLATFORM_FEE", defaults.ledger.platform_fee)?,
        };
        if ledger.default_total_shares <= 0 {
            bail!("DEFAULT_TOTAL_SHARES must be positive");
        }
        if !(0.0..100.0).contains(&ledger.platform_fee) {
            bail!("PLATFORM_FEE must be in [0, 100)");
        }

        let remote_defaults = defaults.remote;
        let remote = RemoteConfig {
            enabled: env_or("REMOTE_ENABLED", remote_defaults.enabled)?,
            token: env::var("REMOTE_TOKEN").ok().filter(|t| !t.is_empty()),
            org: env::var("REMOTE_ORG").ok().filter(|o| !o.is_empty()),
            default_private: env_or("REMOTE_DEFAULT_PRIVATE", remote_defaults.default_private)?,
            api_url: env::var("REMOTE_API_URL").unwrap_or(remote_defaults.api_url),
            git_url: env::var("REMOTE_GIT_URL").unwrap_or(remote_defaults.git_url),
            default_branch: env::var("REMOTE_DEFAULT_BRANCH")
                .unwrap_or(remote_defaults.default_branch),
            repo_prefix: env::var("REMOTE_REPO_PREFIX").unwrap_or(remote_defaults.repo_prefix),
            platform_name: env::var("PLATFORM_NAME").unwrap_or(remote_defaults.platform_name),
            clone_timeout: Duration::from_secs(env_or(
                "GIT_CLONE_TIMEOUT_SECONDS",
                remote_defaults.clone_timeout.as_secs(),
            )?),
            push_timeout: Duration::from_secs(env_or(
                "GIT_PUSH_TIMEOUT_SECONDS",
                remote_defaults.push_timeout.as_secs(),
            )?),
            command_timeout: Duration::from_secs(env_or(
                "GIT_COMMAND_TIMEOUT_SECONDS",
                remote_defaults.command_timeout.as_secs(),
            )?),
            lazy_file_bytes: env_or("LAZY_FILE_BYTES", remote_defaults.lazy_file_bytes)?,
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            workspace_root: args.workspace_root.unwrap_or(env_root),
            limits,
            ledger,
            remote,
        };

        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.migrate_shares {
            RunMode::MigrateShares
        } else {
            RunMode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.limits.max_zip_bytes, 500 * MIB);
        assert_eq!(cfg.limits.max_file_bytes, 100 * MIB);
        assert_eq!(cfg.limits.max_files, 5000);
        assert_eq!(cfg.limits.stale_sync, Duration::from_secs(600));
        assert_eq!(cfg.ledger.default_total_shares, 10_000);
        assert!(!cfg.remote.enabled);
        assert!(cfg.remote.default_private);
        assert_eq!(cfg.remote.clone_timeout, Duration::from_secs(300));
    }

    #[test]
    fn debug_output_redacts_token() {
        let remote = RemoteConfig {
            token: Some("ghp_supersecret".into()),
            ..RemoteConfig::default()
        };
        let rendered = format!("{:?}", remote);
        assert!(!rendered.contains("ghp_supersecret"));
        assert!(rendered.contains("***"));
    }
}
