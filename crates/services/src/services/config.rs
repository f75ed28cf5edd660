//! Deployment configuration. Everything is environment-variable driven with
//! sane defaults; invalid values fall back with a warning instead of failing
//! startup.

use std::{path::PathBuf, str::FromStr, time::Duration};

use execution::process::CommandTimeouts;
use serde::{Deserialize, Serialize};

pub const DEFAULT_IMAGE: &str = "sbx-sandbox:latest";
pub const DEFAULT_FALLBACK_IMAGE: &str = "node:20-alpine";
pub const DEFAULT_NETWORK: &str = "sbx_net";
pub const DEFAULT_INTERNAL_PORT: u16 = 3000;
pub const DEFAULT_MOUNT_TARGET: &str = "/workspace";

const PROFILE_ENV: &str = "SBX_PROFILE";
const SANDBOX_ROOT_ENV: &str = "SBX_SANDBOX_ROOT";
const MAX_CONTAINERS_ENV: &str = "SBX_MAX_CONTAINERS";
const IDLE_TTL_ENV: &str = "SBX_IDLE_TTL_SECS";
const SWEEP_INTERVAL_ENV: &str = "SBX_SWEEP_INTERVAL_SECS";
const COMMAND_TIMEOUT_ENV: &str = "SBX_COMMAND_TIMEOUT_SECS";
const INSTALL_TIMEOUT_ENV: &str = "SBX_INSTALL_TIMEOUT_SECS";
const KILL_GRACE_ENV: &str = "SBX_KILL_GRACE_SECS";
const IMAGE_ENV: &str = "SBX_IMAGE";
const IMAGE_DOCKERFILE_ENV: &str = "SBX_IMAGE_DOCKERFILE";
const FALLBACK_IMAGE_ENV: &str = "SBX_FALLBACK_IMAGE";
const NETWORK_ENV: &str = "SBX_NETWORK";
const PROXY_CONF_ENV: &str = "SBX_PROXY_CONF";
const INTERNAL_PORT_ENV: &str = "SBX_INTERNAL_PORT";

/// Tuning preset for one way of running the pool. The historical deployments
/// disagreed on capacity and resource ceilings; those differences live here
/// as data instead of parallel implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentProfile {
    Local,
    Production,
    HighDensity,
}

impl DeploymentProfile {
    pub fn max_containers(self) -> usize {
        match self {
            DeploymentProfile::Local => 50,
            DeploymentProfile::Production => 500,
            DeploymentProfile::HighDensity => 1000,
        }
    }

    pub fn memory_limit_bytes(self) -> Option<i64> {
        match self {
            DeploymentProfile::Local => None,
            DeploymentProfile::Production => Some(512 * 1024 * 1024),
            DeploymentProfile::HighDensity => Some(256 * 1024 * 1024),
        }
    }

    /// CPU share ceiling in Docker's nano-cpu unit (1e9 == one core).
    pub fn nano_cpus(self) -> Option<i64> {
        match self {
            DeploymentProfile::Local => None,
            DeploymentProfile::Production => Some(1_000_000_000),
            DeploymentProfile::HighDensity => Some(500_000_000),
        }
    }
}

impl FromStr for DeploymentProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(DeploymentProfile::Local),
            "production" => Ok(DeploymentProfile::Production),
            "high-density" | "high_density" => Ok(DeploymentProfile::HighDensity),
            other => Err(format!("unknown deployment profile '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub profile: DeploymentProfile,
    /// Host directory holding one project directory per tenant.
    pub sandbox_root: PathBuf,
    pub max_containers: usize,
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
    pub timeouts: CommandTimeouts,
    pub image: String,
    /// Dockerfile to build [`Self::image`] from when it is not already
    /// present locally. Unset means the build step is skipped and resolution
    /// goes straight to pulling.
    pub image_dockerfile: Option<PathBuf>,
    pub fallback_image: String,
    pub network: String,
    pub internal_port: u16,
    pub mount_target: String,
    pub proxy_conf: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            profile: DeploymentProfile::Local,
            sandbox_root: std::env::temp_dir().join("sbx-projects"),
            max_containers: DeploymentProfile::Local.max_containers(),
            idle_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(1800),
            timeouts: CommandTimeouts::default(),
            image: DEFAULT_IMAGE.to_string(),
            image_dockerfile: None,
            fallback_image: DEFAULT_FALLBACK_IMAGE.to_string(),
            network: DEFAULT_NETWORK.to_string(),
            internal_port: DEFAULT_INTERNAL_PORT,
            mount_target: DEFAULT_MOUNT_TARGET.to_string(),
            proxy_conf: PathBuf::from("/etc/nginx/conf.d/sbx-routes.conf"),
        }
    }
}

impl SandboxConfig {
    pub fn from_env() -> Self {
        let profile = read_env_profile();
        let defaults = Self {
            profile,
            max_containers: profile.max_containers(),
            ..Self::default()
        };

        Self {
            profile,
            sandbox_root: read_env_path(SANDBOX_ROOT_ENV, defaults.sandbox_root),
            max_containers: read_env_u64(
                MAX_CONTAINERS_ENV,
                defaults.max_containers as u64,
                1,
            ) as usize,
            idle_ttl: Duration::from_secs(read_env_u64(IDLE_TTL_ENV, 3600, 60)),
            sweep_interval: Duration::from_secs(read_env_u64(SWEEP_INTERVAL_ENV, 1800, 10)),
            timeouts: CommandTimeouts {
                foreground: Duration::from_secs(read_env_u64(COMMAND_TIMEOUT_ENV, 60, 1)),
                install: Duration::from_secs(read_env_u64(INSTALL_TIMEOUT_ENV, 180, 1)),
                kill_grace: Duration::from_secs(read_env_u64(KILL_GRACE_ENV, 5, 1)),
            },
            image: read_env_string(IMAGE_ENV, defaults.image),
            image_dockerfile: read_env_opt_path(IMAGE_DOCKERFILE_ENV),
            fallback_image: read_env_string(FALLBACK_IMAGE_ENV, defaults.fallback_image),
            network: read_env_string(NETWORK_ENV, defaults.network),
            internal_port: read_env_u64(INTERNAL_PORT_ENV, u64::from(defaults.internal_port), 1)
                .min(u64::from(u16::MAX)) as u16,
            mount_target: defaults.mount_target,
            proxy_conf: read_env_path(PROXY_CONF_ENV, defaults.proxy_conf),
        }
    }

    pub fn project_dir(&self, tenant: &str) -> PathBuf {
        self.sandbox_root.join(tenant)
    }
}

fn read_env_profile() -> DeploymentProfile {
    match std::env::var(PROFILE_ENV) {
        Ok(raw) => raw.parse().unwrap_or_else(|e| {
            tracing::warn!("{PROFILE_ENV}: {e}, using local profile");
            DeploymentProfile::Local
        }),
        Err(_) => DeploymentProfile::Local,
    }
}

fn read_env_string(name: &str, default: String) -> String {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw,
        _ => default,
    }
}

fn read_env_path(name: &str, default: PathBuf) -> PathBuf {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => PathBuf::from(raw),
        _ => default,
    }
}

fn read_env_opt_path(name: &str) -> Option<PathBuf> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => Some(PathBuf::from(raw)),
        _ => None,
    }
}

fn read_env_u64(name: &str, default: u64, min: u64) -> u64 {
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value >= min => value,
        Ok(value) => {
            tracing::warn!("{name}={value} is below the minimum {min}, clamping");
            min
        }
        Err(_) => {
            tracing::warn!("{name}='{raw}' is not a number, using default {default}");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_parsing_accepts_known_names() {
        assert_eq!("local".parse(), Ok(DeploymentProfile::Local));
        assert_eq!("Production".parse(), Ok(DeploymentProfile::Production));
        assert_eq!("high-density".parse(), Ok(DeploymentProfile::HighDensity));
        assert!("galactic".parse::<DeploymentProfile>().is_err());
    }

    #[test]
    fn profiles_scale_capacity_and_tighten_resources() {
        assert_eq!(DeploymentProfile::Local.max_containers(), 50);
        assert_eq!(DeploymentProfile::Production.max_containers(), 500);
        assert_eq!(DeploymentProfile::HighDensity.max_containers(), 1000);
        assert!(DeploymentProfile::Local.memory_limit_bytes().is_none());
        assert!(
            DeploymentProfile::HighDensity.memory_limit_bytes()
                < DeploymentProfile::Production.memory_limit_bytes()
        );
    }

    #[test]
    fn default_config_uses_local_profile_limits() {
        let config = SandboxConfig::default();
        assert_eq!(config.max_containers, 50);
        assert_eq!(config.idle_ttl, Duration::from_secs(3600));
        assert_eq!(config.sweep_interval, Duration::from_secs(1800));
        assert_eq!(config.internal_port, 3000);
    }
}
