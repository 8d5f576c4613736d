use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::manager::ManagerConfig;
use crate::sandbox::types::{
    E2bConfig, LocalConfig, ModalConfig, ProviderKind, ProviderRuntimeConfig,
};

/// Raw environment values, before parsing. Tests build this directly so
/// they never mutate process-global environment.
#[derive(Debug, Default, Clone)]
pub struct RawConfig {
    pub port: Option<String>,
    pub sentry_dsn: Option<String>,
    pub environment: Option<String>,
    pub provider: Option<String>,
    pub max_instances: Option<String>,
    pub ttl_free_minutes: Option<String>,
    pub ttl_paid_minutes: Option<String>,
    pub sweep_interval_secs: Option<String>,
    pub poll_interval_secs: Option<String>,
    pub poll_max_attempts: Option<String>,
    pub prewarm_deps: Option<String>,
    pub deps_cache_dir: Option<String>,
    pub deps_base_package: Option<String>,
    pub local_root_dir: Option<String>,
    pub local_port_base: Option<String>,
    pub local_port_range: Option<String>,
    pub e2b_api_base_url: Option<String>,
    pub e2b_api_key: Option<String>,
    pub e2b_template_id: Option<String>,
    pub modal_api_base_url: Option<String>,
    pub modal_api_token: Option<String>,
    pub modal_image: Option<String>,
    pub cloud_dev_server_port: Option<String>,
}

impl RawConfig {
    fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok();
        Self {
            port: var("PORT"),
            sentry_dsn: var("SENTRY_DSN"),
            environment: var("ENVIRONMENT"),
            provider: var("PREVIEWD_PROVIDER"),
            max_instances: var("PREVIEWD_MAX_INSTANCES"),
            ttl_free_minutes: var("PREVIEWD_TTL_FREE_MINUTES"),
            ttl_paid_minutes: var("PREVIEWD_TTL_PAID_MINUTES"),
            sweep_interval_secs: var("PREVIEWD_SWEEP_INTERVAL_SECS"),
            poll_interval_secs: var("PREVIEWD_POLL_INTERVAL_SECS"),
            poll_max_attempts: var("PREVIEWD_POLL_MAX_ATTEMPTS"),
            prewarm_deps: var("PREVIEWD_PREWARM_DEPS"),
            deps_cache_dir: var("PREVIEWD_DEPS_CACHE_DIR"),
            deps_base_package: var("PREVIEWD_DEPS_BASE_PACKAGE"),
            local_root_dir: var("PREVIEWD_LOCAL_ROOT"),
            local_port_base: var("PREVIEWD_LOCAL_PORT_BASE"),
            local_port_range: var("PREVIEWD_LOCAL_PORT_RANGE"),
            e2b_api_base_url: var("E2B_API_BASE_URL"),
            e2b_api_key: var("E2B_API_KEY"),
            e2b_template_id: var("E2B_TEMPLATE_ID"),
            modal_api_base_url: var("MODAL_API_BASE_URL"),
            modal_api_token: var("MODAL_API_TOKEN"),
            modal_image: var("MODAL_IMAGE"),
            cloud_dev_server_port: var("PREVIEWD_CLOUD_DEV_PORT"),
        }
    }
}

/// Server configuration, loaded once at startup. Every knob has a
/// default; unparseable values fall back to it rather than aborting.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub provider: ProviderKind,
    pub max_instances: usize,
    pub ttl_free_minutes: u64,
    pub ttl_paid_minutes: u64,
    pub sweep_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub poll_max_attempts: u32,
    pub prewarm_deps: bool,
    pub deps_cache_dir: PathBuf,
    pub deps_base_package: String,
    pub local_root_dir: PathBuf,
    pub local_port_base: u16,
    pub local_port_range: u16,
    pub e2b_api_base_url: String,
    pub e2b_api_key: Option<String>,
    pub e2b_template_id: String,
    pub modal_api_base_url: String,
    pub modal_api_token: Option<String>,
    pub modal_image: String,
    pub cloud_dev_server_port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw(RawConfig::from_env())
    }

    pub fn from_raw(raw: RawConfig) -> Self {
        fn parse<T: std::str::FromStr>(v: &Option<String>) -> Option<T> {
            v.as_deref().and_then(|s| s.parse().ok())
        }
        let non_empty =
            |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(String::from);

        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".previewd");

        let provider = match raw.provider.as_deref() {
            None | Some("") | Some("local") => ProviderKind::Local,
            Some("e2b") => ProviderKind::E2b,
            Some("modal") => ProviderKind::Modal,
            Some(other) => {
                tracing::warn!(provider = other, "unknown PREVIEWD_PROVIDER, using local");
                ProviderKind::Local
            }
        };

        let prewarm_deps = matches!(
            raw.prewarm_deps.as_deref(),
            Some("1") | Some("true") | Some("yes")
        );

        Config {
            port: parse(&raw.port).unwrap_or(8090),
            sentry_dsn: non_empty(&raw.sentry_dsn),
            environment: non_empty(&raw.environment).unwrap_or_else(|| "local".to_string()),
            provider,
            max_instances: parse(&raw.max_instances).unwrap_or(20),
            ttl_free_minutes: parse(&raw.ttl_free_minutes).unwrap_or(15),
            ttl_paid_minutes: parse(&raw.ttl_paid_minutes).unwrap_or(60),
            sweep_interval_secs: parse(&raw.sweep_interval_secs).unwrap_or(10),
            poll_interval_secs: parse(&raw.poll_interval_secs).unwrap_or(3),
            poll_max_attempts: parse(&raw.poll_max_attempts).unwrap_or(40),
            prewarm_deps,
            deps_cache_dir: non_empty(&raw.deps_cache_dir)
                .map(PathBuf::from)
                .unwrap_or_else(|| base_dir.join("deps-cache")),
            deps_base_package: non_empty(&raw.deps_base_package)
                .unwrap_or_else(|| "react".to_string()),
            local_root_dir: non_empty(&raw.local_root_dir)
                .map(PathBuf::from)
                .unwrap_or_else(|| base_dir.join("previews")),
            local_port_base: parse(&raw.local_port_base).unwrap_or(3100),
            local_port_range: parse(&raw.local_port_range).unwrap_or(100),
            e2b_api_base_url: non_empty(&raw.e2b_api_base_url)
                .unwrap_or_else(|| "https://api.e2b.app".to_string()),
            e2b_api_key: non_empty(&raw.e2b_api_key),
            e2b_template_id: non_empty(&raw.e2b_template_id)
                .unwrap_or_else(|| "previewd-node-20".to_string()),
            modal_api_base_url: non_empty(&raw.modal_api_base_url)
                .unwrap_or_else(|| "https://api.modal.run".to_string()),
            modal_api_token: non_empty(&raw.modal_api_token),
            modal_image: non_empty(&raw.modal_image)
                .unwrap_or_else(|| "previewd/node:20".to_string()),
            cloud_dev_server_port: parse(&raw.cloud_dev_server_port).unwrap_or(3000),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_instances: self.max_instances,
            ttl_free: Duration::from_secs(self.ttl_free_minutes * 60),
            ttl_paid: Duration::from_secs(self.ttl_paid_minutes * 60),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            poll_max_attempts: self.poll_max_attempts,
        }
    }

    /// Command run inside the cache dir to build the base install.
    pub fn deps_warm_command(&self) -> Vec<String> {
        vec![
            "npm".into(),
            "install".into(),
            "--no-audit".into(),
            "--no-fund".into(),
            self.deps_base_package.clone(),
        ]
    }

    pub fn provider_runtime(&self) -> ProviderRuntimeConfig {
        match self.provider {
            ProviderKind::Local => ProviderRuntimeConfig::Local(LocalConfig {
                root_dir: self.local_root_dir.clone(),
                port_base: self.local_port_base,
                port_range: self.local_port_range,
                ..LocalConfig::default()
            }),
            ProviderKind::E2b => ProviderRuntimeConfig::E2b(E2bConfig {
                api_base_url: self.e2b_api_base_url.clone(),
                api_key: self.e2b_api_key.clone().unwrap_or_default(),
                template_id: self.e2b_template_id.clone(),
                dev_server_port: self.cloud_dev_server_port,
            }),
            ProviderKind::Modal => ProviderRuntimeConfig::Modal(ModalConfig {
                api_base_url: self.modal_api_base_url.clone(),
                api_token: self.modal_api_token.clone().unwrap_or_default(),
                image: self.modal_image.clone(),
                dev_server_port: self.cloud_dev_server_port,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_with_empty_raw() {
        let config = Config::from_raw(RawConfig::default());
        assert_eq!(config.port, 8090);
        assert!(config.sentry_dsn.is_none());
        assert_eq!(config.environment, "local");
        assert_eq!(config.provider, ProviderKind::Local);
        assert_eq!(config.max_instances, 20);
        assert_eq!(config.ttl_free_minutes, 15);
        assert_eq!(config.ttl_paid_minutes, 60);
        assert!(!config.prewarm_deps);
        assert!(config.deps_cache_dir.ends_with(".previewd/deps-cache"));
        assert!(config.local_root_dir.ends_with(".previewd/previews"));
    }

    #[test]
    fn invalid_port_uses_default() {
        let raw = RawConfig {
            port: Some("not-a-number".into()),
            ..RawConfig::default()
        };
        assert_eq!(Config::from_raw(raw).port, 8090);
    }

    #[test]
    fn valid_port_is_used() {
        let raw = RawConfig {
            port: Some("3000".into()),
            ..RawConfig::default()
        };
        assert_eq!(Config::from_raw(raw).port, 3000);
    }

    #[test]
    fn empty_sentry_dsn_is_none() {
        let raw = RawConfig {
            sentry_dsn: Some("".into()),
            ..RawConfig::default()
        };
        assert!(Config::from_raw(raw).sentry_dsn.is_none());
    }

    #[test]
    fn provider_parses_known_values() {
        for (input, expected) in [
            ("local", ProviderKind::Local),
            ("e2b", ProviderKind::E2b),
            ("modal", ProviderKind::Modal),
            ("something-else", ProviderKind::Local),
        ] {
            let raw = RawConfig {
                provider: Some(input.into()),
                ..RawConfig::default()
            };
            assert_eq!(Config::from_raw(raw).provider, expected, "input {input}");
        }
    }

    #[test]
    fn prewarm_accepts_truthy_values() {
        for value in ["1", "true", "yes"] {
            let raw = RawConfig {
                prewarm_deps: Some(value.into()),
                ..RawConfig::default()
            };
            assert!(Config::from_raw(raw).prewarm_deps, "value {value}");
        }
        let raw = RawConfig {
            prewarm_deps: Some("0".into()),
            ..RawConfig::default()
        };
        assert!(!Config::from_raw(raw).prewarm_deps);
    }

    #[test]
    fn manager_config_converts_units() {
        let raw = RawConfig {
            ttl_free_minutes: Some("5".into()),
            ttl_paid_minutes: Some("90".into()),
            poll_interval_secs: Some("2".into()),
            poll_max_attempts: Some("10".into()),
            ..RawConfig::default()
        };
        let mc = Config::from_raw(raw).manager_config();
        assert_eq!(mc.ttl_free, Duration::from_secs(300));
        assert_eq!(mc.ttl_paid, Duration::from_secs(5400));
        assert_eq!(mc.poll_interval, Duration::from_secs(2));
        assert_eq!(mc.poll_max_attempts, 10);
    }

    #[test]
    fn local_runtime_carries_port_settings() {
        let raw = RawConfig {
            local_port_base: Some("4200".into()),
            local_port_range: Some("50".into()),
            ..RawConfig::default()
        };
        match Config::from_raw(raw).provider_runtime() {
            ProviderRuntimeConfig::Local(c) => {
                assert_eq!(c.port_base, 4200);
                assert_eq!(c.port_range, 50);
            }
            other => panic!("expected local runtime, got {other:?}"),
        }
    }

    #[test]
    fn e2b_runtime_carries_credentials() {
        let raw = RawConfig {
            provider: Some("e2b".into()),
            e2b_api_key: Some("sk-test".into()),
            e2b_template_id: Some("tmpl-x".into()),
            cloud_dev_server_port: Some("5173".into()),
            ..RawConfig::default()
        };
        match Config::from_raw(raw).provider_runtime() {
            ProviderRuntimeConfig::E2b(c) => {
                assert_eq!(c.api_key, "sk-test");
                assert_eq!(c.template_id, "tmpl-x");
                assert_eq!(c.dev_server_port, 5173);
            }
            other => panic!("expected e2b runtime, got {other:?}"),
        }
    }

    #[test]
    fn deps_warm_command_targets_base_package() {
        let raw = RawConfig {
            deps_base_package: Some("vite".into()),
            ..RawConfig::default()
        };
        let cmd = Config::from_raw(raw).deps_warm_command();
        assert_eq!(cmd[0], "npm");
        assert!(cmd.contains(&"vite".to_string()));
    }
}
