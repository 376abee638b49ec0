use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use beacon_common::manager::ManagerSettings;
use beacon_common::oci::RuntimeKind;
use beacon_common::registry::RegistryKind;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "1323")]
    pub port: u16,

    #[envconfig(default = "podman")]
    pub oci_runtime: RuntimeKind,

    #[envconfig(default = "docker")]
    pub registry: RegistryKind,

    #[envconfig(default = "https://hub.docker.com")]
    pub registry_url: String,

    #[envconfig(default = "false")]
    pub clean_on_exit: bool,

    /// Poll delay of probes created over HTTP.
    #[envconfig(default = "20000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub reconcile_interval: EnvMsDuration,

    #[envconfig(default = "20000")]
    pub stop_probe_timeout: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub cleanup_timeout: EnvMsDuration,

    #[envconfig(default = "300000")]
    pub runtime_timeout: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub shutdown_grace: EnvMsDuration,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// How long the task group waits for its tasks once one of them ends.
    /// The reconciler's exit path may spend `cleanup_timeout` on container
    /// cleanup and again on stopping the probes, on top of the usual grace.
    pub fn group_grace(&self) -> time::Duration {
        self.shutdown_grace.0 + self.cleanup_timeout.0 * 2
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            clean_on_exit: self.clean_on_exit,
            reconcile_interval: self.reconcile_interval.0,
            cleanup_timeout: self.cleanup_timeout.0,
            runtime_timeout: self.runtime_timeout.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use beacon_common::group::TaskGroup;
    use beacon_common::manager::BeaconManager;
    use beacon_common::test_utils::{wait_until, FakeRegistry, FakeRuntime, RuntimeOperation};

    use super::*;

    const APP: &str = "acme/app@sha256:aaa";
    const WEB: &str = "acme/web@sha256:bbb";

    #[test]
    fn defaults_match_beacond_flags() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:1323");
        assert_eq!(config.oci_runtime, RuntimeKind::Podman);
        assert_eq!(config.registry, RegistryKind::Docker);
        assert_eq!(config.registry_url, "https://hub.docker.com");
        assert!(!config.clean_on_exit);
        assert_eq!(config.poll_interval.0, time::Duration::from_secs(20));
        assert_eq!(config.stop_probe_timeout.0, time::Duration::from_secs(20));
        assert!(config.export_prometheus);
    }

    #[test]
    fn reads_overrides() {
        let env = HashMap::from([
            ("BIND_PORT".to_owned(), "8080".to_owned()),
            ("OCI_RUNTIME".to_owned(), "docker".to_owned()),
            ("CLEAN_ON_EXIT".to_owned(), "true".to_owned()),
            ("RECONCILE_INTERVAL".to_owned(), "250".to_owned()),
        ]);

        let config = Config::init_from_hashmap(&env).unwrap();
        let settings = config.manager_settings();

        assert_eq!(config.port, 8080);
        assert_eq!(config.oci_runtime, RuntimeKind::Docker);
        assert!(settings.clean_on_exit);
        assert_eq!(settings.reconcile_interval, time::Duration::from_millis(250));
    }

    #[test]
    fn rejects_unknown_runtime() {
        let env = HashMap::from([("OCI_RUNTIME".to_owned(), "containerd".to_owned())]);

        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn parses_millisecond_durations() {
        assert_eq!(
            EnvMsDuration::from_str("1500").unwrap().0,
            time::Duration::from_millis(1500)
        );
        assert_eq!(
            EnvMsDuration::from_str("soon").unwrap_err(),
            ParseEnvMsDurationError
        );
    }

    #[tokio::test(start_paused = true)]
    async fn group_grace_lets_clean_on_exit_finish() {
        let env = HashMap::from([("CLEAN_ON_EXIT".to_owned(), "true".to_owned())]);
        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(config.group_grace(), time::Duration::from_secs(70));

        let registry = Arc::new(FakeRegistry::default());
        registry.publish("acme", "app", "sha256:aaa");
        registry.publish("acme", "web", "sha256:bbb");
        let runtime = Arc::new(FakeRuntime::default());
        runtime.set_delay(
            RuntimeOperation::StopByImage,
            Some(time::Duration::from_secs(10)),
        );

        let mut group = TaskGroup::new(config.group_grace());
        let manager = Arc::new(BeaconManager::new(
            runtime.clone(),
            registry.clone(),
            config.manager_settings(),
            &group.token(),
        ));
        manager
            .start_probe("acme", "app", config.poll_interval.0)
            .unwrap();
        manager
            .start_probe("acme", "web", config.poll_interval.0)
            .unwrap();

        let reconciler = manager.clone();
        group.spawn("reconciler", move |_| async move {
            reconciler.run().await;
            Ok(())
        });
        let deployments = runtime.clone();
        group.spawn("signals", move |_| async move {
            wait_until(time::Duration::from_secs(60), || {
                deployments.running(APP).len() == 1 && deployments.running(WEB).len() == 1
            })
            .await;
            Ok(())
        });

        group.wait().await.unwrap();

        assert!(runtime.running(APP).is_empty());
        assert!(runtime.running(WEB).is_empty());
        assert!(manager.list_probes().is_empty());
    }
}
