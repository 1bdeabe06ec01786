//! IP allow-list plug-in: ships a list of allowed visitor addresses
//! (exact IPs or CIDRs) to the edge, where the visitor middleware
//! enforces it.

use clap::{Arg, ArgMatches, Command};

use super::Plugin;

#[derive(Default)]
pub struct IpAllowPlugin {
    allow_ips: Option<String>,
}

impl IpAllowPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Plugin for IpAllowPlugin {
    fn name(&self) -> &'static str {
        "ipallow"
    }

    fn register_flags(&self, command: Command) -> Command {
        command.arg(
            Arg::new("allow-ip")
                .long("allow-ip")
                .value_name("IPS")
                .help("Comma-separated list of allowed IPs or CIDRs (e.g. 1.2.3.4,10.0.0.0/8)"),
        )
    }

    fn configure(&mut self, matches: &ArgMatches) {
        self.allow_ips = matches
            .get_one::<String>("allow-ip")
            .filter(|v| !v.is_empty())
            .cloned();
    }

    fn enabled(&self) -> bool {
        self.allow_ips.is_some()
    }

    fn worker_config(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        let raw = self.allow_ips.as_ref()?;
        let ips: Vec<serde_json::Value> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string().into())
            .collect();
        let mut config = serde_json::Map::new();
        config.insert("allowIps".to_string(), ips.into());
        Some(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_config_splits_and_trims() {
        let plugin = IpAllowPlugin {
            allow_ips: Some("1.2.3.4, 10.0.0.0/8 ,".to_string()),
        };
        let config = plugin.worker_config().unwrap();
        assert_eq!(
            config["allowIps"],
            serde_json::json!(["1.2.3.4", "10.0.0.0/8"])
        );
    }
}
