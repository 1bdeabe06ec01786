//! Basic-auth plug-in: ships `user:pass` credentials to the edge,
//! where the visitor middleware enforces them.

use clap::{Arg, ArgMatches, Command};

use super::Plugin;

#[derive(Default)]
pub struct AuthPlugin {
    credentials: Option<String>,
}

impl AuthPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Plugin for AuthPlugin {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn register_flags(&self, command: Command) -> Command {
        command.arg(
            Arg::new("auth")
                .long("auth")
                .value_name("USER:PASS")
                .help("Protect the tunnel with HTTP basic auth"),
        )
    }

    fn configure(&mut self, matches: &ArgMatches) {
        self.credentials = matches
            .get_one::<String>("auth")
            .filter(|v| !v.is_empty())
            .cloned();
    }

    fn enabled(&self) -> bool {
        self.credentials.is_some()
    }

    fn worker_config(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        let credentials = self.credentials.as_ref()?;
        let mut config = serde_json::Map::new();
        config.insert("auth".to_string(), credentials.clone().into());
        Some(config)
    }
}
