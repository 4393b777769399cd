//! Command-line interface for the server binary.

use std::path::PathBuf;

use clap::Parser;

use crate::config::ServerConfig;

#[derive(Debug, Parser)]
#[command(
    name = "infer-server",
    version,
    about = "Multi-stream video inference server"
)]
pub struct Cli {
    /// Path to the server config JSON file.
    #[arg(long, default_value = "config/server.json")]
    pub config: PathBuf,

    /// Override the REST API port.
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Override the number of inference workers.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Apply CLI overrides on top of the loaded file config.
    pub fn apply_overrides(&self, config: &mut ServerConfig) {
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(workers) = self.workers {
            config.num_infer_workers = workers.max(1);
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_file_values() {
        let cli = Cli::parse_from([
            "infer-server",
            "--http-port",
            "9999",
            "--workers",
            "0",
            "--log-level",
            "debug",
        ]);
        let mut config = ServerConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.http_port, 9999);
        // Worker override is clamped to at least one.
        assert_eq!(config.num_infer_workers, 1);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn defaults_leave_config_untouched() {
        let cli = Cli::parse_from(["infer-server"]);
        let mut config = ServerConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.num_infer_workers, 3);
    }
}
