use std::path::PathBuf;

use clap::Parser;

/// Control-plane daemon between the web front end and the Docker Engine.
///
/// Serves the JSON-RPC surface the front end drives, talks to the engine
/// over its Unix socket, and reaps idle user containers.
#[derive(Parser, Debug)]
#[command(name = "dockerbridge", version, about)]
pub struct Cli {
    /// Address the JSON-RPC listener binds to
    #[arg(long, default_value = "0.0.0.0:5001")]
    pub listen: String,

    /// Docker Engine socket path
    #[arg(long, default_value = "/var/run/docker.sock")]
    pub docker_socket: PathBuf,

    /// Host directory staged into helper containers for large transfers
    #[arg(long, default_value = "/tmp/dockerbridge/transfer")]
    pub transfer_dir: PathBuf,

    /// Seconds a user container may idle before the watchdog stops it
    #[arg(long, default_value_t = 600)]
    pub session_ttl: u64,

    /// Watchdog sweep interval in seconds
    #[arg(long, default_value_t = 5)]
    pub poll_interval: u64,

    /// Log at debug level (RUST_LOG still wins)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Environment overrides take precedence over flag defaults; deployments
    /// configure through the environment, flags are for hand runs.
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("DOCKERBRIDGE_LISTEN") {
            if !v.trim().is_empty() {
                self.listen = v;
            }
        }
        if let Ok(v) = std::env::var("DOCKERBRIDGE_SOCKET") {
            if !v.trim().is_empty() {
                self.docker_socket = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("DOCKERBRIDGE_TRANSFER_DIR") {
            if !v.trim().is_empty() {
                self.transfer_dir = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("DOCKERBRIDGE_SESSION_TTL") {
            if let Ok(secs) = v.trim().parse() {
                self.session_ttl = secs;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["dockerbridge"]);
        assert_eq!(cli.listen, "0.0.0.0:5001");
        assert_eq!(cli.session_ttl, 600);
        assert_eq!(cli.poll_interval, 5);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_flags_override() {
        let cli = Cli::parse_from([
            "dockerbridge",
            "--listen",
            "127.0.0.1:6001",
            "--session-ttl",
            "60",
            "-v",
        ]);
        assert_eq!(cli.listen, "127.0.0.1:6001");
        assert_eq!(cli.session_ttl, 60);
        assert!(cli.verbose);
    }
}
