use clap::Parser;

/// Internal argv[1] sentinel marking the re-exec'd daemon child.
pub const DAEMON_PROCESS: &str = "daemon-process";

/// Default configuration paths, probed in order when `-c` is absent.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "/etc/wireproxy/wireproxy.conf",
    "$HOME/.config/wireproxy.conf",
];

#[derive(Parser, Debug)]
#[command(
    name = "wireproxy",
    about = "Userspace wireguard client for proxying",
    disable_version_flag = true
)]
pub struct Cli {
    /// Path of configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Silent mode
    #[arg(short, long)]
    pub silent: bool,

    /// Make wireproxy run in background
    #[arg(short, long)]
    pub daemon: bool,

    /// Specify the address and port for exposing health status
    #[arg(short, long)]
    pub info: Option<String>,

    /// Print version
    #[arg(short = 'v', long = "version")]
    pub print_version: bool,

    /// Configtest mode. Only check the configuration file for validity
    #[arg(short = 'n', long)]
    pub configtest: bool,
}

/// Version string reported by `-v`: release builds may bake in an override
/// through the `WIREPROXY_VERSION` environment variable, everything else
/// falls back to the crate version.
#[must_use]
pub fn version() -> &'static str {
    option_env!("WIREPROXY_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"))
}

/// Probe the default config locations, returning the first that exists.
#[must_use]
pub fn default_config_path() -> Option<String> {
    for path in DEFAULT_CONFIG_PATHS {
        let expanded = if let Some(rest) = path.strip_prefix("$HOME") {
            let home = std::env::var("HOME").ok()?;
            format!("{home}{rest}")
        } else {
            (*path).to_string()
        };
        if std::path::Path::new(&expanded).exists() {
            return Some(expanded);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_flags() {
        let cli = Cli::parse_from([
            "wireproxy",
            "-c",
            "/tmp/wp.conf",
            "-s",
            "-d",
            "-i",
            "127.0.0.1:9080",
            "-n",
        ]);
        assert_eq!(cli.config.as_deref(), Some("/tmp/wp.conf"));
        assert!(cli.silent);
        assert!(cli.daemon);
        assert_eq!(cli.info.as_deref(), Some("127.0.0.1:9080"));
        assert!(cli.configtest);
        assert!(!cli.print_version);
    }

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::parse_from(["wireproxy"]);
        assert!(cli.config.is_none());
        assert!(!cli.silent);
        assert!(!cli.daemon);
        assert!(cli.info.is_none());
        assert!(!cli.configtest);
    }

    #[test]
    fn test_version_is_nonempty() {
        assert!(!version().is_empty());
    }
}
