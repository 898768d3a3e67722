use crate::plugins::registry::{CliPlugin, DownloadCliConfig};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::time::Duration;

pub struct HttpCliPlugin;

impl HttpCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpCliPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl CliPlugin for HttpCliPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn augment_download_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("http_header")
                .long("header")
                .help_heading("HTTP")
                .help("Extra HTTP header (repeatable), e.g. --header 'Authorization: Bearer xxx'")
                .action(ArgAction::Append)
                .num_args(1),
        )
        .arg(
            Arg::new("http_user_agent")
                .long("user-agent")
                .help_heading("HTTP")
                .help("HTTP User-Agent")
                .num_args(1),
        )
        .arg(
            Arg::new("http_timeout_secs")
                .long("timeout-secs")
                .help_heading("HTTP")
                .help("Seconds without data before a read or the whole transfer is considered stalled (0 = never)")
                .default_value("60")
                .value_parser(clap::value_parser!(u64))
                .num_args(1),
        )
        .arg(
            Arg::new("http_retries")
                .long("retries")
                .help_heading("HTTP")
                .help("Extra attempts after a transient failure")
                .default_value("2")
                .value_parser(clap::value_parser!(u32))
                .num_args(1),
        )
        .arg(
            Arg::new("http_retry_backoff_ms")
                .long("retry-backoff-ms")
                .help_heading("HTTP")
                .help("Retry backoff base in milliseconds")
                .default_value("400")
                .value_parser(clap::value_parser!(u64))
                .num_args(1),
        )
    }

    fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()> {
        if let Some(ua) = matches.get_one::<String>("http_user_agent") {
            cfg.driver_ctx.user_agent = ua.clone();
        }
        if let Some(&secs) = matches.get_one::<u64>("http_timeout_secs") {
            cfg.download.timeout = (secs > 0).then(|| Duration::from_secs(secs));
            if secs > 0 {
                cfg.driver_ctx.timeout_secs = secs;
            }
        }
        if let Some(&retries) = matches.get_one::<u32>("http_retries") {
            cfg.download.max_try = retries.saturating_add(1);
        }
        if let Some(&ms) = matches.get_one::<u64>("http_retry_backoff_ms") {
            cfg.download.retry_interval = Duration::from_millis(ms);
        }

        if let Some(values) = matches.get_many::<String>("http_header") {
            for h in values {
                let (k, v) = h
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("invalid header format: {}", h))?;
                cfg.headers.insert(k.trim().to_string(), v.trim().to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::DownloadConfig;
    use crate::plugins::registry::DriverContext;

    fn parse(args: &[&str]) -> anyhow::Result<DownloadCliConfig> {
        let plugin = HttpCliPlugin::new();
        let cmd = plugin.augment_download_command(Command::new("download"));
        let matches = cmd.try_get_matches_from(args)?;
        let mut cfg = DownloadCliConfig {
            headers: Default::default(),
            driver_ctx: DriverContext::default(),
            download: DownloadConfig::default(),
        };
        plugin.apply_download_matches(&matches, &mut cfg)?;
        Ok(cfg)
    }

    #[test]
    fn flags_land_in_download_config() {
        let cfg = parse(&[
            "download",
            "--header", "X-Token: abc",
            "--timeout-secs", "5",
            "--retries", "4",
            "--retry-backoff-ms", "10",
            "--user-agent", "test/1.0",
        ])
        .unwrap();

        assert_eq!(cfg.headers.get("X-Token").map(String::as_str), Some("abc"));
        assert_eq!(cfg.download.timeout, Some(Duration::from_secs(5)));
        assert_eq!(cfg.driver_ctx.timeout_secs, 5);
        assert_eq!(cfg.download.max_try, 5);
        assert_eq!(cfg.download.retry_interval, Duration::from_millis(10));
        assert_eq!(cfg.driver_ctx.user_agent, "test/1.0");
    }

    #[test]
    fn zero_timeout_disables_stall_detection() {
        let cfg = parse(&["download", "--timeout-secs", "0"]).unwrap();
        assert_eq!(cfg.download.timeout, None);
        assert_eq!(cfg.driver_ctx.timeout_secs, DriverContext::default().timeout_secs);
    }

    #[test]
    fn malformed_header_is_rejected() {
        assert!(parse(&["download", "--header", "no-colon"]).is_err());
    }
}
