//!
//! classgate configuration
//! -----------------------
//! Settings for the dev server, read from environment variables and overridden
//! by command-line flags.

use std::env;
use std::net::IpAddr;
use std::time::Duration;

use crate::identity::DEFAULT_CONFIRM_TIMEOUT;

pub const DEFAULT_HTTP_PORT: u16 = 7878;
pub const DEFAULT_MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    pub http_port: u16,
    pub bind: IpAddr,
    pub min_password_len: usize,
    pub seed_demo: bool,
    /// How long sign-in and sign-out wait for the provider to echo the change.
    pub confirm_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            bind: IpAddr::from([127, 0, 0, 1]),
            min_password_len: DEFAULT_MIN_PASSWORD_LEN,
            seed_demo: false,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }
}

fn parse_port_value(val: &str) -> Option<u16> { val.trim().parse::<u16>().ok() }

fn parse_bool_value(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].as_str());
        }
        i += 1;
    }
    None
}

pub fn has_flag(args: &[String], flag: &str) -> bool { args.iter().any(|a| a == flag) }

impl GateConfig {
    /// Environment from the process, flags from `args`.
    pub fn from_env_and_args(args: &[String]) -> Self { Self::from_sources(args, |name| env::var(name).ok()) }

    /// Flags override environment; unparsable values fall back to the default.
    pub fn from_sources<F>(args: &[String], env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = GateConfig::default();

        let env_port = env("CLASSGATE_HTTP_PORT").and_then(|v| parse_port_value(&v));
        let arg_port = arg_value(args, "--port").and_then(parse_port_value);

        let env_bind = env("CLASSGATE_BIND").and_then(|v| v.trim().parse::<IpAddr>().ok());
        let arg_bind = arg_value(args, "--bind").and_then(|v| v.trim().parse::<IpAddr>().ok());

        let min_password_len = env("CLASSGATE_MIN_PASSWORD_LEN")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.min_password_len);

        let env_seed = env("CLASSGATE_SEED_DEMO").and_then(|v| parse_bool_value(&v));
        let arg_seed = if has_flag(args, "--seed-demo") { Some(true) } else { None };

        let confirm_timeout = env("CLASSGATE_CONFIRM_TIMEOUT_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.confirm_timeout);

        Self {
            http_port: arg_port.or(env_port).unwrap_or(defaults.http_port),
            bind: arg_bind.or(env_bind).unwrap_or(defaults.bind),
            min_password_len,
            seed_demo: arg_seed.or(env_seed).unwrap_or(defaults.seed_demo),
            confirm_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(list: &[&str]) -> Vec<String> { list.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn defaults_without_sources() {
        let cfg = GateConfig::from_sources(&[], |_| None);
        assert_eq!(cfg, GateConfig::default());
        assert_eq!(cfg.http_port, 7878);
    }

    #[test]
    fn flags_override_environment() {
        let env: HashMap<&str, &str> =
            [("CLASSGATE_HTTP_PORT", "9000"), ("CLASSGATE_SEED_DEMO", "no"), ("CLASSGATE_BIND", "0.0.0.0")].into();
        let cfg = GateConfig::from_sources(&args(&["classgate", "--port", "9100", "--seed-demo"]), |k| {
            env.get(k).map(|v| v.to_string())
        });
        assert_eq!(cfg.http_port, 9100);
        assert!(cfg.seed_demo);
        assert_eq!(cfg.bind, IpAddr::from([0, 0, 0, 0]));
    }

    #[test]
    fn bad_values_fall_back() {
        let env: HashMap<&str, &str> =
            [("CLASSGATE_HTTP_PORT", "http"), ("CLASSGATE_MIN_PASSWORD_LEN", "0"), ("CLASSGATE_SEED_DEMO", "maybe")].into();
        let cfg = GateConfig::from_sources(&args(&["classgate", "--port"]), |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(cfg.min_password_len, DEFAULT_MIN_PASSWORD_LEN);
        assert!(!cfg.seed_demo);
    }
}
