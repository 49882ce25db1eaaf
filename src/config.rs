use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::{
    error::{AppErr, AppResult},
    pump::Heartbeat,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr:         String,
    pub static_dir:        PathBuf,
    pub heartbeat:         Heartbeat,
    pub outbound_capacity: usize,
    pub max_message_size:  usize,
    pub token_ttl:         Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".into(),
            static_dir: "static".into(),
            heartbeat: Heartbeat::default(),
            outbound_capacity: 512,
            max_message_size: 512,
            token_ttl: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Reads the process environment (after `dotenvy`).
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let d = Self::default();
        let secs = |key: &str, fallback: Duration| -> AppResult<Duration> {
            parse(&get, key, fallback.as_secs()).map(Duration::from_secs)
        };

        let cfg = Self {
            bind_addr: get("BIND_ADDR").unwrap_or(d.bind_addr),
            static_dir: get("STATIC_DIR").map(PathBuf::from).unwrap_or(d.static_dir),
            heartbeat: Heartbeat {
                ping_period: secs("PING_PERIOD_SECS", d.heartbeat.ping_period)?,
                pong_wait: secs("PONG_WAIT_SECS", d.heartbeat.pong_wait)?,
                write_wait: secs("WRITE_WAIT_SECS", d.heartbeat.write_wait)?,
            },
            outbound_capacity: parse(&get, "OUTBOUND_CAPACITY", d.outbound_capacity)?,
            max_message_size: parse(&get, "MAX_MESSAGE_SIZE", d.max_message_size)?,
            token_ttl: secs("TOKEN_TTL_SECS", d.token_ttl)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> AppResult<()> {
        let hb = &self.heartbeat;
        if hb.ping_period.is_zero() || hb.write_wait.is_zero() || self.token_ttl.is_zero() {
            return Err(AppErr::Config("durations must be positive".into()));
        }
        if hb.ping_period >= hb.pong_wait {
            return Err(AppErr::Config("PING_PERIOD_SECS must be less than PONG_WAIT_SECS".into()));
        }
        if self.outbound_capacity == 0 || self.max_message_size == 0 {
            return Err(AppErr::Config("sizes must be positive".into()));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, fallback: T) -> AppResult<T>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(fallback),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppErr::Config(format!("{key}={raw}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> AppResult<Config> {
        let env: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.heartbeat, Heartbeat::default());
        assert_eq!(cfg.outbound_capacity, 512);
        assert_eq!(cfg.token_ttl, Duration::from_secs(300));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = load(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("STATIC_DIR", "/data/static"),
            ("PING_PERIOD_SECS", "5"),
            ("PONG_WAIT_SECS", "8"),
            ("OUTBOUND_CAPACITY", " 16 "),
        ])
        .unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.static_dir, PathBuf::from("/data/static"));
        assert_eq!(cfg.heartbeat.ping_period, Duration::from_secs(5));
        assert_eq!(cfg.heartbeat.pong_wait, Duration::from_secs(8));
        assert_eq!(cfg.outbound_capacity, 16);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(load(&[("OUTBOUND_CAPACITY", "lots")]), Err(AppErr::Config(_))));
        assert!(matches!(load(&[("OUTBOUND_CAPACITY", "0")]), Err(AppErr::Config(_))));
        assert!(matches!(load(&[("PING_PERIOD_SECS", "60")]), Err(AppErr::Config(_))));
        assert!(matches!(load(&[("WRITE_WAIT_SECS", "0")]), Err(AppErr::Config(_))));
    }
}
