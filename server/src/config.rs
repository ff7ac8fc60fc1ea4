//! Relay configuration, loaded from environment variables with the
//! teacher's defaults-first style (`std::env::var("DB")`) rather than a
//! config-file framework.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

pub struct Config {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max_requests: u32,
    pub freshness_window_millis: i64,
}

impl Config {
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("BIND_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from((IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080)));

        let db_path = if let Ok(db_dir) = std::env::var("DB") {
            [&db_dir, "moltdm.db3"].iter().collect()
        } else {
            let dirs = directories::BaseDirs::new().expect("home directory should resolve");
            let mut buf = PathBuf::from(dirs.data_dir());
            buf.push("moltdm");
            std::fs::create_dir_all(&buf).expect("create data dir");
            buf.push("moltdm_server.db3");
            buf
        };

        let rate_limit_window_secs = std::env::var("RATE_LIMIT_WINDOW_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);
        let rate_limit_max_requests = std::env::var("RATE_LIMIT_MAX_REQUESTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);
        let freshness_window_millis = std::env::var("FRESHNESS_WINDOW_MILLIS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(protocol::auth::FRESHNESS_WINDOW_MILLIS);

        Config {
            bind_addr,
            db_path,
            rate_limit_window_secs,
            rate_limit_max_requests,
            freshness_window_millis,
        }
    }
}
