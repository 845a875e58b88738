use std::time::Duration;

use crate::protocol::MAX_USER_ID_LEN;

pub const DEFAULT_IP: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct Config {
    /// 监听地址，可以是 IP 或主机名
    pub ip: String,
    pub port: u16,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// 一个方向关闭后，等待另一个方向的时长
    pub grace_period: Duration,
    pub max_user_id_len: usize,
    /// None 表示不限制
    pub max_connections: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ip: DEFAULT_IP.to_string(),
            port: DEFAULT_PORT,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
            max_user_id_len: MAX_USER_ID_LEN,
            max_connections: None,
        }
    }
}
