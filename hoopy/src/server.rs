use anyhow::{Context, Result};
use log::{error, info};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
};

use crate::config::Config;
use crate::limit::{ConnectionLimit, ConnectionPermit};
use crate::session::Session;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server {
    listener: TcpListener,
    config: Arc<Config>,
    limit: Option<Arc<ConnectionLimit>>,
}

impl Server {
    /// 绑定监听地址，失败直接返回错误，不接受任何连接。
    pub async fn bind(config: Config) -> Result<Self> {
        let listener = TcpListener::bind((config.ip.as_str(), config.port))
            .await
            .with_context(|| format!("无法监听 {}:{}", config.ip, config.port))?;
        let limit = config.max_connections.map(ConnectionLimit::new);

        Ok(Self {
            listener,
            config: Arc::new(config),
            limit,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受连接直到 `shutdown` 完成。
    ///
    /// 关闭时立即终止所有进行中的会话，会话持有的连接随之关闭。
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("SOCKS4 代理服务器启动在 {}", self.local_addr()?);
        tokio::pin!(shutdown);

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(finished) = sessions.join_next() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("会话任务异常退出: {}", e);
                        }
                    }
                }
                (accepted, permit) = self.accept() => match accepted {
                    Ok((socket, addr)) => {
                        info!("新连接来自: {} (活跃 {})", addr, sessions.len() + 1);
                        let session = Session::new(socket, addr, self.config.clone());
                        sessions.spawn(async move {
                            session.run().await;
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!("接受连接时出错: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        info!("停止监听，终止 {} 个会话", sessions.len());
        sessions.shutdown().await;
        Ok(())
    }

    /// 有连接数上限时，先等到有空余名额再 accept。
    async fn accept(&self) -> (io::Result<(TcpStream, SocketAddr)>, Option<ConnectionPermit>) {
        let permit = match &self.limit {
            Some(limit) => match limit.try_acquire() {
                Some(permit) => Some(permit),
                None => {
                    info!("连接数达到上限 {}，暂停接受新连接", limit.active());
                    Some(limit.acquire().await)
                }
            },
            None => None,
        };
        (self.listener.accept().await, permit)
    }
}
