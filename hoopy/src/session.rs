use anyhow::{Context, Result};
use bytes::BytesMut;
use log::{debug, error, info, warn};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::{io::AsyncWriteExt, net::TcpStream};
use uuid::Uuid;

use crate::config::Config;
use crate::connector;
use crate::handshake;
use crate::protocol::{self, Socks4Reply};
use crate::relay::{self, RelayStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingRequest,
    Validating,
    Connecting,
    Relaying,
    Rejected,
    Closed,
}

/// 会话的结束方式（出错之外）
#[derive(Debug)]
enum Outcome {
    /// 客户端在握手或连接目标期间断开
    ClientGone,
    Relayed(RelayStats),
}

/// 一个客户端连接从握手到关闭的完整生命周期。
///
/// 两个连接都由会话持有，任何路径退出时随 drop 关闭。
pub struct Session {
    id: String,
    peer: SocketAddr,
    client: TcpStream,
    state: SessionState,
    target: Option<SocketAddrV4>,
    config: Arc<Config>,
}

impl Session {
    pub fn new(client: TcpStream, peer: SocketAddr, config: Arc<Config>) -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);

        Self {
            id,
            peer,
            client,
            state: SessionState::AwaitingRequest,
            target: None,
            config,
        }
    }

    /// 运行会话直到结束。错误在这里记录，不会传给监听循环。
    pub async fn run(mut self) {
        match self.serve().await {
            Ok(Outcome::Relayed(stats)) => {
                info!(
                    "[{}] {} -> {} 连接结束，上行 {} 字节，下行 {} 字节",
                    self.id,
                    self.peer,
                    self.target_display(),
                    stats.client_to_upstream,
                    stats.upstream_to_client
                );
            }
            Ok(Outcome::ClientGone) => {
                debug!("[{}] 客户端 {} 在 {:?} 阶段断开", self.id, self.peer, self.state);
            }
            Err(e) if self.state == SessionState::Rejected => {
                warn!("[{}] 拒绝来自 {} 的请求: {:#}", self.id, self.peer, e);
            }
            Err(e) => {
                error!("[{}] 处理连接时出错 ({} -> {}): {:#}", self.id, self.peer, self.target_display(), e);
            }
        }
        self.transition(SessionState::Closed);
    }

    async fn serve(&mut self) -> Result<Outcome> {
        if let Err(e) = self.client.set_nodelay(true) {
            debug!("[{}] 设置 TCP_NODELAY 失败: {}", self.id, e);
        }

        let mut buf = BytesMut::with_capacity(64);
        let request = match handshake::read_request(
            &mut self.client,
            &mut buf,
            self.config.max_user_id_len,
            self.config.handshake_timeout,
        )
        .await
        {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(Outcome::ClientGone),
            Err(e) => {
                self.target = protocol::header_target(&buf);
                return Err(self.reject(e).await);
            }
        };

        self.transition(SessionState::Validating);
        let target = request.target();
        self.target = Some(target);
        debug!(
            "[{}] 请求目标 {}，user-id {:?}",
            self.id,
            target,
            String::from_utf8_lossy(&request.user_id)
        );

        self.transition(SessionState::Connecting);
        let connected = tokio::select! {
            result = connector::connect(target, self.config.connect_timeout) => Some(result),
            _ = connector::client_closed(&self.client) => None,
        };
        let mut upstream = match connected {
            Some(Ok(upstream)) => upstream,
            Some(Err(e)) => return Err(self.reject(e).await),
            None => return Ok(Outcome::ClientGone),
        };

        self.client
            .write_all(&Socks4Reply::granted(target).encode())
            .await
            .context("发送成功响应失败")?;
        info!("[{}] {} -> {} 连接已建立", self.id, self.peer, target);

        // 客户端没等回复就发送的数据
        if !buf.is_empty() {
            upstream
                .write_all(&buf)
                .await
                .context("转发握手后的数据失败")?;
        }

        self.transition(SessionState::Relaying);
        let mut stats = relay::relay(&mut self.client, &mut upstream, self.config.grace_period).await?;
        stats.client_to_upstream += buf.len() as u64;

        Ok(Outcome::Relayed(stats))
    }

    /// 回复拒绝，原始错误原样返回
    async fn reject(&mut self, cause: anyhow::Error) -> anyhow::Error {
        self.transition(SessionState::Rejected);

        let reply = Socks4Reply::rejected(self.target).encode();
        if let Err(e) = self.client.write_all(&reply).await {
            debug!("[{}] 发送拒绝响应失败: {}", self.id, e);
        }
        cause
    }

    fn transition(&mut self, next: SessionState) {
        debug!("[{}] {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    fn target_display(&self) -> String {
        self.target
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}
