use anyhow::{anyhow, Context, Result};
use std::future;
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::net::TcpStream;

/// 连接目标服务器，只尝试一次。
pub async fn connect(target: SocketAddrV4, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
        .await
        .map_err(|_| anyhow!("连接目标服务器超时: {} ({:?})", target, timeout))?
        .with_context(|| format!("连接目标服务器失败: {}", target))?;

    stream.set_nodelay(true)?;
    Ok(stream)
}

/// 客户端连接出错（如被重置）时返回。
///
/// 读到 EOF 只说明客户端关闭了写方向（半关闭），仍然要等连接结果并回复；
/// 提前发送的数据同样留给转发阶段处理。这两种情况都不会返回。
pub async fn client_closed(client: &TcpStream) {
    let mut probe = [0u8; 1];
    match client.peek(&mut probe).await {
        Err(_) => {}
        Ok(_) => future::pending().await,
    }
}
