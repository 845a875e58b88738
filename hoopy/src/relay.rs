use anyhow::{Context, Result};
use log::debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

const BUFFER_SIZE: usize = 8192;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// 在客户端和目标服务器之间双向转发数据。
///
/// 一个方向读到 EOF 后，对另一端执行写关闭（半关闭），再给反方向
/// `grace` 时长把剩余数据发完。任意一端 I/O 出错立即结束。
pub async fn relay(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    grace: Duration,
) -> Result<RelayStats> {
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let client_to_upstream = pipe(&mut client_read, &mut upstream_write, &sent);
    let upstream_to_client = pipe(&mut upstream_read, &mut client_write, &received);
    tokio::pin!(client_to_upstream, upstream_to_client);

    tokio::select! {
        result = &mut client_to_upstream => {
            result.context("客户端到目标的数据转发出错")?;
            debug!("客户端到目标的数据传输完成，等待目标剩余数据");
            drain(upstream_to_client, grace)
                .await
                .context("目标到客户端的数据转发出错")?;
        }
        result = &mut upstream_to_client => {
            result.context("目标到客户端的数据转发出错")?;
            debug!("目标到客户端的数据传输完成，等待客户端剩余数据");
            drain(client_to_upstream, grace)
                .await
                .context("客户端到目标的数据转发出错")?;
        }
    }

    Ok(RelayStats {
        client_to_upstream: sent.load(Ordering::Relaxed),
        upstream_to_client: received.load(Ordering::Relaxed),
    })
}

async fn pipe<R, W>(reader: &mut R, writer: &mut W, copied: &AtomicU64) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }

    // 对端可能已经完全关闭，写关闭失败不影响结果
    if let Err(e) = writer.shutdown().await {
        debug!("写关闭失败: {}", e);
    }
    Ok(())
}

async fn drain<F>(remaining: Pin<&mut F>, grace: Duration) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match tokio::time::timeout(grace, remaining).await {
        Ok(result) => result,
        Err(_) => {
            debug!("半关闭等待超时 ({:?})，结束会话", grace);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// 返回 (客户端一侧, 代理持有的客户端连接)
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_relay_byte_exact_both_ways() {
        let (mut client, mut proxy_client) = socket_pair().await;
        let (mut proxy_upstream, mut origin) = socket_pair().await;

        let relay_task = tokio::spawn(async move {
            relay(&mut proxy_client, &mut proxy_upstream, Duration::from_secs(2)).await
        });

        let request: Vec<u8> = (0..=255u8).cycle().take(100_000).collect();
        let response: Vec<u8> = (0..=255u8).rev().cycle().take(300_000).collect();

        let expected_request = request.clone();
        let expected_response = response.clone();
        let origin_task = tokio::spawn(async move {
            let mut got = vec![0u8; expected_request.len()];
            origin.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected_request);
            origin.write_all(&response).await.unwrap();
            origin.shutdown().await.unwrap();
            // 客户端写关闭后应当在这里读到 EOF
            let mut rest = Vec::new();
            origin.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        });

        client.write_all(&request).await.unwrap();
        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected_response);
        client.shutdown().await.unwrap();

        origin_task.await.unwrap();
        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.client_to_upstream, 100_000);
        assert_eq!(stats.upstream_to_client, 300_000);
    }

    #[tokio::test]
    async fn test_half_close_lets_response_finish() {
        let (mut client, mut proxy_client) = socket_pair().await;
        let (mut proxy_upstream, mut origin) = socket_pair().await;

        let relay_task = tokio::spawn(async move {
            relay(&mut proxy_client, &mut proxy_upstream, Duration::from_secs(2)).await
        });

        // 客户端发完请求立即关闭写方向，类似 HTTP/1.0 客户端
        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut got = Vec::new();
        origin.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping");

        tokio::time::sleep(Duration::from_millis(50)).await;
        origin.write_all(b"pong").await.unwrap();
        drop(origin);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats, RelayStats { client_to_upstream: 4, upstream_to_client: 4 });
    }

    #[tokio::test]
    async fn test_grace_period_bounds_teardown() {
        let (mut client, mut proxy_client) = socket_pair().await;
        let (mut proxy_upstream, origin) = socket_pair().await;

        let relay_task = tokio::spawn(async move {
            relay(&mut proxy_client, &mut proxy_upstream, Duration::from_millis(100)).await
        });

        // 目标一直不回数据也不关闭
        client.shutdown().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), relay_task).await;
        assert!(result.is_ok());

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(origin);
    }
}
