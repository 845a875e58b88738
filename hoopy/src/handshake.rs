use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::Socks4Request;

/// 读取并校验客户端的 SOCKS4 请求。
///
/// 客户端在请求完整之前断开时返回 `Ok(None)`，此时不需要回复。
/// 请求不合法或超时返回错误，由调用方回复拒绝。
/// 请求之后多读到的字节留在 `buf` 中。
pub async fn read_request<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_user_id: usize,
    timeout: Duration,
) -> Result<Option<Socks4Request>>
where
    R: AsyncRead + Unpin,
{
    let read = tokio::time::timeout(timeout, read_until_complete(reader, buf, max_user_id)).await;
    match read {
        Ok(result) => result,
        Err(_) => bail!("握手超时 ({:?})，已收到 {} 字节", timeout, buf.len()),
    }
}

async fn read_until_complete<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_user_id: usize,
) -> Result<Option<Socks4Request>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(request) = Socks4Request::decode(buf, max_user_id)? {
            return Ok(Some(request));
        }

        match reader.read_buf(buf).await {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof) => {
                return Ok(None);
            }
            Err(e) => return Err(e).context("读取握手请求失败"),
        }
    }
}
