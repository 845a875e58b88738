use anyhow::{bail, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};

pub const SOCKS_VERSION: u8 = 0x04;
pub const CONNECT_COMMAND: u8 = 0x01;

pub const REPLY_VERSION: u8 = 0x00;
pub const REQUEST_GRANTED: u8 = 0x5A;
pub const REQUEST_REJECTED: u8 = 0x5B;

/// VER + CMD + DSTPORT + DSTIP
pub const HEADER_LEN: usize = 8;
pub const REPLY_LEN: usize = 8;
pub const MAX_USER_ID_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks4Request {
    pub port: u16,
    pub ip: Ipv4Addr,
    pub user_id: Vec<u8>,
}

impl Socks4Request {
    pub fn target(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }

    /// 从缓冲区解析一个完整的请求。
    ///
    /// 数据不足时返回 `Ok(None)`，调用方继续读取；版本号、命令或 user-id
    /// 长度不合法时返回错误。解析成功后请求占用的字节会从 `buf` 中移除，
    /// 之后的字节（客户端提前发送的负载）保留在缓冲区中。
    pub fn decode(buf: &mut BytesMut, max_user_id: usize) -> Result<Option<Self>> {
        if let Some(&version) = buf.first() {
            if version != SOCKS_VERSION {
                bail!("不支持的SOCKS版本: {}", version);
            }
        }
        if let Some(&command) = buf.get(1) {
            if command != CONNECT_COMMAND {
                bail!("不支持的命令: {}", command);
            }
        }
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let user_id_area = &buf[HEADER_LEN..];
        let scan_len = user_id_area.len().min(max_user_id + 1);
        let nul = match user_id_area[..scan_len].iter().position(|&b| b == 0) {
            Some(pos) => pos,
            None if user_id_area.len() > max_user_id => {
                bail!("user-id 超过最大长度 {} 字节", max_user_id);
            }
            None => return Ok(None),
        };

        let mut frame = buf.split_to(HEADER_LEN + nul + 1);
        frame.advance(2);
        let port = frame.get_u16();
        let ip = Ipv4Addr::from(frame.get_u32());
        let user_id = frame[..nul].to_vec();

        Ok(Some(Self { port, ip, user_id }))
    }
}

/// 请求头已经读满 8 字节时取出目标地址，供拒绝回复回显。
///
/// 不检查命令字节，不消耗缓冲区。版本号不对时返回 None。
pub fn header_target(buf: &[u8]) -> Option<SocketAddrV4> {
    if buf.len() < HEADER_LEN || buf[0] != SOCKS_VERSION {
        return None;
    }
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
    Some(SocketAddrV4::new(ip, port))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Granted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socks4Reply {
    pub status: ReplyStatus,
    pub port: u16,
    pub ip: Ipv4Addr,
}

impl Socks4Reply {
    pub fn granted(target: SocketAddrV4) -> Self {
        Self {
            status: ReplyStatus::Granted,
            port: target.port(),
            ip: *target.ip(),
        }
    }

    /// 请求没能解析出目标地址时，端口和地址填 0。
    pub fn rejected(target: Option<SocketAddrV4>) -> Self {
        let target = target.unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        Self {
            status: ReplyStatus::Rejected,
            port: target.port(),
            ip: *target.ip(),
        }
    }

    pub fn encode(&self) -> [u8; REPLY_LEN] {
        let status = match self.status {
            ReplyStatus::Granted => REQUEST_GRANTED,
            ReplyStatus::Rejected => REQUEST_REJECTED,
        };

        let mut out = BytesMut::with_capacity(REPLY_LEN);
        out.put_u8(REPLY_VERSION);
        out.put_u8(status);
        out.put_u16(self.port);
        out.put_slice(&self.ip.octets());

        let mut reply = [0u8; REPLY_LEN];
        reply.copy_from_slice(&out);
        reply
    }
}
