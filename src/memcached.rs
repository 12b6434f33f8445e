//! Memcached binary protocol client
//!
//! Speaks the memcached binary protocol over plain TCP to one or more
//! servers. Keys are routed with a libketama-compatible consistent-hash
//! ring so every client instance sends a given key to the same node.
//!
//! Connections are opened lazily, use `TCP_NODELAY`, and are bounded by a
//! connect timeout and a per-request I/O timeout. There are no retries: a
//! failed exchange drops the connection and the next call reconnects.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::remote::{RemoteCache, ServerStats, Stats};

pub const DEFAULT_PORT: u16 = 11211;

/// Longest key the server accepts
pub const MAX_KEY_LEN: usize = 250;

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;
const HEADER_LEN: usize = 24;

/// Largest frame body accepted from a peer: a default-sized (1 MiB) item
/// plus its key and extras
const MAX_BODY_LEN: usize = (1 << 20) + MAX_KEY_LEN + u8::MAX as usize;

/// Counter expiration that makes incr/decr fail on a missing key
const COUNTER_NO_CREATE: u32 = 0xffff_ffff;

/// Ketama points derived from one md5 digest, and digests per server
const POINTS_PER_HASH: usize = 4;
const HASHES_PER_SERVER: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    Stat = 0x10,
}

pub(crate) mod status {
    pub const OK: u16 = 0x0000;
    pub const KEY_NOT_FOUND: u16 = 0x0001;
    pub const KEY_EXISTS: u16 = 0x0002;
    pub const VALUE_TOO_LARGE: u16 = 0x0003;
    pub const INVALID_ARGUMENTS: u16 = 0x0004;
    pub const NOT_STORED: u16 = 0x0005;
    pub const NON_NUMERIC: u16 = 0x0006;
    pub const UNKNOWN_COMMAND: u16 = 0x0081;
    pub const OUT_OF_MEMORY: u16 = 0x0082;

    pub fn describe(code: u16) -> &'static str {
        match code {
            OK => "no error",
            KEY_NOT_FOUND => "key not found",
            KEY_EXISTS => "key exists",
            VALUE_TOO_LARGE => "value too large",
            INVALID_ARGUMENTS => "invalid arguments",
            NOT_STORED => "item not stored",
            NON_NUMERIC => "incr/decr on non-numeric value",
            UNKNOWN_COMMAND => "unknown command",
            OUT_OF_MEMORY => "out of memory",
            _ => "unrecognized status",
        }
    }
}

/// One binary protocol frame, request or response.
///
/// `status` carries the vbucket id on requests and the status code on
/// responses; the wire layout is the same.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Packet {
    pub magic: u8,
    pub opcode: u8,
    pub status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Packet {
    pub(crate) fn request(opcode: Opcode, extras: Bytes, key: Bytes, value: Bytes) -> Self {
        Self {
            magic: MAGIC_REQUEST,
            opcode: opcode as u8,
            status: 0,
            opaque: 0,
            cas: 0,
            extras,
            key,
            value,
        }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let body_len = self.extras.len() + self.key.len() + self.value.len();
        dst.reserve(HEADER_LEN + body_len);
        dst.put_u8(self.magic);
        dst.put_u8(self.opcode);
        dst.put_u16(self.key.len() as u16);
        dst.put_u8(self.extras.len() as u8);
        dst.put_u8(0);
        dst.put_u16(self.status);
        dst.put_u32(body_len as u32);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
        dst.put_slice(&self.extras);
        dst.put_slice(&self.key);
        dst.put_slice(&self.value);
    }

    /// Read one frame, either direction.
    pub(crate) async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> Result<Self, RemoteError> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let mut h = &header[..];

        let magic = h.get_u8();
        if magic != MAGIC_REQUEST && magic != MAGIC_RESPONSE {
            return Err(RemoteError::Protocol(format!("bad magic byte {:#04x}", magic)));
        }
        let opcode = h.get_u8();
        let key_len = h.get_u16() as usize;
        let extras_len = h.get_u8() as usize;
        let _data_type = h.get_u8();
        let status = h.get_u16();
        let body_len = h.get_u32() as usize;
        let opaque = h.get_u32();
        let cas = h.get_u64();

        if extras_len + key_len > body_len {
            return Err(RemoteError::Protocol(format!(
                "body length {} shorter than extras {} + key {}",
                body_len, extras_len, key_len
            )));
        }
        if body_len > MAX_BODY_LEN {
            return Err(RemoteError::Protocol(format!(
                "body length {} exceeds {}",
                body_len, MAX_BODY_LEN
            )));
        }

        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await?;
        let mut body = Bytes::from(body);
        let extras = body.split_to(extras_len);
        let key = body.split_to(key_len);

        Ok(Self {
            magic,
            opcode,
            status,
            opaque,
            cas,
            extras,
            key,
            value: body,
        })
    }
}

fn set_extras(flags: u32, expiration: u32) -> Bytes {
    let mut b = BytesMut::with_capacity(8);
    b.put_u32(flags);
    b.put_u32(expiration);
    b.freeze()
}

fn counter_extras(delta: u64) -> Bytes {
    let mut b = BytesMut::with_capacity(20);
    b.put_u64(delta);
    b.put_u64(0);
    b.put_u32(COUNTER_NO_CREATE);
    b.freeze()
}

/// libketama-compatible continuum.
#[derive(Debug, Clone)]
pub(crate) struct KetamaRing {
    points: Vec<(u32, usize)>,
}

impl KetamaRing {
    pub(crate) fn new(servers: &[String]) -> Self {
        let mut points = Vec::with_capacity(servers.len() * HASHES_PER_SERVER * POINTS_PER_HASH);
        for (idx, server) in servers.iter().enumerate() {
            let label = ketama_label(server);
            for i in 0..HASHES_PER_SERVER {
                let digest = md5::compute(format!("{}-{}", label, i));
                for h in 0..POINTS_PER_HASH {
                    let mut chunk = [0u8; 4];
                    chunk.copy_from_slice(&digest.0[h * 4..h * 4 + 4]);
                    points.push((u32::from_le_bytes(chunk), idx));
                }
            }
        }
        points.sort_unstable();
        Self { points }
    }

    /// Index of the server owning `key`.
    pub(crate) fn node_for(&self, key: &str) -> usize {
        let hash = ketama_hash(key);
        let pos = self.points.partition_point(|(p, _)| *p < hash);
        match self.points.get(pos).or_else(|| self.points.first()) {
            Some((_, idx)) => *idx,
            None => 0,
        }
    }
}

fn ketama_hash(key: &str) -> u32 {
    let digest = md5::compute(key.as_bytes());
    u32::from_le_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]])
}

/// Continuum label for a server; the default port is left out.
fn ketama_label(server: &str) -> &str {
    server.strip_suffix(":11211").unwrap_or(server)
}

fn normalize_addr(server: &str) -> String {
    let server = server.trim();
    match server.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => server.to_owned(),
        _ => format!("{}:{}", server, DEFAULT_PORT),
    }
}

struct Connection {
    stream: BufStream<TcpStream>,
    next_opaque: u32,
}

impl Connection {
    async fn open(addr: &str, connect_timeout: Duration) -> Result<Self, RemoteError> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RemoteError::Timeout(connect_timeout))??;
        stream.set_nodelay(true)?;
        debug!("memcached: connected to {}", addr);
        Ok(Self {
            stream: BufStream::new(stream),
            next_opaque: 0,
        })
    }

    /// Send one request and read its response frames. STAT replies are
    /// terminated by a frame with an empty key.
    async fn exchange(&mut self, mut request: Packet) -> Result<Vec<Packet>, RemoteError> {
        self.next_opaque = self.next_opaque.wrapping_add(1);
        request.opaque = self.next_opaque;

        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        let mut replies = Vec::new();
        loop {
            let reply = Packet::read_from(&mut self.stream).await?;
            if reply.magic != MAGIC_RESPONSE || reply.opaque != request.opaque {
                return Err(RemoteError::Protocol(format!(
                    "unexpected frame (magic {:#04x}, opaque {}) for request {}",
                    reply.magic, reply.opaque, request.opaque
                )));
            }
            let done = request.opcode != Opcode::Stat as u8
                || reply.key.is_empty()
                || reply.status != status::OK;
            replies.push(reply);
            if done {
                return Ok(replies);
            }
        }
    }
}

struct Server {
    addr: String,
    conn: Mutex<Option<Connection>>,
}

/// Remote tier backed by one or more memcached servers.
pub struct MemcachedRemote {
    servers: Vec<Server>,
    ring: KetamaRing,
    connect_timeout: Duration,
    io_timeout: Duration,
    requests: AtomicU32,
}

impl MemcachedRemote {
    /// Client for `servers` (`host` or `host:port`). No connection is made
    /// until the first request.
    pub fn new(
        servers: &[String],
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        if servers.is_empty() {
            return Err(RemoteError::NoServers);
        }
        let addrs: Vec<String> = servers.iter().map(|s| normalize_addr(s)).collect();
        info!("memcached: configured servers {:?}", addrs);
        Ok(Self {
            ring: KetamaRing::new(&addrs),
            servers: addrs
                .into_iter()
                .map(|addr| Server {
                    addr,
                    conn: Mutex::new(None),
                })
                .collect(),
            connect_timeout,
            io_timeout,
            requests: AtomicU32::new(0),
        })
    }

    /// Address of the server a key is routed to
    pub fn server_for(&self, key: &str) -> &str {
        &self.servers[self.node_index(key)].addr
    }

    /// Requests sent so far, across all servers
    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::Relaxed)
    }

    fn node_index(&self, key: &str) -> usize {
        if self.servers.len() == 1 {
            0
        } else {
            self.ring.node_for(key)
        }
    }

    fn keyed(&self, key: &str) -> Result<&Server, RemoteError> {
        if key.len() > MAX_KEY_LEN {
            return Err(RemoteError::KeyTooLong(key.len()));
        }
        Ok(&self.servers[self.node_index(key)])
    }

    async fn call(&self, server: &Server, request: Packet) -> Result<Vec<Packet>, RemoteError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let mut slot = server.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => Connection::open(&server.addr, self.connect_timeout).await?,
        };

        let outcome = timeout(self.io_timeout, conn.exchange(request)).await;
        match outcome {
            Ok(Ok(replies)) => {
                *slot = Some(conn);
                Ok(replies)
            }
            Ok(Err(e)) => {
                warn!("memcached: dropping connection to {}: {}", server.addr, e);
                Err(e)
            }
            Err(_) => {
                warn!("memcached: request to {} timed out", server.addr);
                Err(RemoteError::Timeout(self.io_timeout))
            }
        }
    }

    async fn call_one(&self, server: &Server, request: Packet) -> Result<Packet, RemoteError> {
        self.call(server, request)
            .await?
            .pop()
            .ok_or_else(|| RemoteError::Protocol("empty reply".to_owned()))
    }

    async fn counter(
        &self,
        opcode: Opcode,
        key: &str,
        delta: u64,
    ) -> Result<Option<u64>, RemoteError> {
        let server = self.keyed(key)?;
        let request = Packet::request(
            opcode,
            counter_extras(delta),
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::new(),
        );
        let reply = self.call_one(server, request).await?;
        match reply.status {
            status::OK => {
                let mut value = reply.value;
                if value.len() != 8 {
                    return Err(RemoteError::Protocol(format!(
                        "counter reply of {} bytes",
                        value.len()
                    )));
                }
                Ok(Some(value.get_u64()))
            }
            status::KEY_NOT_FOUND => Ok(None),
            status::NON_NUMERIC => Err(RemoteError::NonNumeric),
            code => Err(status_error(server, code)),
        }
    }
}

fn status_error(server: &Server, code: u16) -> RemoteError {
    RemoteError::Status {
        server: server.addr.clone(),
        status: code,
        message: status::describe(code).to_owned(),
    }
}

#[async_trait]
impl RemoteCache for MemcachedRemote {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, RemoteError> {
        let server = self.keyed(key)?;
        let request = Packet::request(
            Opcode::Get,
            Bytes::new(),
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::new(),
        );
        let reply = self.call_one(server, request).await?;
        match reply.status {
            status::OK => Ok(Some(reply.value)),
            status::KEY_NOT_FOUND => Ok(None),
            code => Err(status_error(server, code)),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl_secs: u32) -> Result<(), RemoteError> {
        let server = self.keyed(key)?;
        let request = Packet::request(
            Opcode::Set,
            set_extras(0, ttl_secs),
            Bytes::copy_from_slice(key.as_bytes()),
            value,
        );
        let reply = self.call_one(server, request).await?;
        match reply.status {
            status::OK => Ok(()),
            code => Err(status_error(server, code)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
        let server = self.keyed(key)?;
        let request = Packet::request(
            Opcode::Delete,
            Bytes::new(),
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::new(),
        );
        let reply = self.call_one(server, request).await?;
        match reply.status {
            status::OK => Ok(true),
            status::KEY_NOT_FOUND => Ok(false),
            code => Err(status_error(server, code)),
        }
    }

    async fn increment(&self, key: &str, delta: u64) -> Result<Option<u64>, RemoteError> {
        self.counter(Opcode::Increment, key, delta).await
    }

    async fn decrement(&self, key: &str, delta: u64) -> Result<Option<u64>, RemoteError> {
        self.counter(Opcode::Decrement, key, delta).await
    }

    async fn flush(&self) -> Result<(), RemoteError> {
        let mut first_err = None;
        for server in &self.servers {
            let request = Packet::request(Opcode::Flush, Bytes::new(), Bytes::new(), Bytes::new());
            let outcome = match self.call_one(server, request).await {
                Ok(reply) if reply.status == status::OK => Ok(()),
                Ok(reply) => Err(status_error(server, reply.status)),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                warn!("memcached: flush failed on {}: {}", server.addr, e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn stats(&self) -> Result<Stats, RemoteError> {
        let mut stats = Stats::new();
        let mut last_err = None;
        for server in &self.servers {
            let request = Packet::request(Opcode::Stat, Bytes::new(), Bytes::new(), Bytes::new());
            match self.call(server, request).await {
                Ok(replies) => {
                    let mut entry = ServerStats::new();
                    for reply in replies {
                        if reply.status != status::OK {
                            last_err = Some(status_error(server, reply.status));
                            break;
                        }
                        if reply.key.is_empty() {
                            continue;
                        }
                        entry.insert(
                            String::from_utf8_lossy(&reply.key).into_owned(),
                            String::from_utf8_lossy(&reply.value).into_owned(),
                        );
                    }
                    stats.insert(server.addr.clone(), entry);
                }
                Err(e) => {
                    warn!("memcached: stats failed on {}: {}", server.addr, e);
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if stats.is_empty() => Err(e),
            _ => Ok(stats),
        }
    }

    async fn quit(&self) -> Result<(), RemoteError> {
        for server in &self.servers {
            let Some(mut conn) = server.conn.lock().await.take() else {
                continue;
            };
            let request = Packet::request(Opcode::Quit, Bytes::new(), Bytes::new(), Bytes::new());
            match timeout(self.io_timeout, conn.exchange(request)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("memcached: quit on {} failed: {}", server.addr, e),
                Err(_) => debug!("memcached: quit on {} timed out", server.addr),
            }
            if let Err(e) = conn.stream.shutdown().await {
                debug!("memcached: shutdown of {} failed: {}", server.addr, e);
            }
            info!("memcached: closed connection to {}", server.addr);
        }
        Ok(())
    }
}
