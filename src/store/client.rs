use crate::error::{CounterError, CounterResult};
use crate::store::resp::{encode_command, RespError, RespReader, RespValue};
use crate::store::ShardClient;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

pub const DEFAULT_PORT: u16 = 6379;

/// Where a shard lives and how to log in to it.
///
/// Accepts `redis://[:password@]host[:port][/db]` or a bare `host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAddress {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: Option<u32>,
}

impl FromStr for ShardAddress {
    type Err = CounterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| {
            CounterError::InvalidArgument(format!("Invalid shard address '{}': {}", s, reason))
        };

        let rest = match s.split_once("://") {
            Some(("redis", rest)) => rest,
            Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme '{}'", scheme))),
            None => s,
        };

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, Some(path)),
            None => (rest, None),
        };

        let (password, host_port) = match authority.rsplit_once('@') {
            Some((userinfo, host_port)) => {
                let password = userinfo
                    .split_once(':')
                    .map(|(_, pass)| pass)
                    .unwrap_or(userinfo);
                let password = (!password.is_empty()).then(|| password.to_string());
                (password, host_port)
            }
            None => (None, authority),
        };

        let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => Some(port),
                None if tail.is_empty() => None,
                None => return Err(invalid("unexpected characters after IPv6 literal")),
            };
            (host, port)
        } else {
            match host_port.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (host_port, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| invalid(&format!("invalid port '{}'", port)))?,
            None => DEFAULT_PORT,
        };
        let db = match path.filter(|p| !p.is_empty()) {
            Some(db) => Some(
                db.parse::<u32>()
                    .map_err(|_| invalid(&format!("invalid database '{}'", db)))?,
            ),
            None => None,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            password,
            db,
        })
    }
}

impl fmt::Display for ShardAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Settings shared by every shard connection.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bound on a single operation, connect included
    pub timeout: Duration,
    /// Password used when the address does not carry one
    pub password: Option<String>,
    /// Database selected when the address does not name one
    pub db: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            password: None,
            db: 0,
        }
    }
}

struct Connection {
    reader: RespReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn call(&mut self, args: &[&[u8]]) -> Result<RespValue, RespError> {
        self.writer.write_all(&encode_command(args)).await?;
        self.reader.read_reply().await
    }
}

/// Persistent RESP connection to one shard.
///
/// The connection is opened on first use and kept for the life of the client.
/// Operations on one client are serialized. The connection goes back into the
/// client only once a reply has been read. Any other outcome drops it, including
/// a caller abandoning the operation part way, so the next operation starts on
/// a clean stream rather than reading a reply meant for an abandoned request.
pub struct RespClient {
    shard: String,
    address: ShardAddress,
    password: Option<String>,
    db: u32,
    timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl RespClient {
    /// Create a client for `shard`. No connection is made until first use.
    pub fn new(shard: &str, options: &ClientOptions) -> CounterResult<Self> {
        let address: ShardAddress = shard.parse()?;
        let password = address.password.clone().or_else(|| options.password.clone());
        let db = address.db.unwrap_or(options.db);

        Ok(Self {
            shard: shard.to_string(),
            address,
            password,
            db,
            timeout: options.timeout,
            conn: Mutex::new(None),
        })
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    pub fn address(&self) -> &ShardAddress {
        &self.address
    }

    /// Whether a connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn connect(&self) -> CounterResult<Connection> {
        let stream = TcpStream::connect((self.address.host.as_str(), self.address.port))
            .await
            .map_err(|e| CounterError::store_unavailable(&self.shard, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| CounterError::store_unavailable(&self.shard, e))?;

        let (read_half, write_half) = stream.into_split();
        let mut conn = Connection {
            reader: RespReader::new(read_half),
            writer: write_half,
        };

        if let Some(password) = &self.password {
            let reply = conn
                .call(&[b"AUTH", password.as_bytes()])
                .await
                .map_err(|e| self.map_resp_error(e))?;
            self.expect_ok("AUTH", reply)?;
        }
        if self.db != 0 {
            let db = self.db.to_string();
            let reply = conn
                .call(&[b"SELECT", db.as_bytes()])
                .await
                .map_err(|e| self.map_resp_error(e))?;
            self.expect_ok("SELECT", reply)?;
        }

        debug!(shard = %self.shard, address = %self.address, "Connected to shard");
        Ok(conn)
    }

    /// Send one command and wait for its reply, bounded by the client timeout.
    async fn execute(&self, args: &[&[u8]]) -> CounterResult<RespValue> {
        let mut slot = self.conn.lock().await;
        // Out of the slot until the reply is read, so a dropped call takes
        // the half-used stream with it
        let idle = slot.take();

        let result = tokio::time::timeout(self.timeout, async {
            let mut conn = match idle {
                Some(conn) => conn,
                None => self.connect().await?,
            };
            let reply = conn.call(args).await.map_err(|e| self.map_resp_error(e))?;
            Ok::<_, CounterError>((conn, reply))
        })
        .await;

        match result {
            Ok(Ok((conn, reply))) => {
                *slot = Some(conn);
                Ok(reply)
            }
            Ok(Err(e)) => {
                warn!(shard = %self.shard, error = %e, "Shard operation failed");
                Err(e)
            }
            Err(_) => {
                warn!(
                    shard = %self.shard,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Shard operation timed out"
                );
                Err(CounterError::store_unavailable(
                    &self.shard,
                    format!("timed out after {}ms", self.timeout.as_millis()),
                ))
            }
        }
    }

    fn map_resp_error(&self, err: RespError) -> CounterError {
        if err.is_connection_error() {
            CounterError::store_unavailable(&self.shard, err)
        } else {
            CounterError::store_error(&self.shard, err)
        }
    }

    fn expect_ok(&self, command: &str, reply: RespValue) -> CounterResult<()> {
        match reply {
            RespValue::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
            RespValue::Error(e) => Err(CounterError::store_error(
                &self.shard,
                format!("{} rejected: {}", command, String::from_utf8_lossy(&e)),
            )),
            other => Err(self.unexpected(command, &other)),
        }
    }

    fn unexpected(&self, command: &str, reply: &RespValue) -> CounterError {
        CounterError::store_error(
            &self.shard,
            format!("unexpected {} reply to {}", reply.kind(), command),
        )
    }
}

#[async_trait]
impl ShardClient for RespClient {
    #[instrument(skip(self), fields(shard = %self.shard))]
    async fn incr_by(&self, key: &str, amount: i64) -> CounterResult<i64> {
        let amount = amount.to_string();
        match self
            .execute(&[b"INCRBY", key.as_bytes(), amount.as_bytes()])
            .await?
        {
            RespValue::Integer(total) => Ok(total),
            RespValue::Error(e) => Err(CounterError::store_error(
                &self.shard,
                String::from_utf8_lossy(&e),
            )),
            other => Err(self.unexpected("INCRBY", &other)),
        }
    }

    #[instrument(skip(self), fields(shard = %self.shard))]
    async fn get(&self, key: &str) -> CounterResult<Option<i64>> {
        match self.execute(&[b"GET", key.as_bytes()]).await? {
            RespValue::Null => Ok(None),
            RespValue::BulkString(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|text| text.parse::<i64>().ok())
                .map(Some)
                .ok_or_else(|| {
                    CounterError::store_error(
                        &self.shard,
                        format!("value of {} is not an integer", key),
                    )
                }),
            RespValue::Error(e) => Err(CounterError::store_error(
                &self.shard,
                String::from_utf8_lossy(&e),
            )),
            other => Err(self.unexpected("GET", &other)),
        }
    }

    async fn ping(&self) -> CounterResult<()> {
        match self.execute(&[b"PING"]).await? {
            RespValue::SimpleString(s) if s.as_ref() == b"PONG" => Ok(()),
            RespValue::Error(e) => Err(CounterError::store_error(
                &self.shard,
                String::from_utf8_lossy(&e),
            )),
            other => Err(self.unexpected("PING", &other)),
        }
    }
}
