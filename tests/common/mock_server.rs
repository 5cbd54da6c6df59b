//! Fake RESP shard for client and end-to-end tests
//!
//! Listens on a local port and answers the handful of commands the counter
//! client sends (`AUTH`, `SELECT`, `PING`, `GET`, `INCRBY`) from an in-memory
//! map. It can require a password, go silent or slow to provoke timeouts, and
//! record every command it receives.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use visit_counter::store::{RespReader, RespValue};

#[derive(Default)]
struct ShardState {
    values: DashMap<String, String>,
    commands: Mutex<Vec<Vec<String>>>,
    password: Option<String>,
    silent: AtomicBool,
    reply_delay_ms: AtomicU64,
}

/// A fake shard running on a local TCP port
pub struct MockShard {
    addr: SocketAddr,
    state: Arc<ShardState>,
    accept_task: JoinHandle<()>,
}

impl MockShard {
    /// Start a shard that accepts every client
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    /// Start a shard that only serves clients after `AUTH password`
    pub async fn start_with_password(password: &str) -> Self {
        Self::start_with(Some(password.to_string())).await
    }

    async fn start_with(password: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ShardState {
            password,
            ..Default::default()
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    /// Address in the form the client accepts, e.g. `redis://127.0.0.1:40123`
    pub fn url(&self) -> String {
        format!("redis://{}", self.addr)
    }

    pub fn value(&self, key: &str) -> Option<i64> {
        self.state.values.get(key).and_then(|v| v.parse().ok())
    }

    /// Store a raw value, integer or not
    pub fn insert(&self, key: &str, value: &str) {
        self.state.values.insert(key.to_string(), value.to_string());
    }

    /// Stop answering: commands are still applied but replies are withheld,
    /// as if every reply were lost on the way back
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Hold each reply back for `delay` after applying its command
    pub fn set_reply_delay(&self, delay: Duration) {
        self.state
            .reply_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every command received so far, upper-cased command name first
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.commands.lock().unwrap().clone()
    }

    /// Number of received commands with the given name
    pub fn count_commands(&self, name: &str) -> usize {
        self.commands().iter().filter(|c| c[0] == name).count()
    }
}

impl Drop for MockShard {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(stream: TcpStream, state: Arc<ShardState>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = RespReader::new(read_half);
    let mut authenticated = state.password.is_none();

    while let Ok(request) = reader.read_reply().await {
        let RespValue::Array(parts) = request else {
            return;
        };
        let args: Vec<String> = parts
            .into_iter()
            .filter_map(|part| match part {
                RespValue::BulkString(b) => Some(String::from_utf8_lossy(&b).into_owned()),
                _ => None,
            })
            .collect();
        if args.is_empty() {
            return;
        }
        let mut args = args;
        args[0] = args[0].to_uppercase();
        state.commands.lock().unwrap().push(args.clone());

        let reply = respond(&state, &args, &mut authenticated);
        if state.silent.load(Ordering::SeqCst) {
            continue;
        }
        let delay = state.reply_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if write_half.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn respond(state: &ShardState, args: &[String], authenticated: &mut bool) -> String {
    if args[0] == "AUTH" {
        return match (&state.password, args.get(1)) {
            (Some(expected), Some(given)) if expected == given => {
                *authenticated = true;
                "+OK\r\n".to_string()
            }
            _ => "-WRONGPASS invalid password\r\n".to_string(),
        };
    }
    if !*authenticated {
        return "-NOAUTH Authentication required.\r\n".to_string();
    }

    match (args[0].as_str(), args.len()) {
        ("PING", 1) => "+PONG\r\n".to_string(),
        ("SELECT", 2) => "+OK\r\n".to_string(),
        ("GET", 2) => match state.values.get(&args[1]) {
            Some(value) => format!("${}\r\n{}\r\n", value.len(), *value),
            None => "$-1\r\n".to_string(),
        },
        ("INCRBY", 3) => {
            let Ok(amount) = args[2].parse::<i64>() else {
                return "-ERR value is not an integer or out of range\r\n".to_string();
            };
            let mut value = state
                .values
                .entry(args[1].clone())
                .or_insert_with(|| "0".to_string());
            let Ok(current) = value.parse::<i64>() else {
                return "-ERR value is not an integer or out of range\r\n".to_string();
            };
            let total = current + amount;
            *value = total.to_string();
            format!(":{}\r\n", total)
        }
        (name, _) => format!("-ERR unknown command '{}'\r\n", name),
    }
}
