//! Shared test doubles for the client integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use client::config::Config;
use client::error::{ClientError, Result, ServiceError, ServiceErrorKind};
use client::transport::{RpcCaller, RpcRequest};
use client::{LineClient, MemoryStore};
use futures_util::future::BoxFuture;
use protocol::{StructValue, TType, WireValue};

// ============================================================================
// Helpers
// ============================================================================

/// Decodes the arguments of a request back into a field map.
pub fn args(request: &RpcRequest) -> StructValue {
    let bytes = protocol::encode_struct(&request.envelope, request.protocol).unwrap();
    protocol::decode_struct(&bytes, request.protocol).unwrap()
}

pub fn service_error(code: i32, message: &str) -> ClientError {
    ClientError::Service(ServiceError::from_struct(
        ServiceErrorKind::Talk,
        [
            (1, WireValue::I32(code)),
            (2, WireValue::String(message.to_string())),
        ]
        .into_iter()
        .collect(),
    ))
}

pub fn structure(fields: Vec<(i16, WireValue)>) -> WireValue {
    WireValue::Struct(fields.into_iter().collect())
}

pub fn text(s: &str) -> WireValue {
    WireValue::String(s.to_string())
}

pub fn list(elem_type: TType, items: Vec<WireValue>) -> WireValue {
    WireValue::List { elem_type, items }
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.transport.scheme = "http".to_string();
    config.transport.endpoint = "127.0.0.1:1".to_string();
    config
}

/// A client over `caller` with an in-memory store.
pub async fn client_with(caller: Arc<dyn RpcCaller>, config: Config) -> LineClient {
    LineClient::builder(config)
        .store(Arc::new(MemoryStore::new()))
        .caller(caller)
        .build()
        .await
        .unwrap()
}

// ============================================================================
// ScriptedCaller
// ============================================================================

/// Replies to each method from a queue. A method with an empty queue never
/// answers, like a long poll with nothing to report.
#[derive(Default)]
pub struct ScriptedCaller {
    scripts: Mutex<HashMap<String, VecDeque<Result<WireValue>>>>,
    requests: Mutex<Vec<(tokio::time::Instant, RpcRequest)>>,
}

impl ScriptedCaller {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, method: &str, reply: Result<WireValue>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn requests(&self, method: &str) -> Vec<RpcRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| r.method == method)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn request_times(&self, method: &str) -> Vec<tokio::time::Instant> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| r.method == method)
            .map(|(at, _)| *at)
            .collect()
    }
}

impl RpcCaller for ScriptedCaller {
    fn call(&self, request: RpcRequest) -> BoxFuture<'_, Result<WireValue>> {
        Box::pin(async move {
            let reply = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&request.method)
                .and_then(VecDeque::pop_front);
            self.requests
                .lock()
                .unwrap()
                .push((tokio::time::Instant::now(), request));
            match reply {
                Some(reply) => reply,
                None => std::future::pending().await,
            }
        })
    }
}

// ============================================================================
// FakeServer
// ============================================================================

#[derive(Clone)]
struct StoredKey {
    version: i32,
    key_id: i32,
    data: Vec<u8>,
}

struct GroupKeyEntry {
    group_key_id: i32,
    creator: String,
    creator_key_id: i32,
    wrapped: BTreeMap<String, (i32, Vec<u8>)>,
}

#[derive(Default)]
struct ServerState {
    next_id: i32,
    keys: BTreeMap<String, Vec<StoredKey>>,
    chats: BTreeMap<String, Vec<String>>,
    group_keys: BTreeMap<String, Vec<GroupKeyEntry>>,
    unsupported: BTreeSet<String>,
    failures: HashMap<String, VecDeque<(i32, String)>>,
    sent: Vec<StructValue>,
    calls: Vec<(String, String)>,
}

/// An in-memory stand-in for the key exchange and messaging server, shared
/// by several clients.
#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A caller acting as user `mid`.
    pub fn caller(self: &Arc<Self>, mid: &str) -> Arc<dyn RpcCaller> {
        Arc::new(FakeCaller {
            server: Arc::clone(self),
            mid: mid.to_string(),
        })
    }

    /// A logged-in client for `mid` with its E2EE key registered.
    pub async fn client(self: &Arc<Self>, mid: &str) -> LineClient {
        let client = client_with(self.caller(mid), config()).await;
        let profile = client.login_with_token("token").await.unwrap();
        assert_eq!(profile.mid, mid);
        client
    }

    pub fn add_chat(&self, chat: &str, members: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .chats
            .insert(chat.to_string(), members.iter().map(|m| m.to_string()).collect());
    }

    pub fn mark_unsupported(&self, mid: &str) {
        self.state.lock().unwrap().unsupported.insert(mid.to_string());
    }

    /// Makes the next call of `method` fail with a service error.
    pub fn fail_next(&self, method: &str, code: i32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(method.to_string())
            .or_default()
            .push_back((code, format!("scripted failure {}", code)));
    }

    pub fn sent(&self) -> Vec<StructValue> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn group_key_count(&self, chat: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .group_keys
            .get(chat)
            .map_or(0, Vec::len)
    }

    pub fn current_key_id(&self, mid: &str) -> Option<i32> {
        self.state
            .lock()
            .unwrap()
            .keys
            .get(mid)
            .and_then(|keys| keys.last())
            .map(|k| k.key_id)
    }

    /// Number of calls of `method` made by `mid`.
    pub fn call_count(&self, mid: &str, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(who, m)| who == mid && m == method)
            .count()
    }

    fn handle(&self, mid: &str, request: &RpcRequest) -> Result<WireValue> {
        let args = args(request);
        let mut state = self.state.lock().unwrap();
        state.calls.push((mid.to_string(), request.method.clone()));

        if let Some((code, message)) = state
            .failures
            .get_mut(&request.method)
            .and_then(VecDeque::pop_front)
        {
            return Err(service_error(code, &message));
        }

        match request.method.as_str() {
            "getProfile" => Ok(structure(vec![(1, text(mid)), (20, text(mid))])),
            "getE2EEPublicKeys" => Ok(list(
                TType::Struct,
                state
                    .keys
                    .get(mid)
                    .and_then(|keys| keys.last())
                    .map(key_struct)
                    .into_iter()
                    .collect(),
            )),
            "registerE2EEPublicKey" => {
                let key = args.structure(2).unwrap();
                state.next_id += 1;
                let stored = StoredKey {
                    version: key.i32(1).unwrap(),
                    key_id: state.next_id,
                    data: key.bytes(4).unwrap().to_vec(),
                };
                let reply = key_struct(&stored);
                state.keys.entry(mid.to_string()).or_default().push(stored);
                Ok(reply)
            }
            "negotiateE2EEPublicKey" => {
                let peer = args.str(2).unwrap();
                if state.unsupported.contains(peer) {
                    return Ok(structure(vec![(3, WireValue::I32(-1))]));
                }
                let key = state
                    .keys
                    .get(peer)
                    .and_then(|keys| keys.last())
                    .ok_or_else(|| service_error(5, "not found"))?;
                Ok(structure(vec![
                    (1, list(TType::I32, vec![WireValue::I32(1)])),
                    (2, key_struct(key)),
                    (3, WireValue::I32(2)),
                ]))
            }
            "getLastE2EEPublicKeys" => {
                let chat = args.str(2).unwrap();
                let members = state.chats.get(chat).cloned().unwrap_or_default();
                let entries = members
                    .iter()
                    .filter_map(|m| {
                        let key = state.keys.get(m)?.last()?;
                        Some((text(m), key_struct(key)))
                    })
                    .collect();
                Ok(WireValue::Map {
                    key_type: TType::String,
                    value_type: TType::Struct,
                    entries,
                })
            }
            "registerE2EEGroupKey" => {
                let chat = args.str(3).unwrap().to_string();
                let members = args.list(4).unwrap();
                let key_ids = args.list(5).unwrap();
                let wrapped = args.list(6).unwrap();
                let creator_key_id = state.keys.get(mid).and_then(|k| k.last()).unwrap().key_id;
                let entries = members
                    .iter()
                    .zip(key_ids)
                    .zip(wrapped)
                    .map(|((m, id), w)| {
                        (
                            m.as_str().unwrap().to_string(),
                            (id.as_i32().unwrap(), w.as_bytes().unwrap().to_vec()),
                        )
                    })
                    .collect();
                state.next_id += 1;
                let group_key_id = state.next_id;
                state.group_keys.entry(chat).or_default().push(GroupKeyEntry {
                    group_key_id,
                    creator: mid.to_string(),
                    creator_key_id,
                    wrapped: entries,
                });
                Ok(structure(vec![(2, WireValue::I32(group_key_id))]))
            }
            "getLastE2EEGroupSharedKey" | "getE2EEGroupSharedKey" => {
                let chat = args.str(3).unwrap();
                let wanted = args.i32(4);
                let entry = state
                    .group_keys
                    .get(chat)
                    .and_then(|entries| {
                        entries
                            .iter()
                            .rev()
                            .find(|e| wanted.is_none_or(|id| id == e.group_key_id))
                    })
                    .ok_or_else(|| service_error(5, "not found"))?;
                let (receiver_key_id, encrypted) = entry
                    .wrapped
                    .get(mid)
                    .cloned()
                    .ok_or_else(|| service_error(5, "not found"))?;
                Ok(structure(vec![
                    (1, WireValue::I32(2)),
                    (2, WireValue::I32(entry.group_key_id)),
                    (3, text(&entry.creator)),
                    (4, WireValue::I32(entry.creator_key_id)),
                    (5, text(mid)),
                    (6, WireValue::I32(receiver_key_id)),
                    (7, WireValue::Binary(encrypted)),
                ]))
            }
            "sendMessage" => {
                let mut message = args.structure(2).unwrap().clone();
                let id = format!("m{}", state.sent.len() + 1);
                message.insert(1, text(mid));
                message.insert(4, text(&id));
                state.sent.push(message.clone());
                Ok(WireValue::Struct(message))
            }
            other => Err(service_error(1, &format!("unknown method {}", other))),
        }
    }
}

fn key_struct(key: &StoredKey) -> WireValue {
    structure(vec![
        (1, WireValue::I32(key.version)),
        (2, WireValue::I32(key.key_id)),
        (4, WireValue::Binary(key.data.clone())),
        (5, WireValue::I64(1_700_000_000_000)),
    ])
}

struct FakeCaller {
    server: Arc<FakeServer>,
    mid: String,
}

impl RpcCaller for FakeCaller {
    fn call(&self, request: RpcRequest) -> BoxFuture<'_, Result<WireValue>> {
        Box::pin(async move { self.server.handle(&self.mid, &request) })
    }
}
