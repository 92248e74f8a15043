//! Newline-delimited JSON transport over TCP.
//!
//! Each call writes one request frame and awaits one response frame. I/O
//! failures mark the channel disconnected; the next call attempts a
//! reconnect to the last known address before giving up.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::record::{GlobalId, PlatformId, SensorRecord};

use super::{Connection, ConnectionError, MethodDescriptor, SensorTypeDescriptor};

/// One request frame.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    RegisterPlatform {
        agent_name: &'a str,
    },
    RegisterMethod {
        platform_id: u64,
        descriptor: &'a MethodDescriptor,
    },
    RegisterSensorType {
        platform_id: u64,
        descriptor: &'a SensorTypeDescriptor,
    },
    AddSensorTypeToMethod {
        sensor_type_id: u64,
        method_id: u64,
    },
    SendBatch {
        records: &'a [SensorRecord],
    },
}

/// One response frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Response {
    Ok {
        #[serde(default)]
        id: Option<u64>,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Default)]
struct ChannelState {
    stream: Option<BufStream<TcpStream>>,
    addr: Option<(String, u16)>,
}

/// JSON-lines TCP client for the collector.
pub struct TcpConnection {
    state: Mutex<ChannelState>,
    connected: AtomicBool,
}

impl TcpConnection {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
            connected: AtomicBool::new(false),
        }
    }

    async fn open(host: &str, port: u16) -> Result<BufStream<TcpStream>, ConnectionError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ConnectionError::unavailable(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ConnectionError::unavailable(e.to_string()))?;
        Ok(BufStream::new(stream))
    }

    /// Sends one frame and reads one reply, reconnecting once if needed.
    async fn roundtrip(&self, request: &Request<'_>) -> Result<Response, ConnectionError> {
        let mut state = self.state.lock().await;

        if state.stream.is_none() {
            let (host, port) = state
                .addr
                .clone()
                .ok_or_else(|| ConnectionError::unavailable("never connected"))?;
            debug!(host = %host, port, "reconnecting to collector");
            state.stream = Some(Self::open(&host, port).await?);
            self.connected.store(true, Ordering::Relaxed);
        }

        let Some(stream) = state.stream.as_mut() else {
            return Err(ConnectionError::unavailable("no open channel"));
        };

        let result = Self::exchange(stream, request).await;
        if result.is_err() {
            state.stream = None;
            self.connected.store(false, Ordering::Relaxed);
        }

        result
    }

    async fn exchange(
        stream: &mut BufStream<TcpStream>,
        request: &Request<'_>,
    ) -> Result<Response, ConnectionError> {
        let mut frame =
            serde_json::to_vec(request).map_err(|e| ConnectionError::unavailable(e.to_string()))?;
        frame.push(b'\n');

        stream
            .write_all(&frame)
            .await
            .map_err(|e| ConnectionError::unavailable(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| ConnectionError::unavailable(e.to_string()))?;

        let mut line = String::new();
        let n = stream
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::unavailable(e.to_string()))?;
        if n == 0 {
            return Err(ConnectionError::unavailable("collector closed connection"));
        }

        serde_json::from_str(&line).map_err(|e| ConnectionError::unavailable(e.to_string()))
    }

    fn require_id(response: Response) -> Result<u64, ConnectionError> {
        match response {
            Response::Ok { id: Some(id) } => Ok(id),
            Response::Ok { id: None } => {
                Err(ConnectionError::unavailable("missing id in reply"))
            }
            Response::Rejected { reason } => Err(ConnectionError::rejected(reason)),
        }
    }

    fn require_ack(response: Response) -> Result<(), ConnectionError> {
        match response {
            Response::Ok { .. } => Ok(()),
            Response::Rejected { reason } => Err(ConnectionError::rejected(reason)),
        }
    }
}

impl Default for TcpConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for TcpConnection {
    async fn connect(&self, host: &str, port: u16) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;
        state.addr = Some((host.to_string(), port));

        match Self::open(host, port).await {
            Ok(stream) => {
                state.stream = Some(stream);
                self.connected.store(true, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                warn!(host = %host, port, error = %e, "initial collector connect failed");
                self.connected.store(false, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn register_platform(&self, agent_name: &str) -> Result<PlatformId, ConnectionError> {
        let response = self
            .roundtrip(&Request::RegisterPlatform { agent_name })
            .await?;
        Self::require_id(response).map(PlatformId)
    }

    async fn register_method(
        &self,
        platform_id: PlatformId,
        descriptor: &MethodDescriptor,
    ) -> Result<GlobalId, ConnectionError> {
        let response = self
            .roundtrip(&Request::RegisterMethod {
                platform_id: platform_id.0,
                descriptor,
            })
            .await?;
        Self::require_id(response).map(GlobalId)
    }

    async fn register_sensor_type(
        &self,
        platform_id: PlatformId,
        descriptor: &SensorTypeDescriptor,
    ) -> Result<GlobalId, ConnectionError> {
        let response = self
            .roundtrip(&Request::RegisterSensorType {
                platform_id: platform_id.0,
                descriptor,
            })
            .await?;
        Self::require_id(response).map(GlobalId)
    }

    async fn add_sensor_type_to_method(
        &self,
        sensor_type_id: GlobalId,
        method_id: GlobalId,
    ) -> Result<(), ConnectionError> {
        let response = self
            .roundtrip(&Request::AddSensorTypeToMethod {
                sensor_type_id: sensor_type_id.0,
                method_id: method_id.0,
            })
            .await?;
        Self::require_ack(response)
    }

    async fn send_batch(&self, records: &[SensorRecord]) -> Result<(), ConnectionError> {
        let response = self.roundtrip(&Request::SendBatch { records }).await?;
        Self::require_ack(response)
    }
}
