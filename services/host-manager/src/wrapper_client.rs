//! Client side of the session wrapper's `WrapperControl` service.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use manman_proto::wrapper::v1::{
    GetStatusRequest, OutputChunk, ProcessState, SendInputRequest, StartRequest, StopRequest,
    StreamOutputRequest, WrapperControlClient,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::transport::{Channel, Endpoint};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WrapperClientError {
    #[error("invalid wrapper address {0}")]
    InvalidAddress(String),

    #[error("wrapper unavailable: {0}")]
    Unavailable(String),

    #[error("wrapper rejected request: {0}")]
    Rejected(String),
}

impl From<tonic::Status> for WrapperClientError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;
        match status.code() {
            Code::Unavailable | Code::DeadlineExceeded | Code::Unknown | Code::Cancelled => {
                Self::Unavailable(status.message().to_string())
            }
            _ => Self::Rejected(format!("{:?}: {}", status.code(), status.message())),
        }
    }
}

/// Final or current state reported by a wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapperStatus {
    pub state: ProcessState,
    pub exit_code: Option<i32>,
}

pub type OutputStream = BoxStream<'static, Result<OutputChunk, WrapperClientError>>;

/// Operations the host manager performs against a session's wrapper.
#[async_trait]
pub trait WrapperApi: Send + Sync {
    async fn start(&self, address: &str, request: StartRequest) -> Result<u32, WrapperClientError>;

    async fn stop(
        &self,
        address: &str,
        graceful: bool,
        timeout: Duration,
    ) -> Result<WrapperStatus, WrapperClientError>;

    async fn send_input(&self, address: &str, data: Vec<u8>) -> Result<(), WrapperClientError>;

    async fn status(&self, address: &str) -> Result<WrapperStatus, WrapperClientError>;

    async fn stream_output(&self, address: &str) -> Result<OutputStream, WrapperClientError>;
}

// =============================================================================
// gRPC
// =============================================================================

/// Margin on top of a stop timeout for the Stop call itself.
const STOP_CALL_MARGIN: Duration = Duration::from_secs(10);

/// gRPC client with one lazily connected channel per wrapper address.
pub struct GrpcWrapperClient {
    request_timeout: Duration,
    channels: Mutex<HashMap<String, Channel>>,
}

impl GrpcWrapperClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, address: &str) -> Result<WrapperControlClient<Channel>, WrapperClientError> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| WrapperClientError::Unavailable("channel cache poisoned".to_string()))?;

        if let Some(channel) = channels.get(address) {
            return Ok(WrapperControlClient::new(channel.clone()));
        }

        let channel = Endpoint::from_shared(address.to_string())
            .map_err(|_| WrapperClientError::InvalidAddress(address.to_string()))?
            .connect_timeout(self.request_timeout)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .connect_lazy();
        channels.insert(address.to_string(), channel.clone());
        Ok(WrapperControlClient::new(channel))
    }

    fn request<T>(&self, message: T, timeout: Duration) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request.set_timeout(timeout);
        request
    }

    /// Drops the cached channel of a wrapper that went away.
    pub fn forget(&self, address: &str) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(address);
        }
    }
}

#[async_trait]
impl WrapperApi for GrpcWrapperClient {
    async fn start(&self, address: &str, request: StartRequest) -> Result<u32, WrapperClientError> {
        let response = self
            .client(address)?
            .start(self.request(request, self.request_timeout))
            .await?;
        Ok(response.into_inner().pid)
    }

    async fn stop(
        &self,
        address: &str,
        graceful: bool,
        timeout: Duration,
    ) -> Result<WrapperStatus, WrapperClientError> {
        let message = StopRequest {
            graceful,
            timeout_seconds: timeout.as_secs().max(1) as u32,
        };
        let response = self
            .client(address)?
            .stop(self.request(message, timeout + STOP_CALL_MARGIN))
            .await?
            .into_inner();
        Ok(WrapperStatus {
            state: response.state(),
            exit_code: response.exit_code,
        })
    }

    async fn send_input(&self, address: &str, data: Vec<u8>) -> Result<(), WrapperClientError> {
        self.client(address)?
            .send_input(self.request(SendInputRequest { data }, self.request_timeout))
            .await?;
        Ok(())
    }

    async fn status(&self, address: &str) -> Result<WrapperStatus, WrapperClientError> {
        let response = self
            .client(address)?
            .get_status(self.request(GetStatusRequest {}, self.request_timeout))
            .await?
            .into_inner();
        Ok(WrapperStatus {
            state: response.state(),
            exit_code: response.exit_code,
        })
    }

    async fn stream_output(&self, address: &str) -> Result<OutputStream, WrapperClientError> {
        // No deadline: the stream lives as long as the game process.
        let stream = self
            .client(address)?
            .stream_output(StreamOutputRequest {})
            .await?
            .into_inner();
        Ok(stream.map(|item| item.map_err(WrapperClientError::from)).boxed())
    }
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrapperCall {
    Start { address: String, command: String, args: Vec<String> },
    Stop { address: String, graceful: bool },
    SendInput { address: String, data: Vec<u8> },
}

#[derive(Default)]
struct MockWrapperState {
    calls: Vec<WrapperCall>,
    statuses: HashMap<String, WrapperStatus>,
    outputs: HashMap<String, mpsc::UnboundedSender<Result<OutputChunk, WrapperClientError>>>,
    /// Output emitted while nobody was subscribed.
    backlog: HashMap<String, Vec<Vec<u8>>>,
    fail_starts: u32,
    stop_exit_code: i32,
}

/// In-memory wrapper that records calls and simulates one process per address.
///
/// `stop` ends the process with the configured exit code (0 by default) and
/// closes its output stream with an end marker.
#[derive(Default)]
pub struct MockWrapper {
    state: Mutex<MockWrapperState>,
}

impl MockWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` starts fail as if the wrapper were not yet listening.
    pub fn fail_next_starts(&self, n: u32) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_starts = n;
        }
    }

    pub fn set_stop_exit_code(&self, code: i32) {
        if let Ok(mut s) = self.state.lock() {
            s.stop_exit_code = code;
        }
    }

    pub fn calls(&self) -> Vec<WrapperCall> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Emits output on the process at `address`.
    pub fn emit(&self, address: &str, data: &[u8]) {
        if let Ok(mut s) = self.state.lock() {
            match s.outputs.get(address) {
                Some(tx) => {
                    let _ = tx.send(Ok(chunk(data)));
                }
                None => s
                    .backlog
                    .entry(address.to_string())
                    .or_default()
                    .push(data.to_vec()),
            }
        }
    }

    /// Returns true once something subscribed to the output of `address`.
    pub fn has_subscriber(&self, address: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.outputs.contains_key(address))
            .unwrap_or(false)
    }

    /// Simulates the process at `address` exiting on its own.
    pub fn exit(&self, address: &str, exit_code: i32) {
        self.finish(address, ProcessState::Crashed, exit_code);
    }

    fn finish(&self, address: &str, state: ProcessState, exit_code: i32) {
        if let Ok(mut s) = self.state.lock() {
            s.statuses.insert(
                address.to_string(),
                WrapperStatus {
                    state,
                    exit_code: Some(exit_code),
                },
            );
            if let Some(tx) = s.outputs.remove(address) {
                let _ = tx.send(Ok(OutputChunk::end()));
            }
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockWrapperState>, WrapperClientError> {
        self.state
            .lock()
            .map_err(|_| WrapperClientError::Unavailable("mock poisoned".to_string()))
    }
}

fn chunk(data: &[u8]) -> OutputChunk {
    OutputChunk {
        data: data.to_vec(),
        is_stderr: false,
        end_of_stream: false,
    }
}

#[async_trait]
impl WrapperApi for MockWrapper {
    async fn start(&self, address: &str, request: StartRequest) -> Result<u32, WrapperClientError> {
        let mut s = self.lock()?;
        if s.fail_starts > 0 {
            s.fail_starts -= 1;
            return Err(WrapperClientError::Unavailable("connection refused".to_string()));
        }
        s.calls.push(WrapperCall::Start {
            address: address.to_string(),
            command: request.command,
            args: request.args,
        });
        s.statuses.insert(
            address.to_string(),
            WrapperStatus {
                state: ProcessState::Running,
                exit_code: None,
            },
        );
        Ok(4242)
    }

    async fn stop(
        &self,
        address: &str,
        graceful: bool,
        _timeout: Duration,
    ) -> Result<WrapperStatus, WrapperClientError> {
        let exit_code = {
            let mut s = self.lock()?;
            s.calls.push(WrapperCall::Stop {
                address: address.to_string(),
                graceful,
            });
            s.stop_exit_code
        };
        self.finish(address, ProcessState::Stopped, exit_code);
        Ok(WrapperStatus {
            state: ProcessState::Stopped,
            exit_code: Some(exit_code),
        })
    }

    async fn send_input(&self, address: &str, data: Vec<u8>) -> Result<(), WrapperClientError> {
        let mut s = self.lock()?;
        let running = s
            .statuses
            .get(address)
            .is_some_and(|st| st.state == ProcessState::Running);
        if !running {
            return Err(WrapperClientError::Rejected("process is not running".to_string()));
        }
        s.calls.push(WrapperCall::SendInput {
            address: address.to_string(),
            data,
        });
        Ok(())
    }

    async fn status(&self, address: &str) -> Result<WrapperStatus, WrapperClientError> {
        let s = self.lock()?;
        Ok(s.statuses.get(address).copied().unwrap_or(WrapperStatus {
            state: ProcessState::NotStarted,
            exit_code: None,
        }))
    }

    async fn stream_output(&self, address: &str) -> Result<OutputStream, WrapperClientError> {
        let mut s = self.lock()?;
        let (tx, rx) = mpsc::unbounded_channel();
        for data in s.backlog.remove(address).unwrap_or_default() {
            let _ = tx.send(Ok(chunk(&data)));
        }
        let exited = s
            .statuses
            .get(address)
            .is_some_and(|st| st.state != ProcessState::Running);
        if exited {
            let _ = tx.send(Ok(OutputChunk::end()));
        } else {
            s.outputs.insert(address.to_string(), tx);
        }
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
