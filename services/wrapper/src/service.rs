//! `WrapperControl` gRPC service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use manman_proto::wrapper::v1::{
    GetStatusRequest, GetStatusResponse, OutputChunk, ProcessState, SendInputRequest,
    SendInputResponse, StartRequest, StartResponse, StopRequest, StopResponse,
    StreamOutputRequest, WrapperControl,
};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::supervisor::{LaunchSpec, OutputEvent, ProcessStatus, ProcessSupervisor, RunState};

/// Stop timeout used when a request leaves it at zero.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Chunks queued between a subscriber's forwarder and its gRPC stream.
const FORWARD_BUFFER: usize = 64;

pub struct WrapperService {
    supervisor: Arc<ProcessSupervisor>,
}

impl WrapperService {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }
}

fn to_proto_state(state: RunState) -> ProcessState {
    match state {
        RunState::NotStarted => ProcessState::NotStarted,
        RunState::Running => ProcessState::Running,
        RunState::Stopped => ProcessState::Stopped,
        RunState::Crashed => ProcessState::Crashed,
    }
}

fn launch_spec(req: StartRequest) -> Result<LaunchSpec, Status> {
    if req.command.trim().is_empty() {
        return Err(Status::invalid_argument("command cannot be empty"));
    }
    if req.files.iter().any(|f| f.path.trim().is_empty()) {
        return Err(Status::invalid_argument("config file path cannot be empty"));
    }

    Ok(LaunchSpec {
        command: req.command,
        args: req.args,
        env: req.env,
        working_dir: (!req.working_dir.is_empty()).then(|| PathBuf::from(req.working_dir)),
        files: req
            .files
            .into_iter()
            .map(|f| (PathBuf::from(f.path), f.content))
            .collect(),
    })
}

/// Copies supervisor output into one subscriber's stream until the process
/// ends or the subscriber goes away.
async fn forward_output(
    mut events: broadcast::Receiver<OutputEvent>,
    tx: mpsc::Sender<Result<OutputChunk, Status>>,
) {
    loop {
        let chunk = match events.recv().await {
            Ok(OutputEvent::Stdout(data)) => OutputChunk {
                data: data.to_vec(),
                is_stderr: false,
                end_of_stream: false,
            },
            Ok(OutputEvent::Stderr(data)) => OutputChunk {
                data: data.to_vec(),
                is_stderr: true,
                end_of_stream: false,
            },
            Ok(OutputEvent::End) | Err(broadcast::error::RecvError::Closed) => {
                let _ = tx.send(Ok(OutputChunk::end())).await;
                return;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Output subscriber fell behind, dropped oldest chunks");
                continue;
            }
        };

        if tx.send(Ok(chunk)).await.is_err() {
            debug!("Output subscriber disconnected");
            return;
        }
    }
}

#[tonic::async_trait]
impl WrapperControl for WrapperService {
    async fn start(&self, request: Request<StartRequest>) -> Result<Response<StartResponse>, Status> {
        let req = request.into_inner();
        let force = req.force;
        let spec = launch_spec(req)?;

        let pid = self.supervisor.start(spec, force).await?;
        Ok(Response::new(StartResponse { pid }))
    }

    async fn stop(&self, request: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        let req = request.into_inner();
        let timeout = match req.timeout_seconds {
            0 => DEFAULT_STOP_TIMEOUT,
            secs => Duration::from_secs(u64::from(secs)),
        };

        let ProcessStatus {
            state, exit_code, ..
        } = self.supervisor.stop(req.graceful, timeout).await?;
        Ok(Response::new(StopResponse {
            state: to_proto_state(state) as i32,
            exit_code,
        }))
    }

    async fn send_input(
        &self,
        request: Request<SendInputRequest>,
    ) -> Result<Response<SendInputResponse>, Status> {
        let req = request.into_inner();
        self.supervisor.send_input(&req.data).await?;
        Ok(Response::new(SendInputResponse {}))
    }

    async fn get_status(
        &self,
        _request: Request<GetStatusRequest>,
    ) -> Result<Response<GetStatusResponse>, Status> {
        let status = self.supervisor.status();
        Ok(Response::new(GetStatusResponse {
            state: to_proto_state(status.state) as i32,
            exit_code: status.exit_code,
            pid: status.pid,
        }))
    }

    type StreamOutputStream = ReceiverStream<Result<OutputChunk, Status>>;

    async fn stream_output(
        &self,
        _request: Request<StreamOutputRequest>,
    ) -> Result<Response<Self::StreamOutputStream>, Status> {
        // Subscribe before reading the status so no end marker is missed.
        let events = self.supervisor.subscribe();
        let (tx, rx) = mpsc::channel(FORWARD_BUFFER);

        if self.supervisor.status().state.has_exited() {
            let _ = tx.try_send(Ok(OutputChunk::end()));
        } else {
            info!("Output subscriber attached");
            tokio::spawn(forward_output(events, tx));
        }

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manman_proto::wrapper::v1::ConfigFile;

    #[test]
    fn test_launch_spec_maps_request() {
        let spec = launch_spec(StartRequest {
            command: "java".to_string(),
            args: vec!["-jar".to_string(), "server.jar".to_string()],
            env: [("EULA".to_string(), "true".to_string())].into(),
            working_dir: "/data".to_string(),
            files: vec![ConfigFile {
                path: "server.properties".to_string(),
                content: "motd=x".to_string(),
            }],
            force: false,
        })
        .unwrap();

        assert_eq!(spec.command, "java");
        assert_eq!(spec.working_dir, Some(PathBuf::from("/data")));
        assert_eq!(spec.files[0].0, PathBuf::from("server.properties"));
        assert_eq!(spec.env["EULA"], "true");
    }

    #[test]
    fn test_launch_spec_rejects_empty_command() {
        let err = launch_spec(StartRequest::default()).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_forwarder_skips_lag_and_ends_stream() {
        let (events_tx, events_rx) = broadcast::channel(2);
        let (tx, mut rx) = mpsc::channel(16);

        for i in 0..5u8 {
            events_tx
                .send(OutputEvent::Stdout(bytes::Bytes::from(vec![i])))
                .unwrap();
        }
        events_tx.send(OutputEvent::End).unwrap();

        forward_output(events_rx, tx).await;

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk.unwrap());
        }
        // Capacity 2: only the newest chunk and the end marker survive.
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data, vec![4]);
        assert!(chunks[1].end_of_stream);
    }
}
