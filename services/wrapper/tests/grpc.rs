//! End-to-end tests of the WrapperControl service over a real socket.

use std::sync::Arc;
use std::time::Duration;

use manman_proto::wrapper::v1::{
    GetStatusRequest, ProcessState, SendInputRequest, StartRequest, StopRequest,
    StreamOutputRequest, WrapperControlClient, WrapperControlServer,
};
use manman_wrapper::{ProcessSupervisor, WrapperService};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Channel;

struct TestServer {
    client: WrapperControlClient<Channel>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    let service = WrapperService::new(Arc::new(ProcessSupervisor::new(64)));
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(WrapperControlServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    let client = WrapperControlClient::connect(format!("http://{addr}"))
        .await
        .unwrap();
    TestServer {
        client,
        shutdown: Some(tx),
    }
}

fn cat_request(force: bool) -> StartRequest {
    StartRequest {
        command: "cat".to_string(),
        force,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_session_lifecycle_over_grpc() {
    let mut server = serve().await;
    let client = &mut server.client;

    // Subscribing before start must not end the stream early.
    let mut output = client
        .stream_output(StreamOutputRequest {})
        .await
        .unwrap()
        .into_inner();

    let pid = client
        .start(cat_request(false))
        .await
        .unwrap()
        .into_inner()
        .pid;
    assert!(pid > 0);

    let status = client
        .get_status(GetStatusRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.state(), ProcessState::Running);
    assert_eq!(status.pid, Some(pid));

    client
        .send_input(SendInputRequest {
            data: b"hello\n".to_vec(),
        })
        .await
        .unwrap();

    let mut echoed = Vec::new();
    while !echoed.ends_with(b"hello\n") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), output.message())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!chunk.is_stderr);
        echoed.extend_from_slice(&chunk.data);
    }

    let stopped = client
        .stop(StopRequest {
            graceful: true,
            timeout_seconds: 5,
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(stopped.state(), ProcessState::Stopped);

    let last = loop {
        let chunk = tokio::time::timeout(Duration::from_secs(5), output.message())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if chunk.end_of_stream {
            break chunk;
        }
    };
    assert!(last.data.is_empty());

    // A late subscriber gets the end marker straight away.
    let mut late = client
        .stream_output(StreamOutputRequest {})
        .await
        .unwrap()
        .into_inner();
    let chunk = late.message().await.unwrap().unwrap();
    assert!(chunk.end_of_stream);
}

#[tokio::test]
async fn test_second_start_requires_force() {
    let mut server = serve().await;
    let client = &mut server.client;

    client.start(cat_request(false)).await.unwrap();

    let err = client.start(cat_request(false)).await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::FailedPrecondition);

    client.start(cat_request(true)).await.unwrap();
    let status = client
        .get_status(GetStatusRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.state(), ProcessState::Running);

    client
        .stop(StopRequest {
            graceful: false,
            timeout_seconds: 1,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_input_and_stop_when_idle() {
    let mut server = serve().await;
    let client = &mut server.client;

    let err = client
        .send_input(SendInputRequest { data: b"x".to_vec() })
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::FailedPrecondition);

    let stopped = client
        .stop(StopRequest {
            graceful: true,
            timeout_seconds: 1,
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(stopped.state(), ProcessState::NotStarted);
    assert_eq!(stopped.exit_code, None);
}
