//! Generates tonic client and server stubs.
//!
//! Message types are hand-written `prost::Message` structs in `src/`, so no
//! `protoc` is needed; only the service plumbing is generated here.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";

fn method(name: &str, route: &str, input: &str, output: &str, server_streaming: bool) -> Method {
    let builder = Method::builder()
        .name(name)
        .route_name(route)
        .input_type(input)
        .output_type(output)
        .codec_path(CODEC);
    let builder = if server_streaming {
        builder.server_streaming()
    } else {
        builder
    };
    builder.build()
}

fn main() {
    let wrapper = "crate::wrapper::v1";
    let wrapper_control = Service::builder()
        .name("WrapperControl")
        .package("manman.wrapper.v1")
        .method(
            method(
                "start",
                "Start",
                &format!("{wrapper}::StartRequest"),
                &format!("{wrapper}::StartResponse"),
                false,
            ),
        )
        .method(
            method(
                "stop",
                "Stop",
                &format!("{wrapper}::StopRequest"),
                &format!("{wrapper}::StopResponse"),
                false,
            ),
        )
        .method(
            method(
                "send_input",
                "SendInput",
                &format!("{wrapper}::SendInputRequest"),
                &format!("{wrapper}::SendInputResponse"),
                false,
            ),
        )
        .method(
            method(
                "get_status",
                "GetStatus",
                &format!("{wrapper}::GetStatusRequest"),
                &format!("{wrapper}::GetStatusResponse"),
                false,
            ),
        )
        .method(
            method(
                "stream_output",
                "StreamOutput",
                &format!("{wrapper}::StreamOutputRequest"),
                &format!("{wrapper}::OutputChunk"),
                true,
            ),
        )
        .build();

    let api = "crate::api::v1";
    let manman_api = Service::builder()
        .name("ManManApi")
        .package("manman.api.v1")
        .method(
            method(
                "register_server",
                "RegisterServer",
                &format!("{api}::RegisterServerRequest"),
                &format!("{api}::RegisterServerResponse"),
                false,
            ),
        )
        .method(
            method(
                "create_log_reference",
                "CreateLogReference",
                &format!("{api}::CreateLogReferenceRequest"),
                &format!("{api}::CreateLogReferenceResponse"),
                false,
            ),
        )
        .build();

    Builder::new().compile(&[wrapper_control, manman_api]);
    println!("cargo:rerun-if-changed=build.rs");
}
