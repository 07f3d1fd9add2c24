pub mod v1 {
    //! `manman.wrapper.v1.WrapperControl`
    //!
    //! ```text
    //! rpc Start(StartRequest) returns (StartResponse);
    //! rpc Stop(StopRequest) returns (StopResponse);
    //! rpc SendInput(SendInputRequest) returns (SendInputResponse);
    //! rpc GetStatus(GetStatusRequest) returns (GetStatusResponse);
    //! rpc StreamOutput(StreamOutputRequest) returns (stream OutputChunk);
    //! ```

    use std::collections::HashMap;

    include!(concat!(
        env!("OUT_DIR"),
        "/manman.wrapper.v1.WrapperControl.rs"
    ));

    pub use wrapper_control_client::WrapperControlClient;
    pub use wrapper_control_server::{WrapperControl, WrapperControlServer};

    /// Run state of the supervised process.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum ProcessState {
        Unspecified = 0,
        NotStarted = 1,
        Running = 2,
        Stopped = 3,
        Crashed = 4,
    }

    /// A file written before the process is spawned.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ConfigFile {
        #[prost(string, tag = "1")]
        pub path: String,
        #[prost(string, tag = "2")]
        pub content: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StartRequest {
        #[prost(string, tag = "1")]
        pub command: String,
        #[prost(string, repeated, tag = "2")]
        pub args: Vec<String>,
        #[prost(map = "string, string", tag = "3")]
        pub env: HashMap<String, String>,
        /// Empty means the wrapper's own working directory.
        #[prost(string, tag = "4")]
        pub working_dir: String,
        #[prost(message, repeated, tag = "5")]
        pub files: Vec<ConfigFile>,
        /// Kill a running process and start again instead of failing.
        #[prost(bool, tag = "6")]
        pub force: bool,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StartResponse {
        #[prost(uint32, tag = "1")]
        pub pid: u32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StopRequest {
        /// Send SIGTERM first; otherwise kill immediately.
        #[prost(bool, tag = "1")]
        pub graceful: bool,
        #[prost(uint32, tag = "2")]
        pub timeout_seconds: u32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StopResponse {
        #[prost(enumeration = "ProcessState", tag = "1")]
        pub state: i32,
        #[prost(int32, optional, tag = "2")]
        pub exit_code: Option<i32>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct SendInputRequest {
        #[prost(bytes = "vec", tag = "1")]
        pub data: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct SendInputResponse {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetStatusRequest {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct GetStatusResponse {
        #[prost(enumeration = "ProcessState", tag = "1")]
        pub state: i32,
        #[prost(int32, optional, tag = "2")]
        pub exit_code: Option<i32>,
        #[prost(uint32, optional, tag = "3")]
        pub pid: Option<u32>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StreamOutputRequest {}

    /// A slice of process output. The last chunk of a stream has
    /// `end_of_stream` set and carries no data.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct OutputChunk {
        #[prost(bytes = "vec", tag = "1")]
        pub data: Vec<u8>,
        #[prost(bool, tag = "2")]
        pub is_stderr: bool,
        #[prost(bool, tag = "3")]
        pub end_of_stream: bool,
    }

    impl OutputChunk {
        pub fn end() -> Self {
            Self {
                data: Vec::new(),
                is_stderr: false,
                end_of_stream: true,
            }
        }
    }
}
