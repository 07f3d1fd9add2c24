pub mod v1 {
    //! `manman.api.v1.ManManApi`, the client subset the host manager uses.

    include!(concat!(env!("OUT_DIR"), "/manman.api.v1.ManManApi.rs"));

    pub use man_man_api_client::ManManApiClient;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ServerCapabilities {
        #[prost(uint32, tag = "1")]
        pub cpu_cores: u32,
        #[prost(uint64, tag = "2")]
        pub memory_bytes: u64,
        #[prost(string, tag = "3")]
        pub docker_version: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RegisterServerRequest {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub environment: String,
        #[prost(message, optional, tag = "3")]
        pub capabilities: Option<ServerCapabilities>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RegisterServerResponse {
        #[prost(int64, tag = "1")]
        pub server_id: i64,
        /// False when an existing server was matched by name.
        #[prost(bool, tag = "2")]
        pub created: bool,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CreateLogReferenceRequest {
        #[prost(int64, tag = "1")]
        pub session_id: i64,
        #[prost(string, tag = "2")]
        pub blob_key: String,
        #[prost(uint64, tag = "3")]
        pub size_bytes: u64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CreateLogReferenceResponse {
        #[prost(int64, tag = "1")]
        pub log_reference_id: i64,
    }
}
