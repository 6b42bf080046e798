// src/core/clusterd/proto.rs

//! Wire types and clients for the cluster daemon's two gRPC services:
//! `config.Config` (registration + rank-table stream) and `fault.Fault`
//! (registration + fault-signal stream). The clients follow tonic's
//! generated-client shape so a future move to `tonic-build` is mechanical.

/// Attached by both services at registration time.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterRequest {
    /// The training/serving job this controller belongs to.
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub role: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterReply {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscribeRequest {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
}

/// One chunk of a rank-table payload. Chunks accumulate until
/// `end_of_message` closes the frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RankTableChunk {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "2")]
    pub end_of_message: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeFaultInfo {
    #[prost(string, tag = "1")]
    pub node_ip: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub node_name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub fault_level: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "4")]
    pub device_ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FaultMsgSignal {
    #[prost(message, repeated, tag = "1")]
    pub nodes: ::prost::alloc::vec::Vec<NodeFaultInfo>,
}

pub mod config_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::wildcard_imports)]
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct ConfigClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl ConfigClient<tonic::transport::Channel> {
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> ConfigClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub fn new(inner: T) -> Self {
            Self {
                inner: tonic::client::Grpc::new(inner),
            }
        }

        pub async fn register(
            &mut self,
            request: impl tonic::IntoRequest<super::RegisterRequest>,
        ) -> std::result::Result<tonic::Response<super::RegisterReply>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/config.Config/Register");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("config.Config", "Register"));
            self.inner.unary(req, path, codec).await
        }

        pub async fn subscribe_rank_table(
            &mut self,
            request: impl tonic::IntoRequest<super::SubscribeRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::RankTableChunk>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/config.Config/SubscribeRankTable");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("config.Config", "SubscribeRankTable"));
            self.inner.server_streaming(req, path, codec).await
        }
    }
}

pub mod fault_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::wildcard_imports)]
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct FaultClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl FaultClient<tonic::transport::Channel> {
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> FaultClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub fn new(inner: T) -> Self {
            Self {
                inner: tonic::client::Grpc::new(inner),
            }
        }

        pub async fn register(
            &mut self,
            request: impl tonic::IntoRequest<super::RegisterRequest>,
        ) -> std::result::Result<tonic::Response<super::RegisterReply>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/fault.Fault/Register");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("fault.Fault", "Register"));
            self.inner.unary(req, path, codec).await
        }

        pub async fn subscribe_fault_msg_signal(
            &mut self,
            request: impl tonic::IntoRequest<super::SubscribeRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::FaultMsgSignal>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/fault.Fault/SubscribeFaultMsgSignal");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("fault.Fault", "SubscribeFaultMsgSignal"));
            self.inner.server_streaming(req, path, codec).await
        }
    }
}
