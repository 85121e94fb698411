#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Record {
    #[prost(bytes = "vec", tag = "1")]
    pub value: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub offset: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProduceRequest {
    #[prost(message, optional, tag = "1")]
    pub record: ::core::option::Option<Record>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProduceResponse {
    #[prost(uint64, tag = "1")]
    pub offset: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsumeRequest {
    #[prost(uint64, tag = "1")]
    pub offset: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsumeResponse {
    #[prost(message, optional, tag = "1")]
    pub record: ::core::option::Option<Record>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetServersRequest {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetServersResponse {
    #[prost(message, repeated, tag = "1")]
    pub servers: ::prost::alloc::vec::Vec<Server>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Server {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub rpc_addr: ::prost::alloc::string::String,
    #[prost(bool, tag = "3")]
    pub is_leader: bool,
}
#[doc = r" Generated client implementations."]
pub mod log_client {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    pub struct LogClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl LogClient<tonic::transport::Channel> {
        #[doc = r" Attempt to create a new client by connecting to a given endpoint."]
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: std::convert::TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> LogClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::ResponseBody: Body + HttpBody + Send + 'static,
        T::Error: Into<StdError>,
        <T::ResponseBody as HttpBody>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        pub fn with_interceptor(inner: T, interceptor: impl Into<tonic::Interceptor>) -> Self {
            let inner = tonic::client::Grpc::with_interceptor(inner, interceptor);
            Self { inner }
        }
        pub async fn produce(
            &mut self,
            request: impl tonic::IntoRequest<super::ProduceRequest>,
        ) -> Result<tonic::Response<super::ProduceResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/logapi.Log/Produce");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn consume(
            &mut self,
            request: impl tonic::IntoRequest<super::ConsumeRequest>,
        ) -> Result<tonic::Response<super::ConsumeResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/logapi.Log/Consume");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn consume_stream(
            &mut self,
            request: impl tonic::IntoRequest<super::ConsumeRequest>,
        ) -> Result<tonic::Response<tonic::codec::Streaming<super::ConsumeResponse>>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/logapi.Log/ConsumeStream");
            self.inner
                .server_streaming(request.into_request(), path, codec)
                .await
        }
        pub async fn produce_stream(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = super::ProduceRequest>,
        ) -> Result<tonic::Response<tonic::codec::Streaming<super::ProduceResponse>>, tonic::Status>
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/logapi.Log/ProduceStream");
            self.inner
                .streaming(request.into_streaming_request(), path, codec)
                .await
        }
        pub async fn get_servers(
            &mut self,
            request: impl tonic::IntoRequest<super::GetServersRequest>,
        ) -> Result<tonic::Response<super::GetServersResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/logapi.Log/GetServers");
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
    impl<T: Clone> Clone for LogClient<T> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }
    impl<T> std::fmt::Debug for LogClient<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "LogClient {{ ... }}")
        }
    }
}
#[doc = r" Generated server implementations."]
pub mod log_server {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    #[doc = "Generated trait containing gRPC methods that should be implemented for use with LogServer."]
    #[async_trait]
    pub trait Log: Send + Sync + 'static {
        async fn produce(
            &self,
            request: tonic::Request<super::ProduceRequest>,
        ) -> Result<tonic::Response<super::ProduceResponse>, tonic::Status>;
        async fn consume(
            &self,
            request: tonic::Request<super::ConsumeRequest>,
        ) -> Result<tonic::Response<super::ConsumeResponse>, tonic::Status>;
        #[doc = "Server streaming response type for the ConsumeStream method."]
        type ConsumeStreamStream: futures_core::Stream<Item = Result<super::ConsumeResponse, tonic::Status>>
            + Send
            + Sync
            + 'static;
        async fn consume_stream(
            &self,
            request: tonic::Request<super::ConsumeRequest>,
        ) -> Result<tonic::Response<Self::ConsumeStreamStream>, tonic::Status>;
        #[doc = "Server streaming response type for the ProduceStream method."]
        type ProduceStreamStream: futures_core::Stream<Item = Result<super::ProduceResponse, tonic::Status>>
            + Send
            + Sync
            + 'static;
        async fn produce_stream(
            &self,
            request: tonic::Request<tonic::Streaming<super::ProduceRequest>>,
        ) -> Result<tonic::Response<Self::ProduceStreamStream>, tonic::Status>;
        async fn get_servers(
            &self,
            request: tonic::Request<super::GetServersRequest>,
        ) -> Result<tonic::Response<super::GetServersResponse>, tonic::Status>;
    }
    #[derive(Debug)]
    pub struct LogServer<T: Log> {
        inner: _Inner<T>,
    }
    struct _Inner<T>(Arc<T>, Option<tonic::Interceptor>);
    impl<T: Log> LogServer<T> {
        pub fn new(inner: T) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner, None);
            Self { inner }
        }
        pub fn with_interceptor(inner: T, interceptor: impl Into<tonic::Interceptor>) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner, Some(interceptor.into()));
            Self { inner }
        }
    }
    impl<T, B> Service<http::Request<B>> for LogServer<T>
    where
        T: Log,
        B: HttpBody + Send + Sync + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = Never;
        type Future = BoxFuture<Self::Response, Self::Error>;
        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            let inner = self.inner.clone();
            match req.uri().path() {
                "/logapi.Log/Produce" => {
                    #[allow(non_camel_case_types)]
                    struct ProduceSvc<T: Log>(pub Arc<T>);
                    impl<T: Log> tonic::server::UnaryService<super::ProduceRequest> for ProduceSvc<T> {
                        type Response = super::ProduceResponse;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProduceRequest>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).produce(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = ProduceSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/logapi.Log/Consume" => {
                    #[allow(non_camel_case_types)]
                    struct ConsumeSvc<T: Log>(pub Arc<T>);
                    impl<T: Log> tonic::server::UnaryService<super::ConsumeRequest> for ConsumeSvc<T> {
                        type Response = super::ConsumeResponse;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ConsumeRequest>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).consume(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = ConsumeSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/logapi.Log/ConsumeStream" => {
                    #[allow(non_camel_case_types)]
                    struct ConsumeStreamSvc<T: Log>(pub Arc<T>);
                    impl<T: Log> tonic::server::ServerStreamingService<super::ConsumeRequest> for ConsumeStreamSvc<T> {
                        type Response = super::ConsumeResponse;
                        type ResponseStream = T::ConsumeStreamStream;
                        type Future =
                            BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ConsumeRequest>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).consume_stream(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1;
                        let inner = inner.0;
                        let method = ConsumeStreamSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.server_streaming(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/logapi.Log/ProduceStream" => {
                    #[allow(non_camel_case_types)]
                    struct ProduceStreamSvc<T: Log>(pub Arc<T>);
                    impl<T: Log> tonic::server::StreamingService<super::ProduceRequest> for ProduceStreamSvc<T> {
                        type Response = super::ProduceResponse;
                        type ResponseStream = T::ProduceStreamStream;
                        type Future =
                            BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<tonic::Streaming<super::ProduceRequest>>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).produce_stream(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1;
                        let inner = inner.0;
                        let method = ProduceStreamSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.streaming(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/logapi.Log/GetServers" => {
                    #[allow(non_camel_case_types)]
                    struct GetServersSvc<T: Log>(pub Arc<T>);
                    impl<T: Log> tonic::server::UnaryService<super::GetServersRequest> for GetServersSvc<T> {
                        type Response = super::GetServersResponse;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::GetServersRequest>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).get_servers(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = GetServersSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(tonic::body::BoxBody::empty())
                        .unwrap())
                }),
            }
        }
    }
    impl<T: Log> Clone for LogServer<T> {
        fn clone(&self) -> Self {
            let inner = self.inner.clone();
            Self { inner }
        }
    }
    impl<T: Log> Clone for _Inner<T> {
        fn clone(&self) -> Self {
            Self(self.0.clone(), self.1.clone())
        }
    }
    impl<T: std::fmt::Debug> std::fmt::Debug for _Inner<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }
    impl<T: Log> tonic::transport::NamedService for LogServer<T> {
        const NAME: &'static str = "logapi.Log";
    }
}
