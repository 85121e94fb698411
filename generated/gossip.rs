#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GossipMessage {
    #[prost(enumeration = "gossip_message::Kind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub from: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub members: ::prost::alloc::vec::Vec<GossipMember>,
}
/// Nested message and enum types in `GossipMessage`.
pub mod gossip_message {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Kind {
        Push = 0,
        Pull = 1,
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GossipMember {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub addr: ::prost::alloc::string::String,
    #[prost(map = "string, string", tag = "3")]
    pub tags:
        ::std::collections::HashMap<::prost::alloc::string::String, ::prost::alloc::string::String>,
    #[prost(uint64, tag = "4")]
    pub incarnation: u64,
    #[prost(uint64, tag = "5")]
    pub heartbeat: u64,
    #[prost(enumeration = "gossip_member::Status", tag = "6")]
    pub status: i32,
}
/// Nested message and enum types in `GossipMember`.
pub mod gossip_member {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Status {
        Alive = 0,
        Left = 1,
        Failed = 2,
    }
}
