//! Module runtime substrate: hierarchical addressing, knock-door discovery,
//! request/notice dispatch over a pluggable broker transport, and a C ABI for
//! hosting modules from other languages.

pub mod adapter;
pub mod address;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod ffi;
pub mod frame;
pub mod protocol;
pub mod routes;
pub mod runtime;
pub mod setting;

#[cfg(test)]
mod testutil;

pub use adapter::{Adapter, AdapterEvents, ConnectOptions, Transport};
pub use context::{json_payload, Context};
pub use error::{AdapterError, RequestError, StartError};
pub use frame::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError};
pub use protocol::{
    routes as route_names, DiscoveryRecord, LinkState, ModuleInfo, NoticeEnvelope,
    RequestEnvelope, ResponseCode, ResponseEnvelope, FRAMEWORK_VERSION, ROUTE_MODULE,
};
pub use routes::RouteTable;
pub use runtime::Module;
pub use setting::{BrokerSetting, Handlers, NullStore, Setting, SettingStore, StoreError};
