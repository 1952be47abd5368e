//! gRPC surface: the registration service, outbound channels, and the module
//! callback client

pub mod channels;
pub mod module_client;
pub mod service;

pub use channels::{ChannelManager, ChannelStats};
pub use module_client::{GrpcModuleClient, ModuleRegistrationProbe};
pub use service::PlatformRegistrationService;
