//! Generated gRPC code from proto files

pub mod platform {
    pub mod registration {
        pub mod v1 {
            tonic::include_proto!("platform.registration.v1");
        }
    }

    pub mod module {
        pub mod v1 {
            tonic::include_proto!("platform.module.v1");
        }
    }
}

pub use platform::module::v1::*;
pub use platform::registration::v1::*;
