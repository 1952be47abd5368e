//! Process startup: hostname resolution and self-registration

pub mod hostname;
pub mod self_registration;

pub use hostname::resolve_hostname;
pub use self_registration::SelfRegistration;
