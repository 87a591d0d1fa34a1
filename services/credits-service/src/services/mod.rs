//! gRPC service implementations for credits-service.

mod credits;

pub use credits::CreditsServiceImpl;
