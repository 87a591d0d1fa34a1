//! Credit ledger Protocol Buffer definitions.
//!
//! gRPC service definitions and message types for the credit ledger service.
//! Everything in this crate is generated by `tonic-build` from
//! `proto/credits/v1/credits.proto`.

/// Credit ledger protocol definitions.
///
/// Balance resolution, credit consumption, sign-in/sign-out transitions and
/// the identity event feed shared by the contexts of one browser session.
pub mod credits {
    /// Version 1 of the credit ledger API.
    #[allow(missing_docs)]
    pub mod v1 {
        tonic::include_proto!("credits.v1");
    }
}
