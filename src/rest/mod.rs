pub mod client;
pub mod signer;

pub use client::DeltaRestClient;
pub use signer::RequestSigner;
