pub mod signer;

pub use signer::{HankoSigner, LocalSigner, SignerError};
