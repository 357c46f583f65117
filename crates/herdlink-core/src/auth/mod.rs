//! Authentication: credential storage, request signing, single-flight
//! refresh and the startup gate.
//!
//! This module provides:
//! - `TokenStore`: single-key bearer credential storage (`StoredTokens` in the
//!   gateway store, `KeychainTokens` in the OS keychain)
//! - `EndpointPolicy`: public/protected route classification
//! - `RequestSigner`: bearer + anti-forgery header attachment
//! - `RefreshCoordinator`: one refresh request no matter how many 401s
//! - `AuthGate`: holds protected requests until the session state is known

pub mod credentials;
pub mod endpoints;
pub mod gate;
pub mod refresh;
pub mod session;
pub mod signer;

pub use credentials::{KeychainTokens, TokenStore};
pub use endpoints::{CsrfScope, EndpointPolicy};
pub use gate::{AuthGate, AuthGateState};
pub use refresh::RefreshCoordinator;
pub use session::{Credential, StoredTokens};
pub use signer::RequestSigner;
