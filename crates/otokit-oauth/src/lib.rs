//! Identity-provider authentication for otokit.
//!
//! # Components
//!
//! - [`callback`]: single-shot local listener receiving the redirect
//! - [`exchange`]: auth URL building and the cookie-keeping session exchange

pub mod callback;
pub mod error;
pub mod exchange;

pub use callback::{CallbackCode, CallbackConfig, CallbackInjector, CallbackListener};
pub use error::{OAuthError, Result};
pub use exchange::{AuthSession, ClientConfig, SessionExchange, build_auth_url};
