//! sc_crypto — Secure Channel session core
//!
//! # Design principles
//! - NO custom primitives; X25519, HKDF, HMAC-SHA2 and XChaCha20-Poly1305
//!   come from audited crates. Only the protocol composition lives here.
//! - Zeroize all secret material on drop.
//! - Public APIs return opaque newtypes to prevent accidental misuse.
//! - Session state has a single owner; nothing is global.
//!
//! # Module layout
//! - `kdf`      — HKDF extract/expand + domain-separated protocol derivations
//! - `keys`     — X25519 public/secret keys and key pairs
//! - `prekeys`  — key bundles and the key-bundle provider collaborator
//! - `x3dh`     — X3DH-style asynchronous key agreement
//! - `ratchet`  — Double Ratchet session with DH steps and replay rejection
//! - `skipped`  — bounded skipped-key cache and consumed ratchet-key record
//! - `cipher`   — cipher boundary trait + XChaCha20-Poly1305 implementation
//! - `session`  — conversation façade tying the above together
//! - `config`   — ratchet tunables
//! - `error`    — unified error type

pub mod cipher;
pub mod config;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod prekeys;
pub mod ratchet;
pub mod session;
pub mod skipped;
pub mod x3dh;

pub use cipher::{CipherBoundary, XChaChaCipher};
pub use config::RatchetConfig;
pub use error::CryptoError;
pub use keys::{KeyPair, PublicKey, SecretKey};
pub use prekeys::{KeyBundle, KeyBundleProvider, MemoryPrekeyStore};
pub use ratchet::{Header, RatchetSession, SessionState, SharedSession};
pub use session::Conversation;
pub use x3dh::HandshakePayload;
