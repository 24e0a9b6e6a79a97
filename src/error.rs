//! Typed error definitions.
//!
//! Configuration problems are fatal at construction time and carry enough
//! context to pinpoint the offending entry; module and TLS problems are
//! reported non-fatally by their subsystems.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal configuration validation errors. The daemon does not start when one
/// of these is raised.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no bind addresses configured")]
    NoBindAddrs,

    #[error("no listening ports configured")]
    NoPorts,

    #[error("site {host:?}: host list is empty")]
    EmptyHostList { host: String },

    #[error("site {host:?}: empty hostname in host list")]
    EmptyHostname { host: String },

    #[error("site {host:?}: invalid category {found:?}, expected a single letter A-Z")]
    InvalidCategory { host: String, found: String },
}

/// Non-fatal hook-module loading errors. A failed module contributes zero
/// functions; other modules are unaffected.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("unable to read module {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("module {path} failed to evaluate: {source}")]
    Eval {
        path: PathBuf,
        #[source]
        source: mlua::Error,
    },

    #[error("module {path} did not evaluate to a table of hook functions")]
    NotATable { path: PathBuf },
}

/// TLS material loading errors. Incomplete material skips the HTTPS
/// endpoints with a diagnostic; plaintext endpoints still start.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {path}")]
    NoCerts { path: PathBuf },

    #[error("no private key found in {path}")]
    NoKey { path: PathBuf },

    #[error("private key {path} appears to be encrypted; passphrase decryption is not supported")]
    EncryptedKey { path: PathBuf },

    #[error("invalid client CA bundle {path}: {reason}")]
    BadCa { path: PathBuf, reason: String },

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}
