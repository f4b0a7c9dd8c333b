//! HTTPS Credentials - TLS credential lifecycle manager library
//!
//! Holds, validates and serves a node's private key, certificate signing
//! request, certificate and certificate chain, across "automatic" and
//! "manual" provisioning modes, behind an administrative HTTP API.
//!
//! # Overview
//!
//! ```text
//! Admin API (webserver)
//!   └── Lifecycle Controller (controller)
//!       ├── PEM Codec (pem_codec)
//!       ├── Crypto Validator (validator)
//!       └── Credential Store (store) ── Persistence (persistence)
//! ```
//!
//! Every mutation of a node's credentials is checked before it is committed:
//! - **Key pairing**: a certificate must carry the public key of the stored key
//! - **Chain of trust**: every chain entry signs the previous one and the last
//!   one ends at a configured (or allowed self-declared) root
//! - **Dependency safety**: deleting the key deletes its CSR; a chain needs a
//!   certificate to verify against
//! - **Mode isolation**: switching provisioning mode discards the credentials
//!   of the mode being left
//!
//! Readers always see a complete snapshot; writers of one node are
//! serialized.
//!
//! # Quick Start
//!
//! ```bash
//! # Run with config.toml from the working directory
//! cargo run --release -- --config config.toml
//!
//! # Generate a key, then a CSR
//! curl -X POST http://127.0.0.1:8082/admin/https/key/generate
//! curl -X POST http://127.0.0.1:8082/admin/https/csr/generate \
//!      -d '{"country":"IT","city":"Genova","company":"Internet Widgets LTD","email":"nocontact@certs.may.hurt"}'
//! curl http://127.0.0.1:8082/admin/https/csr
//! ```
//!
//! # As a Library
//!
//! ```no_run
//! use https_credentials::configs::AppConfig;
//! use https_credentials::controller::NodeRegistry;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let config = AppConfig::load()?;
//!     let registry = NodeRegistry::from_config(&config)?;
//!     let node = registry.get(None)?;
//!
//!     node.generate_key()?;
//!     println!("{:?}", node.status().state);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`pem_codec`]: PEM parsing and serialization of keys, CSRs and certificates
//! - [`validator`]: key/certificate pairing, chain verification, CSR field checks
//! - [`store`]: per-node credential sets with atomic snapshots
//! - [`controller`]: lifecycle state machine and node registry
//! - [`webserver`]: admin API routes and the per-node HTTPS listener
//! - [`generate_keypair`] / [`generate_csr`]: key and CSR synthesis
//! - [`persistence`]: optional on-disk copy of committed credentials

pub mod configs;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod generate_csr;
pub mod generate_keypair;
pub mod pem_codec;
pub mod persistence;
pub mod protocol;
pub mod store;
pub mod validator;
pub mod webserver;

#[cfg(test)]
mod test_pki;
