//! TLS provisioning for the HTTPS listener

mod provision;

pub use provision::{
    provision, provision_pem, select_cipher_suites, CipherSelection, TlsMaterial,
    INSECURE_CIPHER_SUITES,
};
