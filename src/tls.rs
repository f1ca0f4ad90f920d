use std::sync::OnceLock;

/// Select rustls' `ring` crypto provider for the process, once.
///
/// rustls 0.23 panics on the first TLS handshake when more than one provider is compiled in
/// and none was installed. Another component may already have installed one; that is fine.
pub fn install_rustls_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
