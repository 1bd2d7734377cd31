// Pinned certificate used to authenticate the firmware server

use std::ffi::CStr;
use std::fmt;

use crate::error::ConfigError;

const PEM_HEADER: &[u8] = b"-----BEGIN CERTIFICATE-----";

/// Immutable PEM certificate linked into the image at build time.
///
/// ESP-TLS reads the anchor as a C string, so the blob must carry its
/// terminating NUL. Hostname checks are skipped by the fetcher (the server
/// is reached by address), so the anchor alone decides who is trusted.
#[derive(Clone, Copy)]
pub struct TrustAnchor {
    pem: &'static CStr,
}

impl TrustAnchor {
    pub fn from_pem(blob: &'static [u8]) -> Result<Self, ConfigError> {
        let pem = CStr::from_bytes_until_nul(blob)
            .map_err(|_| ConfigError::TrustAnchor("certificate is not NUL-terminated"))?;

        let bytes = pem.to_bytes();
        if bytes.is_empty() {
            return Err(ConfigError::TrustAnchor("certificate is empty"));
        }
        if !bytes.windows(PEM_HEADER.len()).any(|w| w == PEM_HEADER) {
            return Err(ConfigError::TrustAnchor("certificate is not PEM encoded"));
        }

        Ok(Self { pem })
    }

    pub fn as_c_str(&self) -> &'static CStr {
        self.pem
    }

    /// PEM text without the trailing NUL
    pub fn pem(&self) -> &'static [u8] {
        self.pem.to_bytes()
    }
}

impl fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrustAnchor({} bytes)", self.pem.to_bytes().len())
    }
}
