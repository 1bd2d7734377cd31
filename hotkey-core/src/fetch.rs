// Secure fetch of a firmware image streamed straight into the update slot

use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::OtaConfig;
use crate::discovery::ServiceAddress;
use crate::error::FetchError;
use crate::trust::TrustAnchor;

/// Log every 64 KiB when the server does not announce a length
const UNSIZED_PROGRESS_STEP: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareUrl(String);

impl FirmwareUrl {
    pub fn new(address: ServiceAddress, config: &OtaConfig) -> Self {
        Self(format!(
            "https://{}:{}{}",
            address, config.firmware_port, config.firmware_path
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FirmwareUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Response body of an open firmware download.
pub trait FirmwareBody {
    fn status(&self) -> u16;

    fn content_length(&self) -> Option<u64>;

    /// Returns 0 at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FetchError>;

    /// Whether the transport saw the whole body (chunked or sized).
    fn is_complete(&self) -> bool;
}

/// HTTPS client side of the fetch.
///
/// `open` must authenticate the server against `anchor` and must not
/// compare the certificate common name with the host, which is a bare IP.
pub trait FirmwareSource {
    type Body<'a>: FirmwareBody
    where
        Self: 'a;

    fn open(&self, url: &FirmwareUrl, anchor: &TrustAnchor) -> Result<Self::Body<'_>, FetchError>;
}

/// Sink for image bytes while an install is open.
pub trait SlotWriter {
    fn write(&mut self, chunk: &[u8]) -> Result<(), FetchError>;
}

/// The inactive firmware slot. At most one install may be open at a time;
/// `install` fails with [`FetchError::Install`] while another is running.
pub trait UpdateSlot {
    /// Open the slot and hand its writer to `write_image`. If that returns
    /// `Ok`, the image is validated and made the next boot target. If it
    /// returns `Err`, the partial image is dropped and the active firmware
    /// stays the boot target.
    fn install<T, F>(&self, size_hint: Option<u64>, write_image: F) -> Result<T, FetchError>
    where
        F: FnOnce(&mut dyn SlotWriter) -> Result<T, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedImage {
    pub bytes: u64,
    pub sha256: String,
}

/// Download `url` and install it. Either the whole image is validated and
/// activated, or the slot writer is aborted and nothing changes.
pub fn fetch_and_apply<S, U>(
    source: &S,
    slot: &U,
    url: &FirmwareUrl,
    anchor: &TrustAnchor,
    chunk_size: usize,
) -> Result<AppliedImage, FetchError>
where
    S: FirmwareSource + ?Sized,
    U: UpdateSlot + ?Sized,
{
    log::info!("Starting OTA from {}", url);
    let mut body = source.open(url, anchor)?;

    let status = body.status();
    if status != 200 {
        return Err(FetchError::Connection(format!("HTTP {} from {}", status, url)));
    }

    let expected = body.content_length();
    match expected {
        Some(len) => log::info!("Firmware image is {} bytes", len),
        None => log::info!("Firmware image size not announced"),
    }

    let image = slot.install(expected, |writer| {
        let image = stream_image(&mut body, writer, expected, chunk_size).map_err(|e| {
            log::warn!("Aborting install: {}", e);
            e
        })?;
        log::info!("Download finished ({} bytes), validating image", image.bytes);
        Ok(image)
    })?;

    log::info!("Image sha256 {} activated for next boot", image.sha256);
    Ok(image)
}

fn stream_image<B, W>(
    body: &mut B,
    writer: &mut W,
    expected: Option<u64>,
    chunk_size: usize,
) -> Result<AppliedImage, FetchError>
where
    B: FirmwareBody + ?Sized,
    W: SlotWriter + ?Sized,
{
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut hasher = Sha256::new();
    let mut total: u64 = 0;
    let mut progress = Progress::new(expected);

    loop {
        let read = body.read(&mut buffer)?;
        if read == 0 {
            break;
        }

        let chunk = &buffer[..read];
        total += read as u64;
        if let Some(len) = expected {
            if total > len {
                return Err(FetchError::Integrity(format!(
                    "body exceeds Content-Length of {} bytes",
                    len
                )));
            }
        }

        writer.write(chunk)?;
        hasher.update(chunk);
        progress.report(total);
    }

    if total == 0 {
        return Err(FetchError::Integrity("empty firmware image".into()));
    }
    if let Some(len) = expected {
        if total != len {
            return Err(FetchError::Integrity(format!("truncated: {} of {} bytes", total, len)));
        }
    }
    if !body.is_complete() {
        return Err(FetchError::Integrity(format!(
            "connection closed after {} bytes before the image was complete",
            total
        )));
    }

    let sha256 = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    Ok(AppliedImage { bytes: total, sha256 })
}

struct Progress {
    expected: Option<u64>,
    next_mark: u64,
}

impl Progress {
    fn new(expected: Option<u64>) -> Self {
        Self { expected, next_mark: 0 }
    }

    /// Log when `total` crosses the next mark; returns whether it did.
    fn report(&mut self, total: u64) -> bool {
        match self.expected {
            Some(len) if len > 0 => {
                let percent = total * 100 / len;
                if percent < self.next_mark {
                    return false;
                }
                log::info!("OTA progress: {}% ({}/{})", percent, total, len);
                self.next_mark = (percent / 10 + 1) * 10;
            }
            _ => {
                if total < self.next_mark {
                    return false;
                }
                log::info!("OTA progress: {} bytes", total);
                self.next_mark = total + UNSIZED_PROGRESS_STEP;
            }
        }
        true
    }
}
