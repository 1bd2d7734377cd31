// Scripted stand-ins for the device collaborators, used by the unit tests

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::control::{OutputLine, UpdateTrigger};
use crate::discovery::Discovery;
use crate::error::{DiscoveryError, FetchError, LaunchError};
use crate::fetch::{FirmwareBody, FirmwareSource, FirmwareUrl, SlotWriter, UpdateSlot};
use crate::orchestrator::{Delay, Platform, Restart};
use crate::trust::TrustAnchor;

static TEST_CERT: &[u8] = b"-----BEGIN CERTIFICATE-----\nMIIBtest\n-----END CERTIFICATE-----\n\0";

pub fn anchor() -> TrustAnchor {
    TrustAnchor::from_pem(TEST_CERT).unwrap()
}

// --- discovery ---------------------------------------------------------------

#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

pub struct ScriptedResolver {
    answer: Result<Ipv4Addr, DiscoveryError>,
    queries: Mutex<Vec<(String, Duration)>>,
    open_contexts: AtomicUsize,
    gate: Option<Gate>,
    queried: (Mutex<bool>, Condvar),
}

impl ScriptedResolver {
    pub fn answering(ip: Ipv4Addr) -> Self {
        Self::with_answer(Ok(ip))
    }

    pub fn failing(error: DiscoveryError) -> Self {
        Self::with_answer(Err(error))
    }

    fn with_answer(answer: Result<Ipv4Addr, DiscoveryError>) -> Self {
        Self {
            answer,
            queries: Mutex::new(Vec::new()),
            open_contexts: AtomicUsize::new(0),
            gate: None,
            queried: (Mutex::new(false), Condvar::new()),
        }
    }

    /// Block every query until `release` is called.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Gate::default());
        self
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            *gate.open.lock().unwrap() = true;
            gate.cond.notify_all();
        }
    }

    pub fn wait_for_query(&self, timeout: Duration) {
        let (flag, cond) = &self.queried;
        let guard = flag.lock().unwrap();
        let (guard, _) = cond.wait_timeout_while(guard, timeout, |seen| !*seen).unwrap();
        assert!(*guard, "no mDNS query within {:?}", timeout);
    }

    pub fn queries(&self) -> Vec<(String, Duration)> {
        self.queries.lock().unwrap().clone()
    }

    /// Responder contexts still alive; must be 0 between calls
    pub fn open_contexts(&self) -> usize {
        self.open_contexts.load(Ordering::SeqCst)
    }
}

impl Discovery for ScriptedResolver {
    fn resolve(&self, name: &str, timeout: Duration) -> Result<Ipv4Addr, DiscoveryError> {
        self.open_contexts.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push((name.to_string(), timeout));
        {
            let (flag, cond) = &self.queried;
            *flag.lock().unwrap() = true;
            cond.notify_all();
        }

        if let Some(gate) = &self.gate {
            let open = gate.open.lock().unwrap();
            let _open = gate.cond.wait_while(open, |open| !*open).unwrap();
        }

        let answer = self.answer.clone();
        self.open_contexts.fetch_sub(1, Ordering::SeqCst);
        answer
    }
}

// --- firmware server ---------------------------------------------------------

pub struct FakeServer {
    image: Vec<u8>,
    status: u16,
    announce_length: bool,
    fail_after: Option<usize>,
    truncate_at: Option<usize>,
    refusal: Option<FetchError>,
    opened: Mutex<Vec<String>>,
}

impl FakeServer {
    pub fn image_of(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    pub fn serving(image: Vec<u8>) -> Self {
        Self {
            image,
            status: 200,
            announce_length: true,
            fail_after: None,
            truncate_at: None,
            refusal: None,
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn refusing(error: FetchError) -> Self {
        Self { refusal: Some(error), ..Self::serving(Vec::new()) }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn without_length(mut self) -> Self {
        self.announce_length = false;
        self
    }

    /// Drop the connection with an error once `offset` bytes were sent
    pub fn failing_after(mut self, offset: usize) -> Self {
        self.fail_after = Some(offset);
        self
    }

    /// Close the connection cleanly but early at `offset`
    pub fn truncated_at(mut self, offset: usize) -> Self {
        self.truncate_at = Some(offset);
        self
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

pub struct FakeBody<'a> {
    server: &'a FakeServer,
    position: usize,
}

impl FakeBody<'_> {
    fn end(&self) -> usize {
        self.server.truncate_at.unwrap_or(self.server.image.len()).min(self.server.image.len())
    }
}

impl FirmwareBody for FakeBody<'_> {
    fn status(&self) -> u16 {
        self.server.status
    }

    fn content_length(&self) -> Option<u64> {
        self.server.announce_length.then_some(self.server.image.len() as u64)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FetchError> {
        let mut limit = self.end();
        if let Some(fail_at) = self.server.fail_after {
            if self.position >= fail_at {
                return Err(FetchError::Connection("connection reset by peer".into()));
            }
            limit = limit.min(fail_at);
        }

        let n = buf.len().min(limit - self.position);
        buf[..n].copy_from_slice(&self.server.image[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }

    fn is_complete(&self) -> bool {
        self.position == self.server.image.len()
    }
}

impl FirmwareSource for FakeServer {
    type Body<'a> = FakeBody<'a>;

    fn open(&self, url: &FirmwareUrl, _anchor: &TrustAnchor) -> Result<FakeBody<'_>, FetchError> {
        self.opened.lock().unwrap().push(url.as_str().to_string());
        if let Some(error) = &self.refusal {
            return Err(error.clone());
        }
        Ok(FakeBody { server: self, position: 0 })
    }
}

// --- update partition --------------------------------------------------------

/// Two-slot flash: the boot image plus one staging slot that only becomes
/// the boot image on a successful `complete`.
pub struct FakeFlash {
    boot_image: Mutex<Vec<u8>>,
    in_progress: AtomicBool,
    reject_images: bool,
    begins: AtomicUsize,
    writes: AtomicUsize,
    aborts: AtomicUsize,
}

impl FakeFlash {
    pub fn with_active(image: Vec<u8>) -> Self {
        Self {
            boot_image: Mutex::new(image),
            in_progress: AtomicBool::new(false),
            reject_images: false,
            begins: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        }
    }

    /// Fail validation in `complete`, as a corrupt image would
    pub fn rejecting_images(mut self) -> Self {
        self.reject_images = true;
        self
    }

    pub fn boot_image(&self) -> Vec<u8> {
        self.boot_image.lock().unwrap().clone()
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

pub struct FakeWriter<'a> {
    flash: &'a FakeFlash,
    staged: Vec<u8>,
}

impl SlotWriter for FakeWriter<'_> {
    fn write(&mut self, chunk: &[u8]) -> Result<(), FetchError> {
        self.flash.writes.fetch_add(1, Ordering::SeqCst);
        self.staged.extend_from_slice(chunk);
        Ok(())
    }
}

impl Drop for FakeWriter<'_> {
    fn drop(&mut self) {
        self.flash.in_progress.store(false, Ordering::SeqCst);
    }
}

impl UpdateSlot for FakeFlash {
    fn install<T, F>(&self, _size_hint: Option<u64>, write_image: F) -> Result<T, FetchError>
    where
        F: FnOnce(&mut dyn SlotWriter) -> Result<T, FetchError>,
    {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(FetchError::Install("update partition busy".into()));
        }
        self.begins.fetch_add(1, Ordering::SeqCst);
        let mut writer = FakeWriter { flash: self, staged: Vec::new() };

        let value = match write_image(&mut writer) {
            Ok(value) => value,
            Err(e) => {
                self.aborts.fetch_add(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        if self.reject_images {
            return Err(FetchError::Integrity("image header magic mismatch".into()));
        }
        *self.boot_image.lock().unwrap() = std::mem::take(&mut writer.staged);
        Ok(value)
    }
}

// --- restart and delay -------------------------------------------------------

#[derive(Default)]
pub struct RecordingRestart {
    calls: Mutex<Vec<Instant>>,
    cond: Condvar,
}

impl RecordingRestart {
    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn wait(&self, timeout: Duration) -> Option<Instant> {
        let calls = self.calls.lock().unwrap();
        let (calls, _) = self.cond.wait_timeout_while(calls, timeout, |c| c.is_empty()).unwrap();
        calls.first().copied()
    }
}

impl Restart for RecordingRestart {
    fn restart(&self) -> ! {
        self.calls.lock().unwrap().push(Instant::now());
        self.cond.notify_all();
        // A restarted device runs nothing further on this task
        loop {
            thread::park();
        }
    }
}

/// Records requested delays without sleeping
#[derive(Default)]
pub struct RecordingDelay {
    calls: Mutex<Vec<(Duration, Instant)>>,
}

impl RecordingDelay {
    pub fn recorded(&self) -> Vec<Duration> {
        self.calls.lock().unwrap().iter().map(|(d, _)| *d).collect()
    }

    pub fn last_finished(&self) -> Option<Instant> {
        self.calls.lock().unwrap().last().map(|(_, at)| *at)
    }
}

impl Delay for RecordingDelay {
    fn delay(&self, duration: Duration) {
        self.calls.lock().unwrap().push((duration, Instant::now()));
    }
}

// --- platform bundle ---------------------------------------------------------

/// Handles onto the fakes a `TestPlatform` was built from
#[derive(Clone)]
pub struct Fakes {
    pub resolver: Arc<ScriptedResolver>,
    pub server: Arc<FakeServer>,
    pub flash: Arc<FakeFlash>,
    pub restart: Arc<RecordingRestart>,
    pub delay: Arc<RecordingDelay>,
}

pub struct TestPlatform {
    fakes: Fakes,
}

impl TestPlatform {
    /// Resolver answers 192.168.4.10, server holds a 16 KiB image, the
    /// boot slot holds "factory".
    pub fn new() -> Self {
        Self {
            fakes: Fakes {
                resolver: Arc::new(ScriptedResolver::answering(Ipv4Addr::new(192, 168, 4, 10))),
                server: Arc::new(FakeServer::serving(FakeServer::image_of(16 * 1024))),
                flash: Arc::new(FakeFlash::with_active(b"factory".to_vec())),
                restart: Arc::new(RecordingRestart::default()),
                delay: Arc::new(RecordingDelay::default()),
            },
        }
    }

    pub fn with_discovery_error(mut self, error: DiscoveryError) -> Self {
        self.fakes.resolver = Arc::new(ScriptedResolver::failing(error));
        self
    }

    pub fn with_gated_discovery(mut self) -> Self {
        self.fakes.resolver =
            Arc::new(ScriptedResolver::answering(Ipv4Addr::new(192, 168, 4, 10)).gated());
        self
    }

    pub fn with_server(mut self, server: FakeServer) -> Self {
        self.fakes.server = Arc::new(server);
        self
    }

    pub fn fakes(&self) -> Fakes {
        self.fakes.clone()
    }
}

impl Platform for TestPlatform {
    type Discovery = ScriptedResolver;
    type Source = FakeServer;
    type Slot = FakeFlash;
    type Restart = RecordingRestart;
    type Delay = RecordingDelay;

    fn discovery(&self) -> &ScriptedResolver {
        &self.fakes.resolver
    }

    fn source(&self) -> &FakeServer {
        &self.fakes.server
    }

    fn slot(&self) -> &FakeFlash {
        &self.fakes.flash
    }

    fn restarter(&self) -> &RecordingRestart {
        &self.fakes.restart
    }

    fn delay(&self) -> &RecordingDelay {
        &self.fakes.delay
    }
}

// --- control plane -----------------------------------------------------------

#[derive(Clone, Default)]
pub struct FakeLine {
    writes: Arc<Mutex<Vec<bool>>>,
    fail: Arc<AtomicBool>,
}

impl FakeLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<bool> {
        self.writes.lock().unwrap().clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl OutputLine for FakeLine {
    type Error = &'static str;

    fn set_level(&mut self, high: bool) -> Result<(), Self::Error> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("gpio driver error");
        }
        self.writes.lock().unwrap().push(high);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingTrigger {
    requests: Arc<AtomicUsize>,
    busy: Arc<AtomicBool>,
}

impl RecordingTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }
}

impl UpdateTrigger for RecordingTrigger {
    fn request_update(&self) -> Result<u32, LaunchError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        if self.busy.load(Ordering::SeqCst) {
            return Err(LaunchError::Busy);
        }
        Ok(n as u32)
    }
}
