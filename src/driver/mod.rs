//! Audio driver contract and registry
//!
//! A driver owns one output device (and optionally one microphone). The
//! pipeline talks to it only through [`AudioDriver`]; drivers are looked up by
//! name in a [`DriverRegistry`] and handed back as an owned
//! `Box<dyn AudioDriver>`, released on drop.
//!
//! Available backends:
//! - `null`: discards audio at the device rate
//! - `alsathread`: ALSA with a dedicated worker thread (feature `alsa`, Linux)
//! - `rodio`: pull-model playback through rodio (feature `streaming`)
//! - [`simulated`]: loopback PCM host for headless runs and tests, registered
//!   on demand

#[cfg(all(feature = "alsa", target_os = "linux"))]
pub mod alsathread;
pub mod null;
pub mod simulated;
#[cfg(feature = "streaming")]
pub mod streaming;
pub mod threaded;

use crate::{AudioError, Result};
use log::{info, warn};
use std::fmt;
use std::sync::Arc;

/// Parameters passed to a driver when opening a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverParams {
    /// Device name; `None` selects the backend default
    pub device: Option<String>,
    /// Requested sample rate in Hz
    pub rate: u32,
    /// Requested latency in milliseconds
    pub latency_ms: u32,
    /// Preferred write granularity in frames
    pub block_frames: usize,
}

impl DriverParams {
    /// Parameters for the default device
    pub fn new(rate: u32, latency_ms: u32) -> Self {
        DriverParams {
            device: None,
            rate,
            latency_ms,
            block_frames: 0,
        }
    }

    /// Frames covering the requested latency at `rate`
    pub fn latency_frames(&self, rate: u32) -> usize {
        (u64::from(rate) * u64::from(self.latency_ms) / 1000) as usize
    }
}

/// An output device
///
/// Samples are interleaved stereo, native endian, `f32` when
/// [`AudioDriver::use_float`] is true and `i16` otherwise. All sizes are in
/// bytes.
pub trait AudioDriver: Send {
    /// Registry name of the backend
    fn ident(&self) -> &'static str;

    /// Queue `data` for playback
    ///
    /// In nonblocking mode returns the number of bytes accepted, possibly 0
    /// ("would block"). In blocking mode waits until everything is accepted,
    /// unless the driver is stopped and nothing would ever make room; then it
    /// returns a short count.
    ///
    /// # Errors
    ///
    /// A hard device failure; the driver is unusable afterwards.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Suspend playback; returns false if the device refused
    fn stop(&mut self) -> bool;

    /// Resume playback; `is_shutdown` is set when starting only to drain on exit
    fn start(&mut self, is_shutdown: bool) -> bool;

    /// Whether the device is currently playing
    fn alive(&self) -> bool;

    /// Switch between blocking and nonblocking writes
    fn set_nonblock_state(&mut self, nonblock: bool);

    /// Whether the device takes `f32` samples
    fn use_float(&self) -> bool;

    /// Bytes that can be written without blocking, if the backend knows
    fn write_avail(&self) -> Option<usize> {
        None
    }

    /// Total device-side buffer in bytes, if the backend knows
    fn buffer_size(&self) -> Option<usize> {
        None
    }

    /// Names of the devices this backend can open
    fn device_list(&self) -> Vec<String> {
        Vec::new()
    }

    /// Open a microphone on this backend
    fn init_microphone(&mut self, _params: &DriverParams) -> Result<OpenedMicrophone> {
        Err(AudioError::Unsupported("microphone"))
    }
}

/// A capture device opened through [`AudioDriver::init_microphone`]
///
/// Samples are mono, native endian, `f32` when [`Microphone::use_float`] is
/// true and `i16` otherwise.
pub trait Microphone: Send {
    /// Read captured bytes into `dest`
    ///
    /// Nonblocking reads return what is queued (possibly 0); blocking reads wait
    /// until `dest` is full. An inactive microphone returns 0.
    fn read(&mut self, dest: &mut [u8]) -> Result<usize>;

    /// Start or stop recording; returns false if the device refused
    fn set_active(&mut self, active: bool) -> bool;

    /// Whether the microphone is recording
    fn is_active(&self) -> bool;

    /// Switch between blocking and nonblocking reads
    fn set_nonblock_state(&mut self, nonblock: bool);

    /// Whether the device delivers `f32` samples
    fn use_float(&self) -> bool;
}

/// A driver and the rate the device actually accepted
pub struct OpenedDriver {
    /// The driver
    pub driver: Box<dyn AudioDriver>,
    /// Negotiated sample rate in Hz
    pub rate: u32,
}

impl fmt::Debug for OpenedDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedDriver")
            .field("driver", &self.driver.ident())
            .field("rate", &self.rate)
            .finish()
    }
}

/// A microphone and the rate the device actually accepted
pub struct OpenedMicrophone {
    /// The microphone
    pub mic: Box<dyn Microphone>,
    /// Negotiated sample rate in Hz
    pub rate: u32,
}

impl fmt::Debug for OpenedMicrophone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedMicrophone")
            .field("rate", &self.rate)
            .field("active", &self.mic.is_active())
            .finish()
    }
}

/// Constructor stored in the registry
pub type DriverFactory = Arc<dyn Fn(&DriverParams) -> Result<OpenedDriver> + Send + Sync>;

/// Device enumerator stored in the registry
pub type DeviceLister = Box<dyn Fn() -> Vec<String> + Send + Sync>;

struct DriverEntry {
    name: String,
    factory: DriverFactory,
    devices: Option<DeviceLister>,
}

/// Name to driver factory lookup
#[derive(Default)]
pub struct DriverRegistry {
    entries: Vec<DriverEntry>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl DriverRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every backend compiled into this build
    ///
    /// Hardware backends come first so the fallback for an unknown name is a
    /// real device when one is available.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        #[cfg(all(feature = "alsa", target_os = "linux"))]
        registry.register_with_devices(
            alsathread::IDENT,
            |params| threaded::ThreadedDriver::open(alsathread::AlsaHost, params),
            || threaded::PcmHost::device_list(&alsathread::AlsaHost),
        );

        #[cfg(feature = "streaming")]
        registry.register(streaming::IDENT, streaming::RodioDriver::open);

        registry.register(null::IDENT, null::NullDriver::open);
        registry
    }

    /// Add a backend, replacing any existing one with the same name
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DriverParams) -> Result<OpenedDriver> + Send + Sync + 'static,
    {
        self.insert(DriverEntry {
            name: name.to_string(),
            factory: Arc::new(factory),
            devices: None,
        });
    }

    /// Add a backend that can enumerate its devices without being opened
    pub fn register_with_devices<F, L>(&mut self, name: &str, factory: F, devices: L)
    where
        F: Fn(&DriverParams) -> Result<OpenedDriver> + Send + Sync + 'static,
        L: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        self.insert(DriverEntry {
            name: name.to_string(),
            factory: Arc::new(factory),
            devices: Some(Box::new(devices)),
        });
    }

    fn insert(&mut self, entry: DriverEntry) {
        match self.entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Registered names, in lookup order
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Whether a backend is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    fn resolve(&self, name: &str) -> Result<&DriverEntry> {
        if let Some(entry) = self.entries.iter().find(|e| e.name == name) {
            return Ok(entry);
        }

        let fallback = self
            .entries
            .first()
            .ok_or_else(|| AudioError::UnknownDriver(name.to_string()))?;
        warn!(
            "[Audio] Couldn't find any audio driver named \"{}\", falling back to \"{}\"",
            name, fallback.name
        );
        Ok(fallback)
    }

    /// Open the backend called `name`
    ///
    /// Unknown names fall back to the first registered backend.
    ///
    /// # Errors
    ///
    /// [`AudioError::UnknownDriver`] if the registry is empty, or whatever the
    /// backend's factory returns.
    pub fn open(&self, name: &str, params: &DriverParams) -> Result<OpenedDriver> {
        let (name, factory) = self.factory(name)?;
        open_with(&name, &factory, params)
    }

    /// Resolved name and a shareable handle to its factory
    ///
    /// Lets a caller re-open the same backend later without keeping the
    /// registry around. Unknown names fall back like [`DriverRegistry::open`].
    pub fn factory(&self, name: &str) -> Result<(String, DriverFactory)> {
        let entry = self.resolve(name)?;
        Ok((entry.name.clone(), Arc::clone(&entry.factory)))
    }

    /// Devices the backend called `name` can open
    ///
    /// Backends registered without an enumerator report no devices.
    pub fn device_list(&self, name: &str) -> Result<Vec<String>> {
        let entry = self.resolve(name)?;
        Ok(entry.devices.as_ref().map(|list| list()).unwrap_or_default())
    }
}

/// Run a factory obtained from [`DriverRegistry::factory`]
pub fn open_with(name: &str, factory: &DriverFactory, params: &DriverParams) -> Result<OpenedDriver> {
    let opened = factory(params)?;
    info!(
        "[Audio] Started \"{}\" driver at {} Hz (requested {} Hz, {} ms)",
        name, opened.rate, params.rate, params.latency_ms
    );
    Ok(opened)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_include_null() {
        let registry = DriverRegistry::with_defaults();
        assert!(registry.contains("null"));
        assert_eq!(registry.names().last(), Some(&"null"));
    }

    #[test]
    fn test_open_by_name() {
        let registry = DriverRegistry::with_defaults();
        let opened = registry.open("null", &DriverParams::new(48_000, 64)).unwrap();
        assert_eq!(opened.driver.ident(), "null");
        assert_eq!(opened.rate, 48_000);
    }

    #[test]
    fn test_unknown_name_falls_back_to_first() {
        let mut registry = DriverRegistry::new();
        registry.register("null", null::NullDriver::open);
        let opened = registry
            .open("does-not-exist", &DriverParams::new(44_100, 64))
            .unwrap();
        assert_eq!(opened.driver.ident(), "null");
    }

    #[test]
    fn test_empty_registry_fails() {
        let registry = DriverRegistry::new();
        let result = registry.open("null", &DriverParams::new(48_000, 64));
        assert!(matches!(result, Err(AudioError::UnknownDriver(_))));
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut registry = DriverRegistry::new();
        registry.register("null", null::NullDriver::open);
        registry.register("null", |_params: &DriverParams| {
            Err(AudioError::DriverInit("replaced".into()))
        });
        assert_eq!(registry.names(), vec!["null"]);
        assert!(registry.open("null", &DriverParams::new(48_000, 64)).is_err());
    }

    #[test]
    fn test_device_list_through_registry() {
        let mut registry = DriverRegistry::new();
        registry.register_with_devices("sim", null::NullDriver::open, || {
            vec!["hw:0,0".to_string(), "default".to_string()]
        });
        registry.register("null", null::NullDriver::open);

        assert_eq!(registry.device_list("sim").unwrap().len(), 2);
        assert!(registry.device_list("null").unwrap().is_empty());
    }
}
