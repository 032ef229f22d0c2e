// MIT License
//
// Copyright (c) 2025 Ronan LE MEILLAT for SCTG Development
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Versioned persistence of setpoints and PID gains.
//!
//! The record lives in a fixed 48-byte region:
//!
//! | offset | size | field      |
//! |--------|------|------------|
//! | 0      | 8    | brew temp  |
//! | 8      | 8    | steam temp |
//! | 16     | 8    | kp         |
//! | 24     | 8    | ki         |
//! | 32     | 8    | kd         |
//! | 40     | 1    | version    |
//!
//! Reals are stored in native `f64` representation. The version byte is only
//! compared for equality against the expected flag; anything else means the
//! region has to be initialized again.

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::error::Result;
use crate::PidParameters;

pub const STORE_SIZE: usize = 48;

const ADDR_BREW_TEMP: usize = 0;
const ADDR_STEAM_TEMP: usize = 8;
const ADDR_KP: usize = 16;
const ADDR_KI: usize = 24;
const ADDR_KD: usize = 32;
const ADDR_VERSION: usize = 40;

/// Default expected version flag.
pub const VERSION_FLAG: u8 = 0x42;

/// Byte image of the persisted region.
pub type Image = [u8; STORE_SIZE];

/// Snapshot of everything that survives a power cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfigRecord {
    pub brew_temp: f64,
    pub steam_temp: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl ConfigRecord {
    pub fn tunings(&self) -> PidParameters {
        PidParameters::new(self.kp, self.ki, self.kd)
    }

    pub fn set_tunings(&mut self, params: PidParameters) {
        self.kp = params.kp;
        self.ki = params.ki;
        self.kd = params.kd;
    }

    /// Values a sane boiler could actually run with.
    pub fn is_plausible(&self) -> bool {
        self.brew_temp.is_finite() && self.steam_temp.is_finite() && self.tunings().is_valid()
    }

    fn encode(&self, flag: u8) -> Image {
        let mut image = [0u8; STORE_SIZE];
        put(&mut image, ADDR_BREW_TEMP, self.brew_temp);
        put(&mut image, ADDR_STEAM_TEMP, self.steam_temp);
        put(&mut image, ADDR_KP, self.kp);
        put(&mut image, ADDR_KI, self.ki);
        put(&mut image, ADDR_KD, self.kd);
        image[ADDR_VERSION] = flag;
        image
    }

    fn decode(image: &Image) -> Self {
        ConfigRecord {
            brew_temp: get(image, ADDR_BREW_TEMP),
            steam_temp: get(image, ADDR_STEAM_TEMP),
            kp: get(image, ADDR_KP),
            ki: get(image, ADDR_KI),
            kd: get(image, ADDR_KD),
        }
    }
}

fn put(image: &mut Image, addr: usize, value: f64) {
    image[addr..addr + 8].copy_from_slice(&value.to_ne_bytes());
}

fn get(image: &Image, addr: usize) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&image[addr..addr + 8]);
    f64::from_ne_bytes(bytes)
}

/// A fixed-size non-volatile byte region, read and written as a whole.
pub trait StorageRegion {
    fn read(&mut self, image: &mut Image) -> io::Result<()>;

    /// Replace the region content. Readers observe either the previous or
    /// the new image, never a mix of both.
    fn write(&mut self, image: &Image) -> io::Result<()>;
}

impl<T: StorageRegion + ?Sized> StorageRegion for &mut T {
    fn read(&mut self, image: &mut Image) -> io::Result<()> {
        (**self).read(image)
    }

    fn write(&mut self, image: &Image) -> io::Result<()> {
        (**self).write(image)
    }
}

/// RAM-backed region, starts out erased (all `0xFF`).
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    bytes: Image,
}

impl MemoryRegion {
    pub fn new() -> Self {
        MemoryRegion {
            bytes: [0xFF; STORE_SIZE],
        }
    }

    pub fn from_image(bytes: Image) -> Self {
        MemoryRegion { bytes }
    }

    pub fn image(&self) -> &Image {
        &self.bytes
    }
}

impl Default for MemoryRegion {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageRegion for MemoryRegion {
    fn read(&mut self, image: &mut Image) -> io::Result<()> {
        image.copy_from_slice(&self.bytes);
        Ok(())
    }

    fn write(&mut self, image: &Image) -> io::Result<()> {
        self.bytes = *image;
        Ok(())
    }
}

/// File-backed region. A missing file reads as erased.
pub struct FileRegion {
    path: PathBuf,
}

impl FileRegion {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileRegion { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StorageRegion for FileRegion {
    fn read(&mut self, image: &mut Image) -> io::Result<()> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                image.fill(0xFF);
                let len = bytes.len().min(STORE_SIZE);
                image[..len].copy_from_slice(&bytes[..len]);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                image.fill(0xFF);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, image: &Image) -> io::Result<()> {
        let tmp = self.temp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(image)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }
}

/// Versioned configuration store on top of a [`StorageRegion`].
pub struct ConfigStore<R> {
    region: R,
    expected_flag: u8,
    retune_pending: bool, // Saves keep the flag invalid until the next boot
}

impl<R: StorageRegion> ConfigStore<R> {
    pub fn new(region: R, expected_flag: u8) -> Self {
        ConfigStore {
            region,
            expected_flag,
            retune_pending: false,
        }
    }

    pub fn expected_flag(&self) -> u8 {
        self.expected_flag
    }

    /// Read the stored record.
    ///
    /// Returns `Ok(None)` when the region is uninitialized: the version byte
    /// does not match, or the values behind a matching byte are implausible.
    pub fn load(&mut self) -> Result<Option<ConfigRecord>> {
        let mut image = [0u8; STORE_SIZE];
        self.region.read(&mut image)?;

        let flag = image[ADDR_VERSION];
        if flag != self.expected_flag {
            warn!(
                "Stored version flag {:#04x} does not match {:#04x}, store needs initialization",
                flag, self.expected_flag
            );
            return Ok(None);
        }

        let record = ConfigRecord::decode(&image);
        if !record.is_plausible() {
            warn!("Stored configuration {:?} is implausible, store needs initialization", record);
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Persist all five values together with the version flag.
    ///
    /// The flag is valid unless an autotune run is pending for the next boot.
    pub fn save(&mut self, record: &ConfigRecord) -> Result<()> {
        self.region.write(&record.encode(self.stored_flag()))?;
        info!(
            "Configuration saved: brew {:.1}°C, steam {:.1}°C, kp {:.3}, ki {:.3}, kd {:.3}",
            record.brew_temp, record.steam_temp, record.kp, record.ki, record.kd
        );
        Ok(())
    }

    /// Invalidate the version flag so the next boot schedules an autotune run.
    ///
    /// Stored values stay as they are, and later saves in this session keep
    /// the flag invalid.
    pub fn request_autotune(&mut self) -> Result<()> {
        self.retune_pending = true;
        let mut image = [0u8; STORE_SIZE];
        self.region.read(&mut image)?;
        image[ADDR_VERSION] = self.stored_flag();
        self.region.write(&image)?;
        info!("Autotune requested for next boot");
        Ok(())
    }

    /// Keep (or stop keeping) the version flag invalid on every save.
    ///
    /// Nothing is written until the next [`save`](Self::save).
    pub fn set_retune_pending(&mut self, pending: bool) {
        self.retune_pending = pending;
    }

    pub fn is_retune_pending(&self) -> bool {
        self.retune_pending
    }

    fn stored_flag(&self) -> u8 {
        if self.retune_pending {
            self.expected_flag.wrapping_add(1)
        } else {
            self.expected_flag
        }
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    pub fn into_region(self) -> R {
        self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ConfigRecord {
        ConfigRecord {
            brew_temp: 93.5,
            steam_temp: 140.0,
            kp: 612.25,
            ki: 31.0,
            kd: 2890.125,
        }
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let mut store = ConfigStore::new(MemoryRegion::new(), VERSION_FLAG);
        store.save(&record()).unwrap();
        assert_eq!(store.load().unwrap(), Some(record()));
    }

    #[test]
    fn test_byte_layout() {
        let mut store = ConfigStore::new(MemoryRegion::new(), VERSION_FLAG);
        store.save(&record()).unwrap();
        let image = store.region().image();

        assert_eq!(&image[0..8], &93.5f64.to_ne_bytes());
        assert_eq!(&image[8..16], &140.0f64.to_ne_bytes());
        assert_eq!(&image[16..24], &612.25f64.to_ne_bytes());
        assert_eq!(&image[24..32], &31.0f64.to_ne_bytes());
        assert_eq!(&image[32..40], &2890.125f64.to_ne_bytes());
        assert_eq!(image[40], VERSION_FLAG);
    }

    #[test]
    fn test_erased_region_is_uninitialized() {
        let mut store = ConfigStore::new(MemoryRegion::new(), VERSION_FLAG);
        assert_eq!(store.load().unwrap(), None);

        // Once defaults are written the next load succeeds
        store.save(&record()).unwrap();
        assert_eq!(store.load().unwrap(), Some(record()));
    }

    #[test]
    fn test_other_flag_value_is_uninitialized() {
        let mut image = record().encode(VERSION_FLAG);
        image[40] = 0x41;
        let mut store = ConfigStore::new(MemoryRegion::from_image(image), VERSION_FLAG);
        assert_eq!(store.load().unwrap(), None);

        // Same bytes are valid for a store expecting that flag
        let mut store = ConfigStore::new(MemoryRegion::from_image(image), 0x41);
        assert_eq!(store.load().unwrap(), Some(record()));
    }

    #[test]
    fn test_implausible_values_behind_valid_flag() {
        let mut bad = record();
        bad.ki = -3.0;
        let image = bad.encode(VERSION_FLAG);
        let mut store = ConfigStore::new(MemoryRegion::from_image(image), VERSION_FLAG);
        assert_eq!(store.load().unwrap(), None);

        let mut image = record().encode(VERSION_FLAG);
        image[0..8].copy_from_slice(&f64::NAN.to_ne_bytes());
        let mut store = ConfigStore::new(MemoryRegion::from_image(image), VERSION_FLAG);
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_request_autotune_invalidates_flag_only() {
        let mut store = ConfigStore::new(MemoryRegion::new(), VERSION_FLAG);
        store.save(&record()).unwrap();
        store.request_autotune().unwrap();

        assert_eq!(store.load().unwrap(), None);
        let image = store.region().image();
        assert_eq!(image[40], VERSION_FLAG + 1);
        assert_eq!(ConfigRecord::decode(image), record());
    }

    #[test]
    fn test_request_autotune_wraps_flag() {
        let mut store = ConfigStore::new(MemoryRegion::new(), 0xFF);
        store.save(&record()).unwrap();
        store.request_autotune().unwrap();
        assert_eq!(store.region().image()[40], 0x00);
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_after_request_autotune_keeps_flag_invalid() {
        let mut store = ConfigStore::new(MemoryRegion::new(), VERSION_FLAG);
        store.save(&record()).unwrap();
        store.request_autotune().unwrap();
        assert!(store.is_retune_pending());

        let mut updated = record();
        updated.brew_temp = 94.0;
        store.save(&updated).unwrap();
        assert_eq!(store.region().image()[40], VERSION_FLAG + 1);
        assert_eq!(ConfigRecord::decode(store.region().image()), updated);
        assert_eq!(store.load().unwrap(), None);

        // Cleared once the run has happened
        store.set_retune_pending(false);
        store.save(&updated).unwrap();
        assert_eq!(store.load().unwrap(), Some(updated));
    }

    #[test]
    fn test_file_region_round_trip() {
        let path = std::env::temp_dir().join(format!("boiler-store-{}.eeprom", std::process::id()));
        let _ = fs::remove_file(&path);

        let mut store = ConfigStore::new(FileRegion::new(&path), VERSION_FLAG);
        assert_eq!(store.load().unwrap(), None, "missing file reads as erased");
        store.save(&record()).unwrap();

        let mut reopened = ConfigStore::new(FileRegion::new(&path), VERSION_FLAG);
        assert_eq!(reopened.load().unwrap(), Some(record()));
        assert_eq!(fs::metadata(&path).unwrap().len(), STORE_SIZE as u64);

        let _ = fs::remove_file(&path);
    }
}
