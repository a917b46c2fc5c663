// THEORY:
// The `gpio` module is the lowest layer of the weight subsystem. It hides *how*
// a pin is toggled behind a small capability set (`PinBackend`) so that the HX711
// driver only ever speaks in terms of "set this pin as input", "write high",
// "read level", and "hold for N microseconds".
//
// Key architectural principles:
// 1.  **Capability Set**: Any type that can satisfy the six operations is a valid
//     backend. The driver is generic over it and never names a concrete one.
// 2.  **Deterministic Delays**: The default `sleep_us` is a spin on the monotonic
//     clock. Scheduler sleeps have millisecond granularity on a loaded Pi, which is
//     enough to stretch a clock pulse past the chip's 50 µs power-down limit.
// 3.  **Owned Handles**: A backend is an owned value. `close` releases the pins and
//     must be safe to call more than once; the driver calls it from `Drop`.
// 4.  **Fallback at Construction**: `open_with_fallback` tries a preferred backend
//     and quietly drops to the fallback when it is unavailable. On Linux the
//     character device (`/dev/gpiochipN`) is preferred and sysfs is the fallback.
// 5.  **BCM Numbering**: callers always pass BCM line numbers. The character
//     device takes them as line offsets directly; sysfs adds the base of the
//     gpiochip, which recent Raspberry Pi kernels no longer place at 0.

use crate::error::{Result, SenseError};
use gpio_cdev::{Chip, LineHandle, LineRequestFlags};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// BCM pin number.
pub type Pin = u8;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";
pub const DEFAULT_GPIO_CHIP: &str = "/dev/gpiochip0";

const CONSUMER: &str = "zotbin-hx711";

const EXPORT_SETTLE_TIMEOUT: Duration = Duration::from_millis(200);

/// Spins on the monotonic clock until `duration` has elapsed.
pub fn busy_wait(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

/// The capability set the HX711 driver needs from a GPIO implementation.
pub trait PinBackend {
    fn set_input(&mut self, pin: Pin) -> Result<()>;

    /// Configures `pin` as an output. Implementations drive it low.
    fn set_output(&mut self, pin: Pin) -> Result<()>;

    fn write(&mut self, pin: Pin, high: bool) -> Result<()>;

    fn read(&mut self, pin: Pin) -> Result<bool>;

    fn sleep_us(&mut self, us: u64) {
        busy_wait(Duration::from_micros(us));
    }

    /// Releases the pins. Must be idempotent.
    fn close(&mut self) {}
}

impl<B: PinBackend + ?Sized> PinBackend for Box<B> {
    fn set_input(&mut self, pin: Pin) -> Result<()> {
        (**self).set_input(pin)
    }

    fn set_output(&mut self, pin: Pin) -> Result<()> {
        (**self).set_output(pin)
    }

    fn write(&mut self, pin: Pin, high: bool) -> Result<()> {
        (**self).write(pin, high)
    }

    fn read(&mut self, pin: Pin) -> Result<bool> {
        (**self).read(pin)
    }

    fn sleep_us(&mut self, us: u64) {
        (**self).sleep_us(us)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

pub type BoxedBackend = Box<dyn PinBackend + Send>;

/// Builds the preferred backend, or the fallback when the preferred one cannot
/// be opened.
pub fn open_with_fallback<P, F>(preferred: P, fallback: F) -> Result<BoxedBackend>
where
    P: FnOnce() -> Result<BoxedBackend>,
    F: FnOnce() -> Result<BoxedBackend>,
{
    match preferred() {
        Ok(backend) => Ok(backend),
        Err(err) => {
            warn!("preferred gpio backend unavailable ({err}), falling back");
            fallback()
        }
    }
}

/// Which GPIO mechanism `AdcConfig::open_backend` uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Character device, falling back to sysfs.
    #[default]
    Auto,
    Cdev,
    Sysfs,
}

/// GPIO through the Linux character device (`/dev/gpiochipN`).
///
/// Each configured pin holds a line handle; reconfiguring a pin releases the
/// old handle first. Dropping the backend releases every line.
pub struct CdevBackend {
    chip: Chip,
    lines: HashMap<Pin, LineHandle>,
    closed: bool,
}

impl CdevBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let chip = Chip::new(path).map_err(|e| SenseError::Gpio(format!("{}: {e}", path.display())))?;
        info!(
            "opened {} ({}, {} lines)",
            path.display(),
            chip.label(),
            chip.num_lines()
        );
        Ok(Self {
            chip,
            lines: HashMap::new(),
            closed: false,
        })
    }

    pub fn boxed(path: impl AsRef<Path>) -> Result<BoxedBackend> {
        Ok(Box::new(Self::open(path)?))
    }

    fn request(&mut self, pin: Pin, flags: LineRequestFlags) -> Result<()> {
        if self.closed {
            return Err(SenseError::Gpio("backend already closed".into()));
        }
        self.lines.remove(&pin);
        let handle = self
            .chip
            .get_line(pin as u32)
            .and_then(|line| line.request(flags, 0, CONSUMER))
            .map_err(|e| SenseError::Gpio(format!("line {pin}: {e}")))?;
        self.lines.insert(pin, handle);
        Ok(())
    }

    fn handle(&self, pin: Pin) -> Result<&LineHandle> {
        self.lines
            .get(&pin)
            .ok_or_else(|| SenseError::Gpio(format!("line {pin} used before configuration")))
    }
}

impl PinBackend for CdevBackend {
    fn set_input(&mut self, pin: Pin) -> Result<()> {
        self.request(pin, LineRequestFlags::INPUT)
    }

    fn set_output(&mut self, pin: Pin) -> Result<()> {
        self.request(pin, LineRequestFlags::OUTPUT)
    }

    fn write(&mut self, pin: Pin, high: bool) -> Result<()> {
        self.handle(pin)?
            .set_value(high as u8)
            .map_err(|e| SenseError::Gpio(format!("line {pin}: {e}")))
    }

    fn read(&mut self, pin: Pin) -> Result<bool> {
        let value = self
            .handle(pin)?
            .get_value()
            .map_err(|e| SenseError::Gpio(format!("line {pin}: {e}")))?;
        Ok(value != 0)
    }

    fn close(&mut self) {
        self.closed = true;
        self.lines.clear();
    }
}

/// Lowest `base` among the gpiochips under a sysfs root, or 0 when none are listed.
pub fn sysfs_chip_base(root: &Path) -> u32 {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("gpiochip"))
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("base")).ok())
        .filter_map(|base| base.trim().parse::<u32>().ok())
        .min()
        .unwrap_or(0)
}

/// GPIO through the Linux sysfs interface (`/sys/class/gpio`).
pub struct SysfsBackend {
    root: PathBuf,
    base: u32,
    values: HashMap<Pin, File>,
    exported: Vec<u32>,
    closed: bool,
}

impl SysfsBackend {
    /// Opens `root`, numbering pins from the lowest gpiochip base found there.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let base = sysfs_chip_base(root.as_ref());
        Self::with_base(root, base)
    }

    pub fn with_base(root: impl AsRef<Path>, base: u32) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(SenseError::Gpio(format!(
                "sysfs gpio root {} does not exist",
                root.display()
            )));
        }
        debug!("sysfs gpio at {} with base {base}", root.display());
        Ok(Self {
            root,
            base,
            values: HashMap::new(),
            exported: Vec::new(),
            closed: false,
        })
    }

    pub fn boxed(root: impl AsRef<Path>, base: Option<u32>) -> Result<BoxedBackend> {
        let backend = match base {
            Some(base) => Self::with_base(root, base)?,
            None => Self::open(root)?,
        };
        Ok(Box::new(backend))
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    fn line(&self, pin: Pin) -> u32 {
        self.base + pin as u32
    }

    fn pin_dir(&self, pin: Pin) -> PathBuf {
        self.root.join(format!("gpio{}", self.line(pin)))
    }

    fn ensure_exported(&mut self, pin: Pin) -> Result<()> {
        let dir = self.pin_dir(pin);
        if dir.exists() {
            return Ok(());
        }
        let line = self.line(pin);
        write_attr(&self.root.join("export"), &line.to_string())?;
        self.exported.push(line);

        // udev creates the attribute files asynchronously after export.
        let start = Instant::now();
        while !dir.join("value").exists() {
            if start.elapsed() > EXPORT_SETTLE_TIMEOUT {
                return Err(SenseError::Gpio(format!("gpio{line} did not appear after export")));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        debug!("exported gpio{line} for pin {pin}");
        Ok(())
    }

    fn configure(&mut self, pin: Pin, direction: &str) -> Result<()> {
        if self.closed {
            return Err(SenseError::Gpio("backend already closed".into()));
        }
        self.ensure_exported(pin)?;
        let dir = self.pin_dir(pin);
        write_attr(&dir.join("direction"), direction)?;
        let value = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join("value"))
            .map_err(|e| SenseError::Gpio(format!("gpio{pin} value: {e}")))?;
        self.values.insert(pin, value);
        Ok(())
    }

    fn value_file(&mut self, pin: Pin) -> Result<&mut File> {
        self.values
            .get_mut(&pin)
            .ok_or_else(|| SenseError::Gpio(format!("gpio{pin} used before configuration")))
    }
}

fn write_attr(path: &Path, value: &str) -> Result<()> {
    std::fs::write(path, value)
        .map_err(|e| SenseError::Gpio(format!("writing {}: {e}", path.display())))
}

impl PinBackend for SysfsBackend {
    fn set_input(&mut self, pin: Pin) -> Result<()> {
        self.configure(pin, "in")
    }

    fn set_output(&mut self, pin: Pin) -> Result<()> {
        // "low" sets the direction and the initial level in one write.
        self.configure(pin, "low")
    }

    fn write(&mut self, pin: Pin, high: bool) -> Result<()> {
        let file = self.value_file(pin)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(if high { b"1" } else { b"0" })?;
        Ok(())
    }

    fn read(&mut self, pin: Pin) -> Result<bool> {
        let file = self.value_file(pin)?;
        file.seek(SeekFrom::Start(0))?;
        let mut level = [0u8; 1];
        file.read_exact(&mut level)?;
        Ok(level[0] == b'1')
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.values.clear();
        for line in self.exported.drain(..) {
            if let Err(err) = std::fs::write(self.root.join("unexport"), line.to_string()) {
                debug!("unexport gpio{line} failed: {err}");
            }
        }
    }
}

impl Drop for SysfsBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Adapts a pair of `embedded-hal` pins and a delay provider to `PinBackend`.
///
/// The pin numbers only route calls: `write` must target the clock pin and
/// `read` the data pin. Direction is fixed by the pin types, so `set_input` and
/// `set_output` just validate the number.
pub struct HalBackend<CLK, DATA, D> {
    sck_pin: Pin,
    dout_pin: Pin,
    clock: CLK,
    data: DATA,
    delay: D,
}

impl<CLK, DATA, D> HalBackend<CLK, DATA, D>
where
    CLK: embedded_hal::digital::OutputPin,
    DATA: embedded_hal::digital::InputPin,
    D: embedded_hal::delay::DelayNs,
{
    pub fn new(sck_pin: Pin, clock: CLK, dout_pin: Pin, data: DATA, delay: D) -> Self {
        Self {
            sck_pin,
            dout_pin,
            clock,
            data,
            delay,
        }
    }

    fn check(&self, pin: Pin) -> Result<()> {
        if pin == self.sck_pin || pin == self.dout_pin {
            Ok(())
        } else {
            Err(SenseError::Gpio(format!("pin {pin} is not wired to this backend")))
        }
    }
}

fn hal_err<E: Debug>(err: E) -> SenseError {
    SenseError::Gpio(format!("{err:?}"))
}

impl<CLK, DATA, D> PinBackend for HalBackend<CLK, DATA, D>
where
    CLK: embedded_hal::digital::OutputPin,
    DATA: embedded_hal::digital::InputPin,
    D: embedded_hal::delay::DelayNs,
{
    fn set_input(&mut self, pin: Pin) -> Result<()> {
        self.check(pin)
    }

    fn set_output(&mut self, pin: Pin) -> Result<()> {
        self.check(pin)?;
        if pin == self.sck_pin {
            self.clock.set_low().map_err(hal_err)?;
        }
        Ok(())
    }

    fn write(&mut self, pin: Pin, high: bool) -> Result<()> {
        if pin != self.sck_pin {
            return Err(SenseError::Gpio(format!("pin {pin} is not an output")));
        }
        if high {
            self.clock.set_high().map_err(hal_err)
        } else {
            self.clock.set_low().map_err(hal_err)
        }
    }

    fn read(&mut self, pin: Pin) -> Result<bool> {
        if pin != self.dout_pin {
            return Err(SenseError::Gpio(format!("pin {pin} is not an input")));
        }
        self.data.is_high().map_err(hal_err)
    }

    fn sleep_us(&mut self, us: u64) {
        self.delay.delay_us(us.min(u32::MAX as u64) as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(lines: &[u32]) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        for line in lines {
            let dir = root.path().join(format!("gpio{line}"));
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("direction"), "in").unwrap();
            std::fs::write(dir.join("value"), "0").unwrap();
        }
        root
    }

    #[test]
    fn busy_wait_holds_at_least_the_requested_time() {
        let start = Instant::now();
        busy_wait(Duration::from_micros(200));
        assert!(start.elapsed() >= Duration::from_micros(200));
    }

    #[test]
    fn sysfs_configures_direction_and_levels() {
        let root = fake_sysfs(&[5, 6]);
        let mut backend = SysfsBackend::open(root.path()).unwrap();

        backend.set_input(5).unwrap();
        backend.set_output(6).unwrap();
        assert_eq!(std::fs::read_to_string(root.path().join("gpio6/direction")).unwrap(), "low");

        backend.write(6, true).unwrap();
        assert_eq!(std::fs::read_to_string(root.path().join("gpio6/value")).unwrap(), "1");

        std::fs::write(root.path().join("gpio5/value"), "1").unwrap();
        assert!(backend.read(5).unwrap());
    }

    #[test]
    fn sysfs_rejects_unconfigured_pins_and_closed_backend() {
        let root = fake_sysfs(&[5]);
        let mut backend = SysfsBackend::open(root.path()).unwrap();
        assert!(matches!(backend.read(5), Err(SenseError::Gpio(_))));

        backend.close();
        backend.close();
        assert!(matches!(backend.set_input(5), Err(SenseError::Gpio(_))));
    }

    struct Clk(std::rc::Rc<std::cell::Cell<bool>>);
    struct Data(bool);
    struct NoDelay(u64);

    impl embedded_hal::digital::ErrorType for Clk {
        type Error = core::convert::Infallible;
    }

    impl embedded_hal::digital::OutputPin for Clk {
        fn set_low(&mut self) -> std::result::Result<(), Self::Error> {
            self.0.set(false);
            Ok(())
        }

        fn set_high(&mut self) -> std::result::Result<(), Self::Error> {
            self.0.set(true);
            Ok(())
        }
    }

    impl embedded_hal::digital::ErrorType for Data {
        type Error = core::convert::Infallible;
    }

    impl embedded_hal::digital::InputPin for Data {
        fn is_high(&mut self) -> std::result::Result<bool, Self::Error> {
            Ok(self.0)
        }

        fn is_low(&mut self) -> std::result::Result<bool, Self::Error> {
            Ok(!self.0)
        }
    }

    impl embedded_hal::delay::DelayNs for NoDelay {
        fn delay_ns(&mut self, ns: u32) {
            self.0 += ns as u64;
        }
    }

    #[test]
    fn hal_backend_routes_by_pin() {
        let level = std::rc::Rc::new(std::cell::Cell::new(true));
        let mut backend = HalBackend::new(6, Clk(level.clone()), 5, Data(true), NoDelay(0));

        backend.set_output(6).unwrap();
        assert!(!level.get());
        backend.write(6, true).unwrap();
        assert!(level.get());
        assert!(backend.read(5).unwrap());
        backend.sleep_us(3);
        assert_eq!(backend.delay.0, 3000);

        assert!(matches!(backend.write(5, true), Err(SenseError::Gpio(_))));
        assert!(matches!(backend.read(6), Err(SenseError::Gpio(_))));
        assert!(matches!(backend.set_input(9), Err(SenseError::Gpio(_))));
    }

    #[test]
    fn missing_chip_falls_back_to_sysfs() {
        let root = fake_sysfs(&[6]);
        let sysfs = root.path().to_path_buf();
        let mut backend = open_with_fallback(
            || CdevBackend::boxed("/definitely/not/a/gpiochip"),
            move || SysfsBackend::boxed(&sysfs, None),
        )
        .unwrap();
        backend.set_output(6).unwrap();
        backend.write(6, true).unwrap();
        assert_eq!(std::fs::read_to_string(root.path().join("gpio6/value")).unwrap(), "1");
    }

    #[test]
    fn regular_file_is_not_a_gpiochip() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(CdevBackend::open(file.path()), Err(SenseError::Gpio(_))));
    }

    #[test]
    fn sysfs_offsets_pins_by_the_chip_base() {
        let root = fake_sysfs(&[517, 518]);
        for (chip, base) in [("gpiochip570", "570"), ("gpiochip512", "512\n")] {
            let dir = root.path().join(chip);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("base"), base).unwrap();
        }
        assert_eq!(sysfs_chip_base(root.path()), 512);

        let mut backend = SysfsBackend::open(root.path()).unwrap();
        assert_eq!(backend.base(), 512);
        backend.set_output(6).unwrap();
        backend.write(6, true).unwrap();
        assert_eq!(std::fs::read_to_string(root.path().join("gpio518/direction")).unwrap(), "low");
        assert_eq!(std::fs::read_to_string(root.path().join("gpio518/value")).unwrap(), "1");

        let pinned = SysfsBackend::with_base(root.path(), 0).unwrap();
        assert_eq!(pinned.base(), 0);
    }

    #[test]
    fn sysfs_exports_the_offset_line() {
        let root = fake_sysfs(&[]);
        std::fs::write(root.path().join("export"), "").unwrap();
        let mut backend = SysfsBackend::with_base(root.path(), 512).unwrap();
        // nothing creates gpio517 here, so the export times out after writing
        assert!(matches!(backend.set_input(5), Err(SenseError::Gpio(_))));
        assert_eq!(std::fs::read_to_string(root.path().join("export")).unwrap(), "517");
    }
}
