// THEORY:
// The `hx711` module is the ADC line driver. The HX711 speaks a two-wire,
// clock-driven protocol: the chip pulls DOUT low when a conversion is ready, the
// host clocks out 24 data bits MSB first, and then clocks 1-3 extra pulses whose
// count selects the gain (and channel) of the *next* conversion.
//
// Key architectural principles:
// 1.  **Whole Cycles Only**: A read is one uninterruptible pulse train of 24 + N
//     edges. The driver takes `&mut self`, so two reads can never interleave on
//     the same pins, and nothing in here can be cancelled halfway through a train.
// 2.  **Timing Is Checked, Not Assumed**: Each half-period is held with the
//     backend's deterministic delay. The whole train is also timed against a
//     ceiling; if the OS preempted us long enough to break the pulse-width rules,
//     the sample is rejected as a `ReadError` instead of being trusted.
// 3.  **Sentinels Are Faults**: All-ones, max-positive and min-negative patterns
//     are what a floating or shorted line produces. They are never returned.
// 4.  **Gain Priming**: The gain pulses only take effect on the following cycle,
//     so construction performs one throwaway read.

use crate::core_modules::gpio::{Pin, PinBackend};
use crate::error::{Result, SenseError};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// One signed 24-bit conversion result.
pub type RawSample = i32;

pub const DATA_BITS: u32 = 24;
pub const RAW_MIN: RawSample = -(1 << 23);
pub const RAW_MAX: RawSample = (1 << 23) - 1;

const POWER_MODE_CHANGE_DELAY: Duration = Duration::from_micros(100);
const WAKE_DELAY: Duration = Duration::from_millis(1);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(1);

const SENTINELS: [(RawSample, &str); 3] = [
    (-1, "0xFFFFFF"),
    (RAW_MAX, "0x7FFFFF"),
    (RAW_MIN, "0x800000"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Gain {
    /// Channel A, gain 128.
    Gain128,
    /// Channel A, gain 64.
    Gain64,
    /// Channel B, gain 32.
    Gain32,
}

impl Gain {
    /// Extra clock pulses after the data bits that select this gain.
    pub fn pulse_count(&self) -> u32 {
        match self {
            Gain::Gain128 => 1,
            Gain::Gain64 => 3,
            Gain::Gain32 => 2,
        }
    }
}

impl TryFrom<u32> for Gain {
    type Error = SenseError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            128 => Ok(Gain::Gain128),
            64 => Ok(Gain::Gain64),
            32 => Ok(Gain::Gain32),
            other => Err(SenseError::Config(format!(
                "gain must be 128, 64 or 32 (got {other})"
            ))),
        }
    }
}

impl From<Gain> for u32 {
    fn from(gain: Gain) -> Self {
        match gain {
            Gain::Gain128 => 128,
            Gain::Gain64 => 64,
            Gain::Gain32 => 32,
        }
    }
}

/// Sign-extends the low 24 bits of `bits`.
pub fn decode_24(bits: u32) -> RawSample {
    let value = (bits & 0xFF_FFFF) as i32;
    if value & 0x80_0000 != 0 {
        value - (1 << 24)
    } else {
        value
    }
}

/// The 24-bit two's-complement pattern for `value`.
pub fn encode_24(value: RawSample) -> u32 {
    (value as u32) & 0xFF_FFFF
}

#[derive(Debug, Clone)]
pub struct Hx711Config {
    pub dout_pin: Pin,
    pub sck_pin: Pin,
    pub gain: Gain,
    pub ready_timeout: Duration,
    pub clock_delay_us: u64,
    pub max_read_duration: Duration,
}

impl Default for Hx711Config {
    fn default() -> Self {
        Self {
            dout_pin: 5,
            sck_pin: 6,
            gain: Gain::Gain128,
            ready_timeout: Duration::from_millis(800),
            clock_delay_us: 2,
            max_read_duration: Duration::from_micros(5000),
        }
    }
}

/// HX711 driver over any `PinBackend`. Owns the backend and closes it on drop.
pub struct Hx711<B: PinBackend> {
    backend: B,
    config: Hx711Config,
    powered_up: bool,
}

impl<B: PinBackend> Hx711<B> {
    pub fn new(backend: B, config: Hx711Config) -> Result<Self> {
        let mut hx = Self {
            backend,
            config,
            powered_up: false,
        };
        hx.backend.set_input(hx.config.dout_pin)?;
        hx.backend.set_output(hx.config.sck_pin)?;
        hx.wake()?;
        hx.prime_gain();
        Ok(hx)
    }

    pub fn config(&self) -> &Hx711Config {
        &self.config
    }

    /// One throwaway cycle so the configured gain is latched.
    fn prime_gain(&mut self) {
        match self.read_raw() {
            Ok(raw) => trace!("gain priming read returned {raw}"),
            Err(err) => debug!("gain priming read failed: {err}"),
        }
    }

    pub fn is_ready(&mut self) -> Result<bool> {
        Ok(!self.backend.read(self.config.dout_pin)?)
    }

    fn wait_ready(&mut self) -> Result<()> {
        let start = Instant::now();
        while !self.is_ready()? {
            if start.elapsed() >= self.config.ready_timeout {
                return Err(SenseError::NotReady {
                    timeout_ms: self.config.ready_timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(READY_POLL_INTERVAL);
        }
        Ok(())
    }

    /// One full clock pulse, sampling DOUT while SCK is high.
    fn pulse(&mut self) -> Result<bool> {
        let (sck, dout, hold) = (self.config.sck_pin, self.config.dout_pin, self.config.clock_delay_us);
        self.backend.write(sck, true)?;
        self.backend.sleep_us(hold);
        let bit = self.backend.read(dout)?;
        self.backend.write(sck, false)?;
        self.backend.sleep_us(hold);
        Ok(bit)
    }

    fn clock_only(&mut self) -> Result<()> {
        let (sck, hold) = (self.config.sck_pin, self.config.clock_delay_us);
        self.backend.write(sck, true)?;
        self.backend.sleep_us(hold);
        self.backend.write(sck, false)?;
        self.backend.sleep_us(hold);
        Ok(())
    }

    /// Reads one conversion.
    pub fn read_raw(&mut self) -> Result<RawSample> {
        if !self.powered_up {
            self.power_up()?;
        }
        self.wait_ready()?;

        let start = Instant::now();
        let mut bits: u32 = 0;
        for _ in 0..DATA_BITS {
            bits = (bits << 1) | self.pulse()? as u32;
        }
        for _ in 0..self.config.gain.pulse_count() {
            self.clock_only()?;
        }
        let elapsed = start.elapsed();

        if elapsed > self.config.max_read_duration {
            // A long enough stall resets the chip to gain 128; the next read re-primes.
            self.powered_up = false;
            return Err(SenseError::ReadError(format!(
                "read took {} us (limit {} us)",
                elapsed.as_micros(),
                self.config.max_read_duration.as_micros()
            )));
        }

        let raw = decode_24(bits);
        if let Some((_, pattern)) = SENTINELS.iter().find(|(value, _)| *value == raw) {
            return Err(SenseError::ReadError(format!("invalid raw ({pattern})")));
        }
        Ok(raw)
    }

    /// Holding SCK high for more than 60 µs puts the chip to sleep.
    pub fn power_down(&mut self) -> Result<()> {
        let sck = self.config.sck_pin;
        self.backend.write(sck, false)?;
        self.backend.sleep_us(self.config.clock_delay_us);
        self.backend.write(sck, true)?;
        self.backend.sleep_us(POWER_MODE_CHANGE_DELAY.as_micros() as u64);
        self.powered_up = false;
        Ok(())
    }

    fn wake(&mut self) -> Result<()> {
        self.backend.write(self.config.sck_pin, false)?;
        std::thread::sleep(WAKE_DELAY);
        self.powered_up = true;
        Ok(())
    }

    /// Wakes the chip. It resets to gain 128, so any other gain is re-primed.
    pub fn power_up(&mut self) -> Result<()> {
        let was_down = !self.powered_up;
        self.wake()?;
        if was_down && self.config.gain != Gain::Gain128 {
            self.prime_gain();
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.backend.close();
    }
}

impl<B: PinBackend> Drop for Hx711<B> {
    fn drop(&mut self) {
        self.close();
    }
}
