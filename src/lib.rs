//! # PCA9685 Driver
//!
//! This is a driver for the NXP PCA9685 16-channel, 12-bit PWM controller.
//!
//! The PCA9685 has sixteen outputs which all share one PWM frequency, set by
//! a prescaler on a 25 MHz internal oscillator. Each output has its own
//! 12-bit "turn on" and "turn off" tick within the 4096-tick period, plus a
//! full-on and a full-off override bit which bypass the counter entirely.
//!
//! The [`Pca9685`] object borrows your bus (anything implementing
//! [`I2cBus`]) and turns PWM requests into register transfers. Each transfer
//! is retried a configurable number of times. Every failure is recorded in an
//! [`ErrorFlags`] bitmask which stays set until you clear it, so you can check
//! what went wrong after a whole sequence of calls.
//!
//! Sequences which touch several registers (changing the frequency, waking
//! up) are not transactional. If one step fails the driver stops there and
//! the chip may be left half-configured. Call [`Pca9685::reset`] to get back
//! to a known state.
//!
//! # Example
//!
//! You might drive a hobby servo like this:
//!
//! ```rust
//! # struct Bus;
//! # impl pca9685::I2cBus for Bus {
//! #     type Error = ();
//! #     fn write(&mut self, _: u8, _: u8, _: &[u8]) -> Result<(), ()> { Ok(()) }
//! #     fn read(&mut self, _: u8, _: u8, buf: &mut [u8]) -> Result<(), ()> {
//! #         buf.fill(0);
//! #         Ok(())
//! #     }
//! # }
//! # let mut bus = Bus;
//! let mut pwm = pca9685::Pca9685::new(&mut bus, pca9685::DEFAULT_ADDRESS);
//! pwm.set_retries(2);
//! if let Err(e) = pwm.reset() {
//!     // PCA9685 didn't respond
//! }
//! pwm.set_output_driver(pca9685::OutputDriver::TotemPole).unwrap();
//! pwm.set_pwm_frequency(50.0).unwrap();
//! // 1.5 ms pulse in a 20 ms period
//! pwm.set_pwm(0, 0, 307).unwrap();
//! pwm.set_channel_full_off(1).unwrap();
//! assert!(!pwm.has_any_error());
//! ```

#![no_std]
#![deny(unsafe_code)]
#![deny(missing_docs)]

mod bus;

pub use bus::{HalBus, HalBusError, I2cBus, MAX_WRITE_LEN};

use thiserror_no_std::Error as ThisError;

//
// Public Types
//

/// The categories of fault the driver can report.
///
/// Each one is a single bit, so several can be collected in [`ErrorFlags`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, ThisError)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum Error {
    /// An I²C write failed on every attempt
    #[error("I²C write failed")]
    I2cWrite = 1 << 0,
    /// An I²C read failed on every attempt
    #[error("I²C read failed")]
    I2cRead = 1 << 1,
    /// A parameter made no sense
    #[error("invalid parameter")]
    InvalidParam = 1 << 2,
    /// The device did not respond.
    ///
    /// The driver never raises this itself; it is here for bus-probing code
    /// to report through [`Pca9685::record_error`].
    #[error("device not found")]
    DeviceNotFound = 1 << 3,
    /// The device has not been reset yet
    #[error("device not initialized")]
    NotInitialized = 1 << 4,
    /// A channel, tick count or frequency was outside what the PCA9685 supports
    #[error("value out of range")]
    OutOfRange = 1 << 5,
}

/// A set of [`Error`] categories.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorFlags(u16);

/// How the sixteen outputs are driven. See MODE2 OUTDRV in the datasheet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OutputDriver {
    /// Outputs are open-drain
    OpenDrain = 0,
    /// Outputs are push-pull. This is the power-on default.
    TotemPole = 1,
}

/// What a channel is currently programmed to do, as read back from the chip.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelState {
    /// Tick at which the output turns on (0..=4095)
    pub on: u16,
    /// Tick at which the output turns off (0..=4095)
    pub off: u16,
    /// The full-on override bit is set
    pub full_on: bool,
    /// The full-off override bit is set. This wins over `full_on`.
    pub full_off: bool,
}

/// Represents the state of one PCA9685 on a borrowed bus.
pub struct Pca9685<'a, B> {
    bus: &'a mut B,
    address: u8,
    initialized: bool,
    last_error: Option<Error>,
    error_flags: ErrorFlags,
    retries: u8,
    retry_delay: Option<&'a mut dyn FnMut()>,
}

//
// Private Types
//

/// The registers in the PCA9685 that this driver uses
#[derive(Copy, Clone, Debug)]
enum Register {
    Mode1 = 0x00,
    Mode2 = 0x01,
    Led0OnL = 0x06,
    AllLedOnL = 0xFA,
    PreScale = 0xFE,
}

//
// Public Data
//

/// The address of a PCA9685 with all six address pins tied low.
pub const DEFAULT_ADDRESS: u8 = 0x40;

/// Number of PWM outputs
pub const NUM_CHANNELS: u8 = 16;

/// Highest tick value in a PWM period
pub const MAX_TICK: u16 = 4095;

/// Frequency of the internal oscillator, in Hz
pub const OSCILLATOR_HZ: u32 = 25_000_000;

/// Lowest PWM frequency the internal oscillator can produce, in Hz
pub const MIN_FREQUENCY_HZ: f32 = 24.0;

/// Highest PWM frequency the internal oscillator can produce, in Hz
pub const MAX_FREQUENCY_HZ: f32 = 1526.0;

/// Smallest value the chip accepts in PRE_SCALE
pub const MIN_PRESCALE: u8 = 3;

/// Number of extra attempts per transfer for a new [`Pca9685`]
pub const DEFAULT_RETRIES: u8 = 3;

//
// Private Data
//

const MODE1_RESTART: u8 = 1 << 7;
const MODE1_AI: u8 = 1 << 5;
const MODE1_SLEEP: u8 = 1 << 4;

const MODE2_INVRT: u8 = 1 << 4;
const MODE2_OUTDRV: u8 = 1 << 2;

/// Bit 4 of LEDn_ON_H / LEDn_OFF_H
const FULL_BIT: u8 = 1 << 4;

//
// Public Functions
//

/// Work out the PRE_SCALE value for a PWM frequency.
///
/// This is `round(25 MHz / (4096 * freq_hz)) - 1` with halves rounded up,
/// clamped to the 3..=255 the chip accepts. The clamp only matters at the
/// very edges of the 24..=1526 Hz range; it does not make other frequencies
/// valid.
pub fn calc_prescale(freq_hz: f32) -> u8 {
    let ideal = OSCILLATOR_HZ as f32 / (4096.0 * freq_hz);
    let prescale = ((ideal + 0.5) as i32).saturating_sub(1);
    prescale.clamp(i32::from(MIN_PRESCALE), i32::from(u8::MAX)) as u8
}

/// Convert a duty cycle into an off-tick, with the on-tick at zero.
///
/// The duty cycle is clamped into 0.0..=1.0 and NaN counts as 0.0. Halves
/// round up.
pub fn duty_to_ticks(duty: f32) -> u16 {
    let duty = if duty.is_nan() {
        0.0
    } else {
        duty.clamp(0.0, 1.0)
    };
    // Exact in f64, so only true halves round up
    (f64::from(duty) * f64::from(MAX_TICK) + 0.5) as u16
}

//
// impls on Public Types
//

impl Error {
    /// This category as a bitmask
    pub const fn bits(self) -> u16 {
        self as u16
    }
}

impl ErrorFlags {
    /// No flags set
    pub const NONE: ErrorFlags = ErrorFlags(0);

    /// Every flag set
    pub const ALL: ErrorFlags = ErrorFlags(0xFFFF);

    /// Wrap a raw bitmask
    pub const fn from_bits(bits: u16) -> ErrorFlags {
        ErrorFlags(bits)
    }

    /// The raw bitmask
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Is this category in the set?
    pub const fn contains(self, error: Error) -> bool {
        self.0 & error.bits() != 0
    }

    /// Is the set empty?
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Add a category to the set
    pub fn insert(&mut self, error: Error) {
        self.0 |= error.bits();
    }

    /// Remove every category in `mask` from the set
    pub fn remove(&mut self, mask: ErrorFlags) {
        self.0 &= !mask.0;
    }
}

impl From<Error> for ErrorFlags {
    fn from(error: Error) -> ErrorFlags {
        ErrorFlags(error.bits())
    }
}

impl core::ops::BitOr for ErrorFlags {
    type Output = ErrorFlags;

    fn bitor(self, rhs: ErrorFlags) -> ErrorFlags {
        ErrorFlags(self.0 | rhs.0)
    }
}

impl core::ops::BitOr<Error> for ErrorFlags {
    type Output = ErrorFlags;

    fn bitor(self, rhs: Error) -> ErrorFlags {
        ErrorFlags(self.0 | rhs.bits())
    }
}

impl core::ops::BitOr for Error {
    type Output = ErrorFlags;

    fn bitor(self, rhs: Error) -> ErrorFlags {
        ErrorFlags(self.bits() | rhs.bits())
    }
}

impl ChannelState {
    fn decode(bytes: [u8; 4]) -> ChannelState {
        ChannelState {
            on: u16::from(bytes[0]) | (u16::from(bytes[1] & 0x0F) << 8),
            off: u16::from(bytes[2]) | (u16::from(bytes[3] & 0x0F) << 8),
            full_on: bytes[1] & FULL_BIT != 0,
            full_off: bytes[3] & FULL_BIT != 0,
        }
    }
}

impl<'a, B> Pca9685<'a, B>
where
    B: I2cBus,
{
    /// Create a new PCA9685 proxy object.
    ///
    /// Nothing is sent on the bus until you call [`Pca9685::reset`] or
    /// [`Pca9685::ensure_initialized`]; every other operation fails with
    /// [`Error::NotInitialized`] until then.
    pub fn new(bus: &'a mut B, address: u8) -> Pca9685<'a, B> {
        Pca9685 {
            bus,
            address,
            initialized: false,
            last_error: None,
            error_flags: ErrorFlags::NONE,
            retries: DEFAULT_RETRIES,
            retry_delay: None,
        }
    }

    /// The 7-bit I²C address this object talks to
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The borrowed bus
    pub fn bus(&self) -> &B {
        &*self.bus
    }

    /// Has a reset completed successfully?
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Set how many extra attempts each register transfer gets after the
    /// first one fails. Zero means a single attempt.
    pub fn set_retries(&mut self, retries: u8) {
        self.retries = retries;
    }

    /// Set a function to call between a failed attempt and the next one.
    ///
    /// Typically this sleeps for a millisecond or so to let the bus recover.
    /// With `None` (the default) retries happen immediately. The function is
    /// never called after the last attempt.
    pub fn set_retry_delay(&mut self, delay: Option<&'a mut dyn FnMut()>) {
        self.retry_delay = delay;
    }

    /// Bring the bus up and reset the PCA9685.
    ///
    /// MODE1 is written with only auto-increment set, which wakes the
    /// oscillator and leaves RESTART alone. Other registers keep their
    /// values.
    pub fn reset(&mut self) -> Result<(), Error> {
        if self.bus.ensure_ready().is_err() {
            #[cfg(feature = "defmt")]
            defmt::warn!("PCA9685 0x{:02x} bus not ready", self.address);
            return Err(self.fail(Error::I2cWrite));
        }
        self.write_register(Register::Mode1 as u8, MODE1_AI)?;
        self.initialized = true;
        Ok(())
    }

    /// Reset the device, unless that has already been done.
    pub fn ensure_initialized(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Ok(());
        }
        self.reset()
    }

    /// Set the PWM frequency shared by every channel.
    ///
    /// `freq_hz` must be in 24.0..=1526.0. The chip only takes a new prescale
    /// while its oscillator is stopped, so this puts it to sleep, writes
    /// PRE_SCALE, then puts MODE1 back exactly as it was.
    ///
    /// Allow 500 µs for the oscillator to settle afterwards if the chip was
    /// awake.
    pub fn set_pwm_frequency(&mut self, freq_hz: f32) -> Result<(), Error> {
        self.check_initialized()?;
        if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&freq_hz) {
            return Err(self.fail(Error::OutOfRange));
        }
        let prescale = calc_prescale(freq_hz);
        let old_mode = self.read_register(Register::Mode1 as u8)?;
        self.write_register(
            Register::Mode1 as u8,
            (old_mode & !MODE1_RESTART) | MODE1_SLEEP,
        )?;
        self.write_register(Register::PreScale as u8, prescale)?;
        self.write_register(Register::Mode1 as u8, old_mode)
    }

    /// Read back the current PRE_SCALE value.
    pub fn prescale(&mut self) -> Result<u8, Error> {
        self.check_initialized()?;
        self.read_register(Register::PreScale as u8)
    }

    /// Set when a channel turns on and off within the 4096-tick period.
    ///
    /// `channel` must be below 16 and both ticks at most 4095. Writing this
    /// clears any full-on or full-off override on the channel.
    pub fn set_pwm(&mut self, channel: u8, on: u16, off: u16) -> Result<(), Error> {
        self.check_initialized()?;
        self.check_channel(channel)?;
        self.check_ticks(on, off)?;
        self.write_block(channel_register(channel), &encode_ticks(on, off))
    }

    /// Set a channel's duty cycle, from 0.0 (off) to 1.0 (on).
    ///
    /// Values outside that range are clamped rather than refused. The pulse
    /// starts at tick 0.
    pub fn set_duty(&mut self, channel: u8, duty: f32) -> Result<(), Error> {
        self.set_pwm(channel, 0, duty_to_ticks(duty))
    }

    /// Set every channel to the same on and off ticks in one transfer.
    pub fn set_all_pwm(&mut self, on: u16, off: u16) -> Result<(), Error> {
        self.check_initialized()?;
        self.check_ticks(on, off)?;
        self.write_block(Register::AllLedOnL as u8, &encode_ticks(on, off))
    }

    /// Force a channel permanently on, using its full-on bit.
    pub fn set_channel_full_on(&mut self, channel: u8) -> Result<(), Error> {
        self.check_initialized()?;
        self.check_channel(channel)?;
        self.write_block(channel_register(channel), &[0, FULL_BIT, 0, 0])
    }

    /// Force a channel permanently off, using its full-off bit.
    pub fn set_channel_full_off(&mut self, channel: u8) -> Result<(), Error> {
        self.check_initialized()?;
        self.check_channel(channel)?;
        self.write_block(channel_register(channel), &[0, 0, 0, FULL_BIT])
    }

    /// Read back what a channel is programmed to do.
    pub fn pwm(&mut self, channel: u8) -> Result<ChannelState, Error> {
        self.check_initialized()?;
        self.check_channel(channel)?;
        let mut bytes = [0u8; 4];
        self.read_block(channel_register(channel), &mut bytes)?;
        Ok(ChannelState::decode(bytes))
    }

    /// Put the PCA9685 into low-power sleep. The oscillator stops and all
    /// outputs go off. Sleeping twice is harmless.
    pub fn sleep(&mut self) -> Result<(), Error> {
        self.check_initialized()?;
        // RESTART is written as zero, which leaves it untouched on the chip
        self.modify_register(
            Register::Mode1 as u8,
            MODE1_SLEEP | MODE1_RESTART,
            MODE1_SLEEP,
        )
    }

    /// Wake the PCA9685 from sleep.
    ///
    /// If the chip reports RESTART, a second write sets it, which makes the
    /// outputs resume their previous PWM values. Allow 500 µs for the
    /// oscillator to settle before relying on the outputs.
    pub fn wake(&mut self) -> Result<(), Error> {
        self.check_initialized()?;
        let mode = self.read_register(Register::Mode1 as u8)?;
        let awake = mode & !(MODE1_SLEEP | MODE1_RESTART);
        self.write_register(Register::Mode1 as u8, awake)?;
        if mode & MODE1_RESTART != 0 {
            self.write_register(Register::Mode1 as u8, awake | MODE1_RESTART)?;
        }
        Ok(())
    }

    /// Invert the logic level of every output, e.g. for common-anode LEDs.
    pub fn set_output_invert(&mut self, invert: bool) -> Result<(), Error> {
        self.check_initialized()?;
        self.modify_register(
            Register::Mode2 as u8,
            MODE2_INVRT,
            if invert { MODE2_INVRT } else { 0 },
        )
    }

    /// Choose between push-pull and open-drain outputs.
    pub fn set_output_driver(&mut self, driver: OutputDriver) -> Result<(), Error> {
        self.check_initialized()?;
        self.modify_register(
            Register::Mode2 as u8,
            MODE2_OUTDRV,
            if driver == OutputDriver::TotemPole {
                MODE2_OUTDRV
            } else {
                0
            },
        )
    }

    /// Every fault seen since the flags were last cleared
    pub fn error_flags(&self) -> ErrorFlags {
        self.error_flags
    }

    /// Has this fault been seen since it was last cleared?
    pub fn has_error(&self, error: Error) -> bool {
        self.error_flags.contains(error)
    }

    /// Has any fault been seen since the flags were last cleared?
    pub fn has_any_error(&self) -> bool {
        !self.error_flags.is_empty()
    }

    /// The most recent fault, if any.
    ///
    /// Neither successful operations nor clearing flags reset this.
    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    /// Clear one fault category.
    pub fn clear_error(&mut self, error: Error) {
        self.clear_error_flags(error.into());
    }

    /// Clear every fault category in `mask`. Pass [`ErrorFlags::ALL`] to
    /// clear everything.
    pub fn clear_error_flags(&mut self, mask: ErrorFlags) {
        self.error_flags.remove(mask);
    }

    /// Clear every fault category.
    pub fn clear_all_errors(&mut self) {
        self.clear_error_flags(ErrorFlags::ALL);
    }

    /// Record a fault found by code outside the driver, such as a bus scan
    /// reporting [`Error::DeviceNotFound`].
    pub fn record_error(&mut self, error: Error) {
        self.fail(error);
    }

    /// Write one byte to a register, with retries.
    pub fn write_register(&mut self, register: u8, value: u8) -> Result<(), Error> {
        self.write_block(register, &[value])
    }

    /// Write consecutive registers starting at `register`, with retries.
    ///
    /// Needs MODE1 auto-increment, which [`Pca9685::reset`] turns on.
    pub fn write_block(&mut self, register: u8, bytes: &[u8]) -> Result<(), Error> {
        let address = self.address;
        #[cfg(feature = "defmt")]
        defmt::debug!(
            "Setting PCA9685 0x{:02x} register 0x{:02x} to {=[u8]:x}",
            address,
            register,
            bytes
        );
        if self.with_retries(|bus| bus.write(address, register, bytes)) {
            Ok(())
        } else {
            Err(self.fail(Error::I2cWrite))
        }
    }

    /// Read one register, with retries.
    pub fn read_register(&mut self, register: u8) -> Result<u8, Error> {
        let mut value = [0u8; 1];
        self.read_block(register, &mut value)?;
        Ok(value[0])
    }

    /// Fill `buffer` from consecutive registers starting at `register`, with
    /// retries.
    pub fn read_block(&mut self, register: u8, buffer: &mut [u8]) -> Result<(), Error> {
        let address = self.address;
        if self.with_retries(|bus| bus.read(address, register, &mut *buffer)) {
            #[cfg(feature = "defmt")]
            defmt::debug!(
                "Read PCA9685 0x{:02x} register 0x{:02x}: {=[u8]:x}",
                address,
                register,
                buffer
            );
            Ok(())
        } else {
            Err(self.fail(Error::I2cRead))
        }
    }

    /// Run one transfer up to `retries + 1` times. Returns whether any
    /// attempt succeeded.
    fn with_retries<F>(&mut self, mut attempt: F) -> bool
    where
        F: FnMut(&mut B) -> Result<(), B::Error>,
    {
        let mut remaining = self.retries;
        loop {
            if attempt(&mut *self.bus).is_ok() {
                return true;
            }
            if remaining == 0 {
                #[cfg(feature = "defmt")]
                defmt::warn!(
                    "PCA9685 0x{:02x} transfer failed after {=u8} retries",
                    self.address,
                    self.retries
                );
                return false;
            }
            remaining -= 1;
            #[cfg(feature = "defmt")]
            defmt::debug!("PCA9685 0x{:02x} transfer failed, retrying", self.address);
            if let Some(delay) = self.retry_delay.as_deref_mut() {
                delay();
            }
        }
    }

    /// Update some bits of a register, leaving the others as the chip has
    /// them.
    fn modify_register(&mut self, register: u8, mask: u8, value: u8) -> Result<(), Error> {
        let old = self.read_register(register)?;
        self.write_register(register, (old & !mask) | (value & mask))
    }

    fn check_initialized(&mut self) -> Result<(), Error> {
        if self.initialized {
            Ok(())
        } else {
            Err(self.fail(Error::NotInitialized))
        }
    }

    fn check_channel(&mut self, channel: u8) -> Result<(), Error> {
        if channel < NUM_CHANNELS {
            Ok(())
        } else {
            Err(self.fail(Error::OutOfRange))
        }
    }

    fn check_ticks(&mut self, on: u16, off: u16) -> Result<(), Error> {
        if on <= MAX_TICK && off <= MAX_TICK {
            Ok(())
        } else {
            Err(self.fail(Error::OutOfRange))
        }
    }

    /// Note a fault in both the bitmask and the last-error snapshot.
    fn fail(&mut self, error: Error) -> Error {
        self.last_error = Some(error);
        self.error_flags.insert(error);
        error
    }
}

//
// Private Functions
//

/// First of the four LEDn registers for a channel
fn channel_register(channel: u8) -> u8 {
    Register::Led0OnL as u8 + 4 * channel
}

/// Lay out on/off ticks as ON_L, ON_H, OFF_L, OFF_H
fn encode_ticks(on: u16, off: u16) -> [u8; 4] {
    [
        (on & 0xFF) as u8,
        ((on >> 8) & 0x0F) as u8,
        (off & 0xFF) as u8,
        ((off >> 8) & 0x0F) as u8,
    ]
}


//
// End of file
//
