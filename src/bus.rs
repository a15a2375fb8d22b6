//! The transport the driver talks through.
//!
//! The driver never owns the bus. It only borrows something that implements
//! [`I2cBus`], so the same bus can be shared with other devices between
//! calls.

/// A register-oriented I²C transport.
///
/// Implement this for your platform's bus, or wrap an `embedded-hal` bus in
/// a [`HalBus`].
pub trait I2cBus {
    /// The error reported by the transport. The driver only records that a
    /// transfer failed, not why.
    type Error: core::fmt::Debug;

    /// Write `bytes` starting at `register` on the device at `address`.
    fn write(&mut self, address: u8, register: u8, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Fill `buffer` with bytes read starting at `register` on the device at
    /// `address`.
    fn read(&mut self, address: u8, register: u8, buffer: &mut [u8]) -> Result<(), Self::Error>;

    /// Bring the bus up if it isn't already.
    ///
    /// Called every time the driver resets the device, so it must be cheap
    /// when the bus is already running.
    fn ensure_ready(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// The longest write [`HalBus`] can send, not counting the register byte.
pub const MAX_WRITE_LEN: usize = 16;

/// Errors from a [`HalBus`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HalBusError<E> {
    /// The underlying `embedded-hal` bus failed
    Bus(E),
    /// More than [`MAX_WRITE_LEN`] bytes were passed to one write
    WriteTooLong,
}

/// Adapts any blocking `embedded-hal` 0.2 I²C bus to [`I2cBus`].
///
/// Writes go out as one transfer with the register number in front. Reads
/// use a combined write-read so the register pointer and the data phase
/// share a repeated start.
pub struct HalBus<I> {
    i2c: I,
}

impl<I, E> HalBus<I>
where
    I: embedded_hal::blocking::i2c::Write<Error = E>
        + embedded_hal::blocking::i2c::WriteRead<Error = E>,
    E: core::fmt::Debug,
{
    /// Wrap an `embedded-hal` bus.
    pub fn new(i2c: I) -> HalBus<I> {
        HalBus { i2c }
    }

    /// Give the wrapped bus back.
    pub fn release(self) -> I {
        self.i2c
    }
}

impl<I, E> I2cBus for HalBus<I>
where
    I: embedded_hal::blocking::i2c::Write<Error = E>
        + embedded_hal::blocking::i2c::WriteRead<Error = E>,
    E: core::fmt::Debug,
{
    type Error = HalBusError<E>;

    fn write(&mut self, address: u8, register: u8, bytes: &[u8]) -> Result<(), Self::Error> {
        if bytes.len() > MAX_WRITE_LEN {
            return Err(HalBusError::WriteTooLong);
        }
        let mut buffer = [0u8; MAX_WRITE_LEN + 1];
        buffer[0] = register;
        buffer[1..=bytes.len()].copy_from_slice(bytes);
        self.i2c
            .write(address, &buffer[..=bytes.len()])
            .map_err(HalBusError::Bus)
    }

    fn read(&mut self, address: u8, register: u8, buffer: &mut [u8]) -> Result<(), Self::Error> {
        self.i2c
            .write_read(address, &[register], buffer)
            .map_err(HalBusError::Bus)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use embedded_hal_mock::eh0::i2c::{Mock, Transaction};
    use std::vec;

    #[test]
    fn write_prefixes_register() {
        let expectations = [Transaction::write(0x40, vec![0x06, 1, 2, 3, 4])];
        let mut bus = HalBus::new(Mock::new(&expectations));
        bus.write(0x40, 0x06, &[1, 2, 3, 4]).unwrap();
        bus.release().done();
    }

    #[test]
    fn read_uses_write_read() {
        let expectations = [Transaction::write_read(0x41, vec![0xFE], vec![0x79])];
        let mut bus = HalBus::new(Mock::new(&expectations));
        let mut out = [0u8; 1];
        bus.read(0x41, 0xFE, &mut out).unwrap();
        assert_eq!(out, [0x79]);
        bus.release().done();
    }

    #[test]
    fn oversized_write_is_refused_without_touching_the_bus() {
        let mut bus = HalBus::new(Mock::new(&[]));
        let data = [0u8; MAX_WRITE_LEN + 1];
        assert!(matches!(
            bus.write(0x40, 0x00, &data),
            Err(HalBusError::WriteTooLong)
        ));
        bus.release().done();
    }
}
