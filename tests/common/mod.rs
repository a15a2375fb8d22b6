//! A register-file stand-in for a PCA9685.

#![allow(dead_code)]

use std::cell::Cell;

use pca9685::I2cBus;

pub const MODE1: u8 = 0x00;
pub const MODE2: u8 = 0x01;
pub const PRE_SCALE: u8 = 0xFE;
pub const ALL_LED_ON_L: u8 = 0xFA;

pub const RESTART: u8 = 1 << 7;
pub const AI: u8 = 1 << 5;
pub const SLEEP: u8 = 1 << 4;

/// Behaves like the chip's 256 registers.
///
/// Writing 1 to MODE1 RESTART clears it and writing 0 leaves it alone, as
/// on the real part. Successful transfers are logged; `transfers` counts
/// every attempt including failed ones.
pub struct FakePca9685 {
    pub registers: [u8; 256],
    pub writes: Vec<(u8, Vec<u8>)>,
    pub reads: Vec<(u8, usize)>,
    pub transfers: usize,
    pub ensure_ready_calls: usize,
    pub bus_broken: bool,
    successes_before_failure: Cell<usize>,
    failures_pending: Cell<usize>,
}

impl FakePca9685 {
    pub fn new() -> FakePca9685 {
        let mut registers = [0u8; 256];
        // Power-on defaults: asleep, ALLCALL on, OUTDRV on, prescale for 200 Hz
        registers[MODE1 as usize] = 0x11;
        registers[MODE2 as usize] = 0x04;
        registers[PRE_SCALE as usize] = 0x1E;
        FakePca9685 {
            registers,
            writes: Vec::new(),
            reads: Vec::new(),
            transfers: 0,
            ensure_ready_calls: 0,
            bus_broken: false,
            successes_before_failure: Cell::new(0),
            failures_pending: Cell::new(0),
        }
    }

    /// Make the next `count` transfer attempts fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_after(0, count);
    }

    /// Let `successes` attempts through, then fail the `count` after them.
    pub fn fail_after(&self, successes: usize, count: usize) {
        self.successes_before_failure.set(successes);
        self.failures_pending.set(count);
    }

    pub fn writes_to(&self, register: u8) -> Vec<Vec<u8>> {
        self.writes
            .iter()
            .filter(|(r, _)| *r == register)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    fn attempt(&mut self) -> Result<(), ()> {
        self.transfers += 1;
        let successes = self.successes_before_failure.get();
        if successes > 0 {
            self.successes_before_failure.set(successes - 1);
            return Ok(());
        }
        let pending = self.failures_pending.get();
        if pending > 0 {
            self.failures_pending.set(pending - 1);
            return Err(());
        }
        Ok(())
    }
}

impl I2cBus for FakePca9685 {
    type Error = ();

    fn write(&mut self, address: u8, register: u8, bytes: &[u8]) -> Result<(), ()> {
        assert_eq!(address, pca9685::DEFAULT_ADDRESS);
        self.attempt()?;
        self.writes.push((register, bytes.to_vec()));
        for (offset, byte) in bytes.iter().enumerate() {
            let index = register.wrapping_add(offset as u8) as usize;
            if index == MODE1 as usize {
                let old = self.registers[index];
                let restart = if byte & RESTART != 0 { 0 } else { old & RESTART };
                self.registers[index] = (byte & !RESTART) | restart;
            } else {
                self.registers[index] = *byte;
            }
        }
        Ok(())
    }

    fn read(&mut self, address: u8, register: u8, buffer: &mut [u8]) -> Result<(), ()> {
        assert_eq!(address, pca9685::DEFAULT_ADDRESS);
        self.attempt()?;
        self.reads.push((register, buffer.len()));
        for (offset, byte) in buffer.iter_mut().enumerate() {
            *byte = self.registers[register.wrapping_add(offset as u8) as usize];
        }
        Ok(())
    }

    fn ensure_ready(&mut self) -> Result<(), ()> {
        self.ensure_ready_calls += 1;
        if self.bus_broken {
            Err(())
        } else {
            Ok(())
        }
    }
}
