//! The flat register plane.
//!
//! One image per unit id, each behind its own RW lock, so concurrent reads
//! of disjoint slices never contend and a reflector rewrite of one device
//! does not stall reads of the others. Flat addresses are resolved with
//! stride arithmetic; a range that runs past the last unit is an illegal
//! data address.

use std::sync::RwLock;

use crate::frame::ExceptionCode;
use crate::map::{BIT_STRIDE, HOLDING_STRIDE, INPUT_STRIDE};

/// Register image of one device.
#[derive(Debug, Clone)]
pub struct UnitSlice {
    pub holding: [u16; HOLDING_STRIDE as usize],
    pub input: [u16; INPUT_STRIDE as usize],
    /// Coil bits 0..15, LSB = relative coil 0.
    pub coils: u16,
    /// Discrete input bits 0..15.
    pub discrete: u16,
}

impl Default for UnitSlice {
    fn default() -> Self {
        Self {
            holding: [0; HOLDING_STRIDE as usize],
            input: [0; INPUT_STRIDE as usize],
            coils: 0,
            discrete: 0,
        }
    }
}

/// All unit images; index 0 is unit id 1.
pub struct RegisterPlane {
    units: Vec<RwLock<UnitSlice>>,
}

impl RegisterPlane {
    pub fn new(unit_count: usize) -> Self {
        Self {
            units: (0..unit_count).map(|_| RwLock::new(UnitSlice::default())).collect(),
        }
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Mutate one unit's image under its write lock.
    pub fn update_unit(&self, unit_index: usize, f: impl FnOnce(&mut UnitSlice)) {
        if let Some(unit) = self.units.get(unit_index) {
            f(&mut unit.write().expect("plane lock poisoned"));
        }
    }

    /// Read a copy of one unit's image.
    pub fn unit(&self, unit_index: usize) -> Option<UnitSlice> {
        self.units
            .get(unit_index)
            .map(|unit| unit.read().expect("plane lock poisoned").clone())
    }

    pub fn read_holding(&self, address: u16, quantity: u16) -> Result<Vec<u16>, ExceptionCode> {
        self.read_registers(address, quantity, HOLDING_STRIDE, |slice| &slice.holding[..])
    }

    pub fn read_input(&self, address: u16, quantity: u16) -> Result<Vec<u16>, ExceptionCode> {
        self.read_registers(address, quantity, INPUT_STRIDE, |slice| &slice.input[..])
    }

    pub fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ExceptionCode> {
        self.read_bits(address, quantity, |slice| slice.coils)
    }

    pub fn read_discrete(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ExceptionCode> {
        self.read_bits(address, quantity, |slice| slice.discrete)
    }

    /// Store a single holding register at a flat address.
    pub fn write_holding(&self, address: u16, value: u16) -> Result<(), ExceptionCode> {
        let unit = (address / HOLDING_STRIDE) as usize;
        let rel = (address % HOLDING_STRIDE) as usize;
        let slot = self.units.get(unit).ok_or(ExceptionCode::IllegalDataAddress)?;
        slot.write().expect("plane lock poisoned").holding[rel] = value;
        Ok(())
    }

    /// Store a single coil bit at a flat address.
    pub fn write_coil(&self, address: u16, value: bool) -> Result<(), ExceptionCode> {
        let unit = (address / BIT_STRIDE) as usize;
        let rel = address % BIT_STRIDE;
        let slot = self.units.get(unit).ok_or(ExceptionCode::IllegalDataAddress)?;
        let mut slice = slot.write().expect("plane lock poisoned");
        if value {
            slice.coils |= 1 << rel;
        } else {
            slice.coils &= !(1 << rel);
        }
        Ok(())
    }

    fn read_registers(
        &self,
        address: u16,
        quantity: u16,
        stride: u16,
        area: impl Fn(&UnitSlice) -> &[u16],
    ) -> Result<Vec<u16>, ExceptionCode> {
        let end = address as u32 + quantity as u32 - 1;
        if (end / stride as u32) as usize >= self.units.len() {
            return Err(ExceptionCode::IllegalDataAddress);
        }

        let mut values = Vec::with_capacity(quantity as usize);
        let mut addr = address as u32;
        while addr <= end {
            let unit = (addr / stride as u32) as usize;
            let rel = (addr % stride as u32) as usize;
            let take = ((stride as u32 - rel as u32).min(end - addr + 1)) as usize;
            let slice = self.units[unit].read().expect("plane lock poisoned");
            values.extend_from_slice(&area(&slice)[rel..rel + take]);
            addr += take as u32;
        }
        Ok(values)
    }

    fn read_bits(
        &self,
        address: u16,
        quantity: u16,
        area: impl Fn(&UnitSlice) -> u16,
    ) -> Result<Vec<bool>, ExceptionCode> {
        let end = address as u32 + quantity as u32 - 1;
        if (end / BIT_STRIDE as u32) as usize >= self.units.len() {
            return Err(ExceptionCode::IllegalDataAddress);
        }

        let mut bits = Vec::with_capacity(quantity as usize);
        for addr in address as u32..=end {
            let unit = (addr / BIT_STRIDE as u32) as usize;
            let rel = addr % BIT_STRIDE as u32;
            let word = area(&self.units[unit].read().expect("plane lock poisoned"));
            bits.push(word & (1 << rel) != 0);
        }
        Ok(bits)
    }
}
