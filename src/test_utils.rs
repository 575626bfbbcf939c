//! Shared test support: an in-memory [`Handler`] so field reads observe
//! earlier writes, and constructors for contexts wired to it.

use crate::{AmlContext, Handler};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use std::sync::Mutex;

/// A `Handler` backed by maps, so whatever the engine writes to a region it
/// can read back. Fatal ops are recorded rather than panicking.
pub(crate) struct TestHandler {
    memory: Mutex<BTreeMap<usize, u8>>,
    io: Mutex<BTreeMap<u16, u8>>,
    pci: Mutex<BTreeMap<u16, u8>>,
    sleeps: Arc<Mutex<Vec<u64>>>,
}

impl TestHandler {
    pub(crate) fn new() -> TestHandler {
        TestHandler {
            memory: Mutex::new(BTreeMap::new()),
            io: Mutex::new(BTreeMap::new()),
            pci: Mutex::new(BTreeMap::new()),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn read_bytes(map: &Mutex<BTreeMap<usize, u8>>, address: usize, bytes: usize) -> u64 {
        let map = map.lock().unwrap();
        let mut value = 0u64;
        for i in 0..bytes {
            value |= (*map.get(&(address + i)).unwrap_or(&0) as u64) << (i * 8);
        }
        value
    }

    fn write_bytes(map: &Mutex<BTreeMap<usize, u8>>, address: usize, bytes: usize, value: u64) {
        let mut map = map.lock().unwrap();
        for i in 0..bytes {
            map.insert(address + i, (value >> (i * 8)) as u8);
        }
    }

    fn read_io_bytes(&self, port: u16, bytes: u16) -> u64 {
        let map = self.io.lock().unwrap();
        let mut value = 0u64;
        for i in 0..bytes {
            value |= (*map.get(&(port + i)).unwrap_or(&0) as u64) << (i * 8);
        }
        value
    }

    fn write_io_bytes(&self, port: u16, bytes: u16, value: u64) {
        let mut map = self.io.lock().unwrap();
        for i in 0..bytes {
            map.insert(port + i, (value >> (i * 8)) as u8);
        }
    }

    fn read_pci_bytes(&self, offset: u16, bytes: u16) -> u64 {
        let map = self.pci.lock().unwrap();
        let mut value = 0u64;
        for i in 0..bytes {
            value |= (*map.get(&(offset + i)).unwrap_or(&0) as u64) << (i * 8);
        }
        value
    }

    fn write_pci_bytes(&self, offset: u16, bytes: u16, value: u64) {
        let mut map = self.pci.lock().unwrap();
        for i in 0..bytes {
            map.insert(offset + i, (value >> (i * 8)) as u8);
        }
    }
}

impl Handler for TestHandler {
    fn read_u8(&self, address: usize) -> u8 {
        Self::read_bytes(&self.memory, address, 1) as u8
    }
    fn read_u16(&self, address: usize) -> u16 {
        Self::read_bytes(&self.memory, address, 2) as u16
    }
    fn read_u32(&self, address: usize) -> u32 {
        Self::read_bytes(&self.memory, address, 4) as u32
    }
    fn read_u64(&self, address: usize) -> u64 {
        Self::read_bytes(&self.memory, address, 8)
    }

    fn write_u8(&mut self, address: usize, value: u8) {
        Self::write_bytes(&self.memory, address, 1, value as u64)
    }
    fn write_u16(&mut self, address: usize, value: u16) {
        Self::write_bytes(&self.memory, address, 2, value as u64)
    }
    fn write_u32(&mut self, address: usize, value: u32) {
        Self::write_bytes(&self.memory, address, 4, value as u64)
    }
    fn write_u64(&mut self, address: usize, value: u64) {
        Self::write_bytes(&self.memory, address, 8, value)
    }

    fn read_io_u8(&self, port: u16) -> u8 {
        self.read_io_bytes(port, 1) as u8
    }
    fn read_io_u16(&self, port: u16) -> u16 {
        self.read_io_bytes(port, 2) as u16
    }
    fn read_io_u32(&self, port: u16) -> u32 {
        self.read_io_bytes(port, 4) as u32
    }

    fn write_io_u8(&self, port: u16, value: u8) {
        self.write_io_bytes(port, 1, value as u64)
    }
    fn write_io_u16(&self, port: u16, value: u16) {
        self.write_io_bytes(port, 2, value as u64)
    }
    fn write_io_u32(&self, port: u16, value: u32) {
        self.write_io_bytes(port, 4, value as u64)
    }

    fn read_pci_u8(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, offset: u16) -> u8 {
        self.read_pci_bytes(offset, 1) as u8
    }
    fn read_pci_u16(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, offset: u16) -> u16 {
        self.read_pci_bytes(offset, 2) as u16
    }
    fn read_pci_u32(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, offset: u16) -> u32 {
        self.read_pci_bytes(offset, 4) as u32
    }

    fn write_pci_u8(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, offset: u16, value: u8) {
        self.write_pci_bytes(offset, 1, value as u64)
    }
    fn write_pci_u16(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, offset: u16, value: u16) {
        self.write_pci_bytes(offset, 2, value as u64)
    }
    fn write_pci_u32(&self, _segment: u16, _bus: u8, _device: u8, _function: u8, offset: u16, value: u32) {
        self.write_pci_bytes(offset, 4, value as u64)
    }

    fn stall(&self, _microseconds: u64) {}

    fn sleep(&self, milliseconds: u64) {
        self.sleeps.lock().unwrap().push(milliseconds);
    }

    fn handle_fatal_error(&self, _fatal_type: u8, _fatal_code: u32, _fatal_arg: u64) {}
}

pub(crate) fn make_context() -> AmlContext {
    AmlContext::new(Box::new(TestHandler::new()))
}

/// A context whose handler records every `Sleep` duration it's asked for.
pub(crate) fn make_context_with_sleep_recorder() -> (AmlContext, Arc<Mutex<Vec<u64>>>) {
    let handler = TestHandler::new();
    let sleeps = handler.sleeps.clone();
    (AmlContext::new(Box::new(handler)), sleeps)
}
