use crate::error::{CtrlError, Result};

const REG_BYTES: u32 = 4;

/// 32-bit register access to a block.
///
/// `timestamp` schedules the first transaction of a call at a device time
/// (in timebase ticks); `None` executes as soon as possible. Writes only
/// wait for the device when `ack` is set.
pub trait RegisterIface {
    /// Write one register.
    fn poke32(&self, addr: u32, data: u32, timestamp: Option<u64>, ack: bool) -> Result<()>;

    /// Read one register.
    fn peek32(&self, addr: u32, timestamp: Option<u64>) -> Result<u32>;

    /// Stall the command queue for `ticks` timebase ticks.
    fn sleep(&self, ticks: u32, ack: bool) -> Result<()>;

    /// Write a list of registers. Only the first write is timed and only
    /// the last one is acknowledged.
    fn multi_poke32(&self, addrs: &[u32], data: &[u32], timestamp: Option<u64>, ack: bool) -> Result<()> {
        if addrs.len() != data.len() {
            return Err(CtrlError::InvalidArgument(format!(
                "{} addresses for {} data words",
                addrs.len(),
                data.len()
            )));
        }
        let last = data.len().saturating_sub(1);
        for (i, (addr, value)) in addrs.iter().zip(data).enumerate() {
            let ts = if i == 0 { timestamp } else { None };
            self.poke32(*addr, *value, ts, ack && i == last)?;
        }
        Ok(())
    }

    /// Write consecutive registers starting at `first_addr`.
    fn block_poke32(&self, first_addr: u32, data: &[u32], timestamp: Option<u64>, ack: bool) -> Result<()> {
        let addrs: Vec<u32> = (0..data.len() as u32)
            .map(|i| first_addr + i * REG_BYTES)
            .collect();
        self.multi_poke32(&addrs, data, timestamp, ack)
    }

    /// Read `length` consecutive registers starting at `first_addr`.
    fn block_peek32(&self, first_addr: u32, length: usize, timestamp: Option<u64>) -> Result<Vec<u32>> {
        (0..length as u32)
            .map(|i| {
                let ts = if i == 0 { timestamp } else { None };
                self.peek32(first_addr + i * REG_BYTES, ts)
            })
            .collect()
    }
}
