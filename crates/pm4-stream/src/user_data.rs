//! Per-draw user data packing.
//!
//! Pipelines remap virtual user-data entries onto SPI user-data registers. The remapping always
//! assigns consecutive registers to consecutive mapped entries, so an update of any entry range
//! becomes at most one `SET_SH_REG` packet.

use pm4_protocol::{RegisterSpace, ShaderType};

use crate::chunk::CmdAllocator;
use crate::cmd_stream::{CmdCursor, CmdStream};

pub const MAX_USER_DATA_ENTRIES: usize = 64;

/// Virtual user-data entry to SH register mapping of one pipeline stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserDataEntryMap {
    regs: [Option<u32>; MAX_USER_DATA_ENTRIES],
}

impl Default for UserDataEntryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl UserDataEntryMap {
    pub fn new() -> Self {
        Self {
            regs: [None; MAX_USER_DATA_ENTRIES],
        }
    }

    /// Map `count` entries starting at `first_entry` onto consecutive registers from `first_reg`.
    pub fn with_range(mut self, first_entry: usize, first_reg: u32, count: usize) -> Self {
        for i in 0..count {
            self.map(first_entry + i, first_reg + i as u32);
        }
        self
    }

    pub fn map(&mut self, entry: usize, reg: u32) {
        assert!(
            RegisterSpace::Sh.contains(reg),
            "user data must map to SH registers, got 0x{reg:x}"
        );
        self.regs[entry] = Some(reg);
    }

    pub fn unmap(&mut self, entry: usize) {
        self.regs[entry] = None;
    }

    pub fn reg(&self, entry: usize) -> Option<u32> {
        self.regs[entry]
    }
}

/// Values for `values.len()` consecutive entries starting at `first_entry`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserDataArgs<'a> {
    pub first_entry: usize,
    pub values: &'a [u32],
}

impl<A: CmdAllocator> CmdStream<A> {
    /// Write the registers behind the updated entries. Unmapped entries are skipped.
    pub fn write_user_data_registers(
        &mut self,
        map: &UserDataEntryMap,
        args: &UserDataArgs<'_>,
        shader: ShaderType,
        cursor: CmdCursor,
    ) -> CmdCursor {
        assert!(
            args.first_entry + args.values.len() <= MAX_USER_DATA_ENTRIES,
            "user data entries {}..{} out of range",
            args.first_entry,
            args.first_entry + args.values.len()
        );
        if args.values.len() == 1 {
            self.write_user_data_registers_one(map, args, shader, cursor)
        } else {
            self.write_user_data_registers_many(map, args, shader, cursor)
        }
    }

    fn write_user_data_registers_one(
        &mut self,
        map: &UserDataEntryMap,
        args: &UserDataArgs<'_>,
        shader: ShaderType,
        cursor: CmdCursor,
    ) -> CmdCursor {
        match map.reg(args.first_entry) {
            Some(reg) => self.write_set_one_sh_reg(reg, args.values[0], shader, cursor),
            None => cursor,
        }
    }

    fn write_user_data_registers_many(
        &mut self,
        map: &UserDataEntryMap,
        args: &UserDataArgs<'_>,
        shader: ShaderType,
        cursor: CmdCursor,
    ) -> CmdCursor {
        // Track the last register and the number of mapped values rather than the first register,
        // so gaps in the entry mapping never split the register run.
        let mut packed = [0u32; MAX_USER_DATA_ENTRIES];
        let mut end_reg = 0;
        let mut count = 0;

        for (i, &value) in args.values.iter().enumerate() {
            let Some(reg) = map.reg(args.first_entry + i) else {
                continue;
            };
            assert!(
                count == 0 || reg == end_reg + 1,
                "user data entry {} maps to 0x{reg:x}, which does not follow 0x{end_reg:x}",
                args.first_entry + i
            );
            packed[count] = value;
            end_reg = reg;
            count += 1;
        }

        if count == 0 {
            return cursor;
        }
        let start_reg = end_reg + 1 - count as u32;
        self.write_set_seq_sh_regs(start_reg, end_reg, shader, &packed[..count], cursor)
    }

    /// Load the register behind `args.first_entry` from the user-data table; `args.values[0]` is
    /// the table offset.
    pub fn write_user_data_register_offset(
        &mut self,
        map: &UserDataEntryMap,
        args: &UserDataArgs<'_>,
        shader: ShaderType,
        cursor: CmdCursor,
    ) -> CmdCursor {
        match map.reg(args.first_entry) {
            Some(reg) => self.write_set_sh_reg_data_offset(reg, shader, args.values[0], cursor),
            None => cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_maps_consecutive_registers() {
        let map = UserDataEntryMap::new().with_range(2, 0x2C4C, 3);
        assert_eq!(map.reg(1), None);
        assert_eq!(map.reg(2), Some(0x2C4C));
        assert_eq!(map.reg(4), Some(0x2C4E));
        assert_eq!(map.reg(5), None);
    }

    #[test]
    #[should_panic(expected = "must map to SH registers")]
    fn context_register_cannot_hold_user_data() {
        UserDataEntryMap::new().map(0, 0xA000);
    }
}
