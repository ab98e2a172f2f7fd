//! Static command tables for the SD, SD application and MMC dialects.

use crate::{
    bit,
    card::CardFamily,
    common::*,
    sdhc::ll::{SDHC_TRANSFER_MODE_AUTO_CMD12, SDHC_TRANSFER_MODE_MULTI_BLOCK},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    None,
    CardToHost,
    HostToCard,
    /// Direction is taken from the data buffer handed to the engine.
    ChkBuffer,
}

pub const CMD_NEEDS_SELECTION: u8 = bit!(0);
pub const CMD_IS_APP: u8 = bit!(1);
pub const CMD_IGNORE_CMD_COMPLETE: u8 = bit!(2);
pub const CMD_IGNORE_XFER_COMPLETE: u8 = bit!(3);
pub const CMD_IGNORE_SELECTION_STATE: u8 = bit!(4);

const MULTI: u16 = SDHC_TRANSFER_MODE_MULTI_BLOCK | SDHC_TRANSFER_MODE_AUTO_CMD12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandEntry {
    pub index: u8,
    pub response: u8,
    pub direction: Direction,
    pub flags: u8,
    pub host_flags: u16,
    pub valid: bool,
}

impl CommandEntry {
    const fn new(index: u8, response: u8, direction: Direction, flags: u8, host_flags: u16) -> Self {
        Self {
            index,
            response,
            direction,
            flags,
            host_flags,
            valid: true,
        }
    }

    const fn invalid(index: u8) -> Self {
        Self {
            index,
            response: RSP_R0,
            direction: Direction::None,
            flags: 0,
            host_flags: 0,
            valid: false,
        }
    }

    pub const fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub const fn has_data(&self) -> bool {
        !matches!(self.direction, Direction::None)
    }
}

const fn entry(index: u8, response: u8, flags: u8) -> CommandEntry {
    CommandEntry::new(index, response, Direction::None, flags, 0)
}

const fn read(index: u8, flags: u8, host_flags: u16) -> CommandEntry {
    CommandEntry::new(index, RSP_R1D, Direction::CardToHost, flags, host_flags)
}

const fn write(index: u8, flags: u8, host_flags: u16) -> CommandEntry {
    CommandEntry::new(index, RSP_R1D, Direction::HostToCard, flags, host_flags)
}

const NS: u8 = CMD_NEEDS_SELECTION;

static MMC_COMMANDS: [CommandEntry; 26] = [
    entry(0, RSP_R0, 0),
    entry(1, RSP_R3, 0),
    entry(2, RSP_R2, 0),
    entry(3, RSP_R1, 0),
    entry(4, RSP_R0, 0),
    entry(5, RSP_R1B, 0),
    entry(6, RSP_R1B, NS),
    entry(7, RSP_R1B, 0),
    read(8, NS, 0),
    entry(9, RSP_R2, 0),
    entry(10, RSP_R2, 0),
    CommandEntry::new(11, RSP_R1, Direction::CardToHost, NS, 0),
    entry(12, RSP_R1, 0),
    entry(13, RSP_R1, 0),
    CommandEntry::invalid(14),
    entry(15, RSP_R0, 0),
    entry(16, RSP_R1, NS),
    read(17, NS, 0),
    read(18, NS, MULTI),
    CommandEntry::invalid(19),
    CommandEntry::new(20, RSP_R1, Direction::HostToCard, NS, 0),
    read(21, NS | CMD_IGNORE_CMD_COMPLETE | CMD_IGNORE_XFER_COMPLETE, 0),
    CommandEntry::invalid(22),
    entry(23, RSP_R1, NS),
    write(24, NS, 0),
    write(25, NS, MULTI),
];

static SD_COMMANDS: [CommandEntry; 60] = {
    let mut table = [CommandEntry::invalid(0); 60];
    let mut i = 0;
    while i < table.len() {
        table[i] = CommandEntry::invalid(i as u8);
        i += 1;
    }
    table[0] = entry(0, RSP_R0, 0);
    table[2] = entry(2, RSP_R2, 0);
    table[3] = entry(3, RSP_R6, 0);
    table[4] = entry(4, RSP_R0, 0);
    table[7] = entry(7, RSP_R1B, 0);
    table[8] = entry(8, RSP_R7, 0);
    table[9] = entry(9, RSP_R2, 0);
    table[10] = entry(10, RSP_R2, 0);
    table[11] = entry(11, RSP_R1, NS);
    table[12] = entry(12, RSP_R1B, NS);
    table[13] = entry(13, RSP_R1, 0);
    table[15] = entry(15, RSP_R0, 0);
    table[16] = entry(16, RSP_R1, NS);
    table[17] = read(17, NS, 0);
    table[18] = read(18, NS, MULTI);
    table[19] = read(19, NS, 0);
    table[20] = entry(20, RSP_R1B, NS);
    table[22] = entry(22, RSP_R1, NS);
    table[23] = entry(23, RSP_R1, NS);
    table[24] = write(24, NS, 0);
    table[25] = write(25, NS, MULTI);
    table[27] = write(27, NS, 0);
    table[28] = entry(28, RSP_R1B, NS);
    table[29] = entry(29, RSP_R1B, NS);
    table[30] = read(30, NS, 0);
    table[32] = entry(32, RSP_R1, NS);
    table[33] = entry(33, RSP_R1, NS);
    table[38] = entry(38, RSP_R1B, NS);
    table[42] = CommandEntry::new(42, RSP_R1, Direction::HostToCard, NS, 0);
    table[55] = entry(55, RSP_R1, CMD_IGNORE_SELECTION_STATE);
    table[56] = CommandEntry::new(56, RSP_R1, Direction::ChkBuffer, NS, 0);
    table
};

const APP: u8 = CMD_IS_APP;

// Commands that act on transfer-state cards keep NS so the engine selects
// the card before the CMD55 prefix.
static SD_APP_COMMANDS: [CommandEntry; 7] = [
    entry(SD_APP_SET_BUS_WIDTH, RSP_R1, APP | NS),
    read(SD_APP_SD_STATUS, APP | NS, 0),
    read(SD_APP_SEND_NUM_WR_BLOCKS, APP | NS, 0),
    entry(SD_APP_SET_WR_BLK_ERASE_COUNT, RSP_R1, APP | NS),
    entry(SD_APP_OP_COND, RSP_R3, APP),
    entry(SD_APP_SET_CLR_CARD_DETECT, RSP_R1, APP | NS),
    read(SD_APP_SEND_SCR, APP | NS, 0),
];

static INVALID: CommandEntry = CommandEntry::invalid(0xFF);

/// Resolves a command id for the given card family. Ids with
/// [`SD_APP_FLAG`] set select the SD application table.
pub fn lookup(family: CardFamily, id: u32) -> &'static CommandEntry {
    let index = (id & !SD_APP_FLAG) as usize;
    let found = match family {
        CardFamily::Mmc => MMC_COMMANDS.get(index).filter(|_| id & SD_APP_FLAG == 0),
        CardFamily::Sd200 | CardFamily::SdLegacy if id & SD_APP_FLAG != 0 => {
            SD_APP_COMMANDS.iter().find(|entry| entry.index as usize == index)
        }
        CardFamily::Sd200 | CardFamily::SdLegacy => SD_COMMANDS.get(index),
    };
    found.unwrap_or(&INVALID)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_flag_selects_secondary_table() {
        let op_cond = lookup(CardFamily::Sd200, app(SD_APP_OP_COND));
        assert!(op_cond.valid);
        assert_eq!(op_cond.response, RSP_R3);
        assert!(op_cond.has_flag(CMD_IS_APP));

        // CMD41 without the prefix bit is not a plain SD command
        assert!(!lookup(CardFamily::Sd200, SD_APP_OP_COND as u32).valid);
    }

    #[test]
    fn mmc_has_no_application_commands() {
        assert!(!lookup(CardFamily::Mmc, app(SD_APP_OP_COND)).valid);
        assert!(!lookup(CardFamily::Mmc, 14).valid);
        assert!(!lookup(CardFamily::Mmc, 40).valid);
    }

    #[test]
    fn send_if_cond_and_ext_csd_share_an_index() {
        let sd = lookup(CardFamily::SdLegacy, SD_SEND_IF_COND as u32);
        assert_eq!(sd.response, RSP_R7);
        assert!(!sd.has_data());

        let mmc = lookup(CardFamily::Mmc, MMC_SEND_EXT_CSD as u32);
        assert_eq!(mmc.direction, Direction::CardToHost);
        assert!(mmc.has_flag(CMD_NEEDS_SELECTION));
    }

    #[test]
    fn select_waits_for_busy_in_every_family() {
        for family in [CardFamily::Sd200, CardFamily::SdLegacy, CardFamily::Mmc] {
            assert_eq!(lookup(family, MMC_SELECT_CARD as u32).response, RSP_R1B);
        }
    }

    #[test]
    fn multi_block_commands_carry_auto_stop() {
        for family in [CardFamily::Sd200, CardFamily::Mmc] {
            let entry = lookup(family, MMC_WRITE_BLOCK_MULTIPLE as u32);
            assert_eq!(entry.host_flags, MULTI);
            assert_eq!(entry.direction, Direction::HostToCard);
        }
    }

    #[test]
    fn tuning_ignores_completion_interrupts() {
        let entry = lookup(CardFamily::Mmc, MMC_SEND_TUNING_BLOCK as u32);
        assert!(entry.has_flag(CMD_IGNORE_CMD_COMPLETE));
        assert!(entry.has_flag(CMD_IGNORE_XFER_COMPLETE));
    }

    #[test]
    fn app_prefix_ignores_selection() {
        let entry = lookup(CardFamily::Sd200, MMC_APP_CMD as u32);
        assert!(entry.has_flag(CMD_IGNORE_SELECTION_STATE));
    }
}
