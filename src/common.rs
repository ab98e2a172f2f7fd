#![allow(dead_code)]

use crate::bit;

pub const MMC_GO_IDLE_STATE: u8 = 0; /* R0 */
pub const MMC_SEND_OP_COND: u8 = 1; /* R3 */
pub const MMC_ALL_SEND_CID: u8 = 2; /* R2 */
pub const MMC_SET_RELATIVE_ADDR: u8 = 3; /* R1 */
pub const MMC_SET_DSR: u8 = 4; /* R0 */
pub const MMC_SLEEP_AWAKE: u8 = 5; /* R1B */
pub const MMC_SWITCH: u8 = 6; /* R1B */
pub const MMC_SELECT_CARD: u8 = 7; /* R1 */
pub const MMC_SEND_EXT_CSD: u8 = 8; /* R1 */
pub const MMC_SEND_CSD: u8 = 9; /* R2 */
pub const MMC_SEND_CID: u8 = 10; /* R2 */
pub const MMC_READ_DAT_UNTIL_STOP: u8 = 11; /* R1 */
pub const MMC_STOP_TRANSMISSION: u8 = 12; /* R1 */
pub const MMC_SEND_STATUS: u8 = 13; /* R1 */
pub const MMC_GO_INACTIVE_STATE: u8 = 15; /* R0 */
pub const MMC_SET_BLOCKLEN: u8 = 16; /* R1 */
pub const MMC_READ_BLOCK_SINGLE: u8 = 17; /* R1 */
pub const MMC_READ_BLOCK_MULTIPLE: u8 = 18; /* R1 */
pub const MMC_WRITE_DAT_UNTIL_STOP: u8 = 20; /* R1 */
pub const MMC_SEND_TUNING_BLOCK: u8 = 21; /* R1 */
pub const MMC_SET_BLOCK_COUNT: u8 = 23; /* R1 */
pub const MMC_WRITE_BLOCK_SINGLE: u8 = 24; /* R1 */
pub const MMC_WRITE_BLOCK_MULTIPLE: u8 = 25; /* R1 */
pub const MMC_APP_CMD: u8 = 55; /* R1 */

/* SD commands */
pub const SD_SEND_RELATIVE_ADDR: u8 = 3; /* R6 */
pub const SD_SWITCH_FUNC: u8 = 6; /* R1 */
pub const SD_SEND_IF_COND: u8 = 8; /* R7 */
pub const SD_SEND_TUNING_BLOCK: u8 = 19; /* R1 */
pub const SD_SPEED_CLASS_CONTROL: u8 = 20; /* R1B */
pub const SD_ERASE_GROUP_START: u8 = 32; /* R1 */
pub const SD_ERASE_GROUP_END: u8 = 33; /* R1 */
pub const SD_ERASE: u8 = 38; /* R1B */
pub const SD_GEN_CMD: u8 = 56; /* R1 */

/* SD application commands, selected by SD_APP_FLAG */
pub const SD_APP_FLAG: u32 = bit!(30);
pub const SD_APP_SET_BUS_WIDTH: u8 = 6; /* R1 */
pub const SD_APP_SD_STATUS: u8 = 13; /* R1 */
pub const SD_APP_SEND_NUM_WR_BLOCKS: u8 = 22; /* R1 */
pub const SD_APP_SET_WR_BLK_ERASE_COUNT: u8 = 23; /* R1 */
pub const SD_APP_OP_COND: u8 = 41; /* R3 */
pub const SD_APP_SET_CLR_CARD_DETECT: u8 = 42; /* R1 */
pub const SD_APP_SEND_SCR: u8 = 51; /* R1 */

pub const fn app(opcode: u8) -> u32 {
    SD_APP_FLAG | opcode as u32
}

/* command register response type bits */
pub const RSP_NONE: u8 = 0x00;
pub const RSP_136: u8 = 0x01;
pub const RSP_48: u8 = 0x02;
pub const RSP_48_BUSY: u8 = 0x03;
pub const RSP_CRC: u8 = bit!(3);
pub const RSP_INDEX: u8 = bit!(4);
pub const RSP_DATA: u8 = bit!(5);

pub const RSP_R0: u8 = RSP_NONE;
pub const RSP_R1: u8 = RSP_48 | RSP_CRC | RSP_INDEX;
pub const RSP_R1B: u8 = RSP_48_BUSY | RSP_CRC | RSP_INDEX;
pub const RSP_R1D: u8 = RSP_R1 | RSP_DATA;
pub const RSP_R2: u8 = RSP_136 | RSP_CRC;
pub const RSP_R3: u8 = RSP_48;
pub const RSP_R6: u8 = RSP_R1;
pub const RSP_R7: u8 = RSP_R1;

/* R1 card status */
pub const MMC_R1_READY_FOR_DATA: u32 = bit!(8);
pub const MMC_R1_APP_CMD: u32 = bit!(5);
pub const MMC_R1_SWITCH_ERROR: u32 = bit!(7);

/* OCR */
pub const OCR_BUSY: u32 = bit!(31);
pub const OCR_CCS: u32 = bit!(30);
pub const OCR_VOLTAGE_MASK: u32 = 0x00FF_8000;
pub const SD_OCR_INIT: u32 = OCR_CCS | OCR_VOLTAGE_MASK;
pub const SD_OCR_INIT_LEGACY: u32 = OCR_VOLTAGE_MASK;
pub const MMC_OCR_INIT: u32 = 0x40FF_8000;
pub const MMC_OCR_SECTOR_MODE: u32 = bit!(30);

pub const SD_IF_COND_CHECK: u32 = 0x1AA;

/* MMC switch argument */
pub const MMC_SWITCH_MODE_WRITE_BYTE: u8 = 3;

/* Ext CSD byte indices */
pub const EXT_CSD_BUS_WIDTH: usize = 183;
pub const EXT_CSD_HS_TIMING: usize = 185;
pub const EXT_CSD_REV: usize = 192;
pub const EXT_CSD_STRUCTURE: usize = 194;
pub const EXT_CSD_DEVICE_TYPE: usize = 196;
pub const EXT_CSD_DRIVER_STRENGTH: usize = 197;
pub const EXT_CSD_SEC_COUNT: usize = 212;

pub const EXT_CSD_BUS_WIDTH_1: u8 = 0;
pub const EXT_CSD_BUS_WIDTH_4: u8 = 1;
pub const EXT_CSD_BUS_WIDTH_8: u8 = 2;

pub const EXT_CSD_TIMING_LEGACY: u8 = 0;
pub const EXT_CSD_TIMING_HS: u8 = 1;
pub const EXT_CSD_TIMING_HS200: u8 = 2;
pub const EXT_CSD_TIMING_HS400: u8 = 3;
pub const EXT_CSD_DRIVER_TYPE_SHIFT: u8 = 4;

pub const EXT_CSD_CARD_TYPE_HS_26: u8 = bit!(0);
pub const EXT_CSD_CARD_TYPE_HS_52: u8 = bit!(1);
pub const EXT_CSD_CARD_TYPE_DDR_1_8V: u8 = bit!(2);
pub const EXT_CSD_CARD_TYPE_DDR_1_2V: u8 = bit!(3);
pub const EXT_CSD_CARD_TYPE_HS200_1_8V: u8 = bit!(4);
pub const EXT_CSD_CARD_TYPE_HS200_1_2V: u8 = bit!(5);
pub const EXT_CSD_CARD_TYPE_HS400_1_8V: u8 = bit!(6);
pub const EXT_CSD_CARD_TYPE_HS400_1_2V: u8 = bit!(7);
pub const EXT_CSD_CARD_TYPE_HS200: u8 = EXT_CSD_CARD_TYPE_HS200_1_8V
    | EXT_CSD_CARD_TYPE_HS200_1_2V
    | EXT_CSD_CARD_TYPE_HS400_1_8V
    | EXT_CSD_CARD_TYPE_HS400_1_2V;

/* SCR bus widths */
pub const SCR_BUS_WIDTH_1: u8 = bit!(0);
pub const SCR_BUS_WIDTH_4: u8 = bit!(2);
pub const SD_BUS_WIDTH_ARG_1: u32 = 0;
pub const SD_BUS_WIDTH_ARG_4: u32 = 2;

/* clocks */
pub const KHZ: u32 = 1000;
pub const MHZ: u32 = KHZ * 1000;
pub const CLOCK_INIT: u32 = 400 * KHZ;
pub const CLOCK_SD_DEFAULT: u32 = 25 * MHZ;
pub const CLOCK_MMC_DEFAULT: u32 = 20 * MHZ;
pub const CLOCK_MMC_26: u32 = 26 * MHZ;
pub const CLOCK_MMC_HS_52: u32 = 52 * MHZ;
pub const CLOCK_MMC_HS200: u32 = 200 * MHZ;

/* timeouts in ms */
pub const TIMEOUT_2S: u64 = 2_000;
pub const TIMEOUT_10S: u64 = 10_000;
pub const TIMEOUT_30S: u64 = 30_000;
pub const TIMEOUT_120S: u64 = 120_000;
/* longest accepted command timeout, one day */
pub const TIMEOUT_MAX: u64 = 86_400_000;

/* transfer geometry */
pub const BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCKS_PER_TRANSFER: u32 = 61_440;
pub const SDMA_SEGMENT: usize = 0x1000;
pub const PAGE_SIZE: usize = 0x1000;
pub const ADMA2_DESCRIPTORS: usize = MAX_BLOCKS_PER_TRANSFER as usize * BLOCK_SIZE as usize / PAGE_SIZE;
pub const POOL_SIZE: usize = 10;

pub const EXT_CSD_LEN: usize = 512;
pub const SCR_LEN: usize = 8;
pub const TUNING_BLOCK_4BIT: u32 = 64;
pub const TUNING_BLOCK_8BIT: u32 = 128;
pub const TUNING_MAX_ROUNDS: u32 = 40;

/* relative address handed to MMC cards */
pub const MMC_RCA: u16 = 1;
