//! Card identity: family, CID/CSD/extended CSD/SCR decoding and the values
//! bring-up derives from them.
//!
//! CID and CSD arrive through the 136-bit response path, which drops the CRC
//! byte, so every bit position below is the register position minus 8.

use crate::Error;

mod cmd;
mod common;
mod init;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardFamily {
    /// SD card compliant with physical layer 2.00 or later.
    Sd200,
    /// SD card that ignored the interface condition check.
    SdLegacy,
    /// MMC or eMMC device.
    Mmc,
}

impl CardFamily {
    pub fn is_sd(&self) -> bool {
        !matches!(self, Self::Mmc)
    }
}

pub(crate) fn raw_response(response: [u32; 4]) -> u128 {
    response
        .iter()
        .rev()
        .fold(0u128, |raw, word| raw << 32 | *word as u128)
}

fn bits(raw: u128, lsb: u32, width: u32) -> u32 {
    ((raw >> lsb) & ((1u128 << width) - 1)) as u32
}

fn name_from(raw: u128, top_lsb: u32, out: &mut [u8]) {
    for (i, c) in out.iter_mut().enumerate() {
        *c = bits(raw, top_lsb - 8 * i as u32, 8) as u8;
    }
}

fn name_str(name: &[u8]) -> &str {
    core::str::from_utf8(name)
        .unwrap_or("")
        .trim_end_matches(['\0', ' '])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdCid {
    pub manufacturer_id: u8,
    pub oem_id: u16,
    pub name: [u8; 5],
    pub revision: u8,
    pub serial: u32,
    pub month: u8,
    pub year: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmcCid {
    pub manufacturer_id: u8,
    /// Device type: 0 removable card, 1 BGA (embedded), 2 POP.
    pub card_bga: u8,
    pub oem_id: u8,
    pub name: [u8; 6],
    pub revision: u8,
    pub serial: u32,
    pub month: u8,
    pub year: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cid {
    Sd(SdCid),
    Mmc(MmcCid),
}

impl Cid {
    pub fn parse(family: CardFamily, raw: u128) -> Self {
        if family.is_sd() {
            let mut name = [0u8; 5];
            name_from(raw, 88, &mut name);
            let date = bits(raw, 0, 12);
            Cid::Sd(SdCid {
                manufacturer_id: bits(raw, 112, 8) as u8,
                oem_id: bits(raw, 96, 16) as u16,
                name,
                revision: bits(raw, 48, 8) as u8,
                serial: bits(raw, 16, 32),
                month: (date & 0xF) as u8,
                year: 2000 + (date >> 4) as u16,
            })
        } else {
            let mut name = [0u8; 6];
            name_from(raw, 88, &mut name);
            Cid::Mmc(MmcCid {
                manufacturer_id: bits(raw, 112, 8) as u8,
                card_bga: bits(raw, 104, 2) as u8,
                oem_id: bits(raw, 96, 8) as u8,
                name,
                revision: bits(raw, 40, 8) as u8,
                serial: bits(raw, 8, 32),
                month: bits(raw, 4, 4) as u8,
                year: 1997 + bits(raw, 0, 4) as u16,
            })
        }
    }

    pub fn manufacturer_id(&self) -> u8 {
        match self {
            Cid::Sd(cid) => cid.manufacturer_id,
            Cid::Mmc(cid) => cid.manufacturer_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Cid::Sd(cid) => name_str(&cid.name),
            Cid::Mmc(cid) => name_str(&cid.name),
        }
    }

    pub fn serial(&self) -> u32 {
        match self {
            Cid::Sd(cid) => cid.serial,
            Cid::Mmc(cid) => cid.serial,
        }
    }

    pub fn revision(&self) -> u8 {
        match self {
            Cid::Sd(cid) => cid.revision,
            Cid::Mmc(cid) => cid.revision,
        }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, Cid::Mmc(cid) if cid.card_bga == 1)
    }

    pub fn vendor(&self) -> &'static str {
        let table = match self {
            Cid::Sd(_) => SD_VENDORS,
            Cid::Mmc(_) => MMC_VENDORS,
        };
        table
            .iter()
            .find(|(id, _)| *id == self.manufacturer_id())
            .map_or("Generic", |&(_, name)| name)
    }
}

static SD_VENDORS: &[(u8, &str)] = &[
    (0x01, "Panasonic"),
    (0x02, "Toshiba/Kingston/Viking"),
    (0x03, "SanDisk"),
    (0x08, "Silicon Power"),
    (0x18, "Infineon"),
    (0x1B, "Transcend"),
    (0x1C, "Transcend"),
    (0x1D, "Corsair"),
    (0x1E, "Transcend"),
    (0x1F, "Kingston"),
    (0x28, "Lexar"),
    (0x30, "SanDisk"),
    (0x33, "STMicroelectronics"),
    (0x41, "Kingston"),
    (0x6F, "STMicroelectronics"),
];

static MMC_VENDORS: &[(u8, &str)] = &[
    (0x00, "SanDisk"),
    (0x02, "Kingston/SanDisk"),
    (0x03, "Toshiba"),
    (0x11, "Toshiba"),
    (0x13, "Micron"),
    (0x15, "Samsung/SanDisk/LG"),
    (0x37, "KingMax"),
    (0x44, "SanDisk"),
    (0x2C, "Kingston"),
    (0x70, "Kingston"),
    (0x90, "Hynix"),
];

const CSD_STRUCTURE_V1: u32 = 0;
const CSD_STRUCTURE_V2: u32 = 1;
const CSD_STRUCTURE_V3: u32 = 2;

const MMC_TRAN_SPEED_20MHZ: u32 = 0x2A;
const MMC_TRAN_SPEED_26MHZ: u32 = 0x32;

/// CSD decoded through the layout its structure field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Csd {
    SdV1 {
        c_size: u32,
        c_size_mult: u32,
        read_bl_len: u32,
    },
    SdV2 {
        c_size: u32,
    },
    SdV3 {
        c_size: u32,
    },
    Mmc {
        spec_version: u32,
        c_size: u32,
        c_size_mult: u32,
        read_bl_len: u32,
        tran_speed: u32,
    },
}

impl Csd {
    /// Legacy SD cards always use the 1.0 layout, whatever the structure
    /// field claims.
    pub fn parse(family: CardFamily, raw: u128) -> Result<Self, Error> {
        let structure = bits(raw, 118, 2);
        let v1 = || Csd::SdV1 {
            c_size: bits(raw, 54, 12),
            c_size_mult: bits(raw, 39, 3),
            read_bl_len: bits(raw, 72, 4),
        };
        Ok(match family {
            CardFamily::Mmc => Csd::Mmc {
                spec_version: bits(raw, 114, 4),
                c_size: bits(raw, 54, 12),
                c_size_mult: bits(raw, 39, 3),
                read_bl_len: bits(raw, 72, 4),
                tran_speed: bits(raw, 88, 8),
            },
            CardFamily::SdLegacy => v1(),
            CardFamily::Sd200 => match structure {
                CSD_STRUCTURE_V1 => v1(),
                CSD_STRUCTURE_V2 => Csd::SdV2 {
                    c_size: bits(raw, 40, 22),
                },
                CSD_STRUCTURE_V3 => Csd::SdV3 {
                    c_size: bits(raw, 40, 28),
                },
                _ => Err(Error::InvalidResponse)?,
            },
        })
    }

    pub fn capacity_bytes(&self) -> u64 {
        match *self {
            Csd::SdV1 {
                c_size,
                c_size_mult,
                read_bl_len,
            }
            | Csd::Mmc {
                c_size,
                c_size_mult,
                read_bl_len,
                ..
            } => (c_size as u64 + 1) << (c_size_mult + 2) << read_bl_len,
            Csd::SdV2 { c_size } | Csd::SdV3 { c_size } => (c_size as u64 + 1) * 512 * 1024,
        }
    }

    pub fn block_count(&self) -> u64 {
        self.capacity_bytes() / crate::common::BLOCK_SIZE as u64
    }

    /// Highest default-speed clock; only MMC encodes one.
    pub fn max_clock_hz(&self) -> Option<u32> {
        match *self {
            Csd::Mmc { tran_speed, .. } => Some(match tran_speed {
                MMC_TRAN_SPEED_20MHZ => crate::common::CLOCK_MMC_DEFAULT,
                MMC_TRAN_SPEED_26MHZ => crate::common::CLOCK_MMC_26,
                _ => crate::common::CLOCK_MMC_DEFAULT,
            }),
            _ => None,
        }
    }

    pub fn mmc_spec_version(&self) -> Option<u32> {
        match *self {
            Csd::Mmc { spec_version, .. } => Some(spec_version),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtCsd {
    pub sector_count: u32,
    pub device_type: u8,
    pub bus_width: u8,
    pub hs_timing: u8,
    pub csd_structure: u8,
    pub revision: u8,
    pub driver_strength: u8,
}

impl ExtCsd {
    pub fn parse(raw: &[u8; crate::common::EXT_CSD_LEN]) -> Self {
        use crate::common::*;
        let sec = &raw[EXT_CSD_SEC_COUNT..EXT_CSD_SEC_COUNT + 4];
        Self {
            sector_count: u32::from_le_bytes([sec[0], sec[1], sec[2], sec[3]]),
            device_type: raw[EXT_CSD_DEVICE_TYPE],
            bus_width: raw[EXT_CSD_BUS_WIDTH],
            hs_timing: raw[EXT_CSD_HS_TIMING],
            csd_structure: raw[EXT_CSD_STRUCTURE],
            revision: raw[EXT_CSD_REV],
            driver_strength: raw[EXT_CSD_DRIVER_STRENGTH],
        }
    }
}

/// SD configuration register, as the card sends it (big-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scr(pub u64);

impl Scr {
    pub fn parse(raw: &[u8; crate::common::SCR_LEN]) -> Self {
        Self(u64::from_be_bytes(*raw))
    }

    pub fn structure(&self) -> u8 {
        (self.0 >> 60) as u8 & 0xF
    }

    pub fn spec_version(&self) -> u8 {
        (self.0 >> 56) as u8 & 0xF
    }

    pub fn bus_widths(&self) -> u8 {
        (self.0 >> 48) as u8 & 0xF
    }
}

/// Everything learnt about the card during the last bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardIdentity {
    pub family: CardFamily,
    pub rca: u16,
    pub embedded: bool,
    pub high_capacity: bool,
    pub raw_cid: u128,
    pub cid: Option<Cid>,
    pub csd: Option<Csd>,
    pub ext_csd: Option<ExtCsd>,
    pub scr: Option<Scr>,
    pub block_count: u64,
    pub max_std_clock: u32,
}

impl Default for CardIdentity {
    fn default() -> Self {
        Self {
            family: CardFamily::Sd200,
            rca: 0,
            embedded: false,
            high_capacity: false,
            raw_cid: 0,
            cid: None,
            csd: None,
            ext_csd: None,
            scr: None,
            block_count: 0,
            max_std_clock: crate::common::CLOCK_SD_DEFAULT,
        }
    }
}
